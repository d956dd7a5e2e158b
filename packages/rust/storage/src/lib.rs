//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding monitoring jobs,
//! their append-only run history, and the per-job change-detection state.
//!
//! **Access rules:**
//! - The scheduler/orchestrator process is the writer via [`Storage::open`]
//! - Inspection commands may use [`Storage::open_readonly`]
//!
//! Every operation is a single-row statement; nothing here needs a
//! cross-row transaction. Two writers never touch the same run or state row
//! because the scheduler serializes runs per job.

mod migrations;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use riskwatch_shared::{
    Evidence, Job, JobId, JobState, JobStatus, Result, RiskLevel, RiskwatchError, Run, RunId,
    RunStatus,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Terminal values written when a run closes successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub finished_at: DateTime<Utc>,
    pub risk_level: RiskLevel,
    pub flags: Vec<String>,
    pub evidence: Vec<Evidence>,
    pub content_hash: String,
    pub risk_at: Option<DateTime<Utc>>,
}

const JOB_COLUMNS: &str =
    "id, url, interval_secs, mode, webhook_url, status, created_at, updated_at";

const RUN_COLUMNS: &str = "id, job_id, started_at, finished_at, status, risk_level, flags, \
                           evidence, content_hash, risk_at, error";

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RiskwatchError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    RiskwatchError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(RiskwatchError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Job operations
    // -----------------------------------------------------------------------

    /// Insert a new job record.
    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO jobs (id, url, interval_secs, mode, webhook_url, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.id.to_string(),
                    job.url.as_str(),
                    job.interval_secs,
                    job.mode.as_str(),
                    job.webhook_url.as_deref(),
                    job.status.as_str(),
                    ts(&job.created_at),
                    ts(&job.updated_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List jobs, newest first, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut rows = match status {
            Some(status) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at DESC"
                        ),
                        params![status.as_str()],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC"),
                        params![],
                    )
                    .await
            }
        }
        .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }

    /// Persist the mutable fields of `job` (interval, mode, webhook, status,
    /// `updated_at`). Returns `false` if no such job exists.
    pub async fn update_job(&self, job: &Job) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs
                 SET interval_secs = ?1, mode = ?2, webhook_url = ?3, status = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    job.interval_secs,
                    job.mode.as_str(),
                    job.webhook_url.as_deref(),
                    job.status.as_str(),
                    ts(&job.updated_at),
                    job.id.to_string(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Delete a job together with its runs and state. Returns `false` if
    /// the job did not exist.
    pub async fn delete_job(&self, id: &JobId) -> Result<bool> {
        self.check_writable()?;
        let id = id.to_string();
        for sql in [
            "DELETE FROM runs WHERE job_id = ?1",
            "DELETE FROM job_state WHERE job_id = ?1",
        ] {
            self.conn
                .execute(sql, params![id.as_str()])
                .await
                .map_err(db_err)?;
        }
        let deleted = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.as_str()])
            .await
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    // -----------------------------------------------------------------------
    // Run operations
    // -----------------------------------------------------------------------

    /// Open a new run for `job_id` in `running` state, started now.
    pub async fn open_run(&self, job_id: &JobId) -> Result<Run> {
        self.check_writable()?;
        let run = Run {
            id: RunId::new(),
            job_id: job_id.clone(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            risk_level: None,
            flags: Vec::new(),
            evidence: Vec::new(),
            content_hash: None,
            risk_at: None,
            error: None,
        };
        self.conn
            .execute(
                "INSERT INTO runs (id, job_id, started_at, status) VALUES (?1, ?2, ?3, ?4)",
                params![
                    run.id.to_string(),
                    job_id.to_string(),
                    ts(&run.started_at),
                    run.status.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(run)
    }

    /// Close a run as `success` with its verdict and content hash.
    pub async fn complete_run(&self, run_id: &RunId, done: &RunCompletion) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE runs
                 SET finished_at = ?1, status = ?2, risk_level = ?3, flags = ?4, evidence = ?5,
                     content_hash = ?6, risk_at = ?7
                 WHERE id = ?8",
                params![
                    ts(&done.finished_at),
                    RunStatus::Success.as_str(),
                    done.risk_level.as_str(),
                    to_json(&done.flags)?,
                    to_json(&done.evidence)?,
                    done.content_hash.as_str(),
                    done.risk_at.as_ref().map(ts),
                    run_id.to_string(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Move a run to `failed`. Only `status`, `finished_at`, and `error` are
    /// written; any verdict already recorded on the row is left in place.
    pub async fn fail_run(
        &self,
        run_id: &RunId,
        finished_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, status = ?2, error = ?3 WHERE id = ?4",
                params![
                    ts(&finished_at),
                    RunStatus::Failed.as_str(),
                    error,
                    run_id.to_string(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List up to `limit` runs for a job, newest first.
    pub async fn list_runs(&self, job_id: &JobId, limit: u32) -> Result<Vec<Run>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE job_id = ?1
                     ORDER BY started_at DESC, id DESC LIMIT ?2"
                ),
                params![job_id.to_string(), limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Job state operations
    // -----------------------------------------------------------------------

    /// Get the change-detection state for a job, if any run has completed.
    pub async fn get_job_state(&self, job_id: &JobId) -> Result<Option<JobState>> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_id, last_hash, last_risk_level, last_flags, last_evidence,
                        last_risk_at, last_notified_at
                 FROM job_state WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job_state(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Insert or fully replace the state row keyed by `state.job_id`.
    /// `None` fields are written as NULL.
    pub async fn upsert_job_state(&self, state: &JobState) -> Result<()> {
        self.check_writable()?;
        let flags = state.last_flags.as_ref().map(to_json).transpose()?;
        let evidence = state.last_evidence.as_ref().map(to_json).transpose()?;
        self.conn
            .execute(
                "INSERT INTO job_state (job_id, last_hash, last_risk_level, last_flags, last_evidence,
                                        last_risk_at, last_notified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(job_id) DO UPDATE SET
                   last_hash = excluded.last_hash,
                   last_risk_level = excluded.last_risk_level,
                   last_flags = excluded.last_flags,
                   last_evidence = excluded.last_evidence,
                   last_risk_at = excluded.last_risk_at,
                   last_notified_at = excluded.last_notified_at",
                params![
                    state.job_id.to_string(),
                    state.last_hash.as_deref(),
                    state.last_risk_level.map(|l| l.as_str()),
                    flags,
                    evidence,
                    state.last_risk_at.as_ref().map(ts),
                    state.last_notified_at.as_ref().map(ts),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a successful webhook delivery for a job.
    pub async fn mark_notified(&self, job_id: &JobId, at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE job_state SET last_notified_at = ?1 WHERE job_id = ?2",
                params![ts(&at), job_id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> RiskwatchError {
    RiskwatchError::Storage(e.to_string())
}

/// Fixed-width RFC 3339 so that lexical order matches chronological order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RiskwatchError::Storage(format!("invalid date {s:?}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| RiskwatchError::Storage(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| RiskwatchError::Storage(format!("invalid JSON column: {e}")))
}

fn parse_col<T>(s: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    s.parse()
        .map_err(|e: T::Err| RiskwatchError::Storage(e.to_string()))
}

fn text(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

fn opt_text(row: &libsql::Row, idx: i32) -> Result<Option<String>> {
    row.get::<Option<String>>(idx).map_err(db_err)
}

/// Convert a database row to a [`Job`].
fn row_to_job(row: &libsql::Row) -> Result<Job> {
    Ok(Job {
        id: parse_col(&text(row, 0)?)?,
        url: text(row, 1)?,
        interval_secs: row.get::<u32>(2).map_err(db_err)?,
        mode: parse_col(&text(row, 3)?)?,
        webhook_url: opt_text(row, 4)?,
        status: parse_col(&text(row, 5)?)?,
        created_at: parse_ts(&text(row, 6)?)?,
        updated_at: parse_ts(&text(row, 7)?)?,
    })
}

/// Convert a database row to a [`Run`].
fn row_to_run(row: &libsql::Row) -> Result<Run> {
    Ok(Run {
        id: parse_col(&text(row, 0)?)?,
        job_id: parse_col(&text(row, 1)?)?,
        started_at: parse_ts(&text(row, 2)?)?,
        finished_at: opt_text(row, 3)?.as_deref().map(parse_ts).transpose()?,
        status: parse_col(&text(row, 4)?)?,
        risk_level: opt_text(row, 5)?.as_deref().map(parse_col).transpose()?,
        flags: opt_text(row, 6)?
            .as_deref()
            .map(from_json)
            .transpose()?
            .unwrap_or_default(),
        evidence: opt_text(row, 7)?
            .as_deref()
            .map(from_json)
            .transpose()?
            .unwrap_or_default(),
        content_hash: opt_text(row, 8)?,
        risk_at: opt_text(row, 9)?.as_deref().map(parse_ts).transpose()?,
        error: opt_text(row, 10)?,
    })
}

/// Convert a database row to a [`JobState`].
fn row_to_job_state(row: &libsql::Row) -> Result<JobState> {
    Ok(JobState {
        job_id: parse_col(&text(row, 0)?)?,
        last_hash: opt_text(row, 1)?,
        last_risk_level: opt_text(row, 2)?.as_deref().map(parse_col).transpose()?,
        last_flags: opt_text(row, 3)?.as_deref().map(from_json).transpose()?,
        last_evidence: opt_text(row, 4)?.as_deref().map(from_json).transpose()?,
        last_risk_at: opt_text(row, 5)?.as_deref().map(parse_ts).transpose()?,
        last_notified_at: opt_text(row, 6)?.as_deref().map(parse_ts).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use riskwatch_shared::JobMode;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("rw_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn sample_job(status: JobStatus) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            url: "https://shop.example.com/".into(),
            interval_secs: 60,
            mode: JobMode::Static,
            webhook_url: Some("https://hooks.example.com/risk".into()),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    fn evidence() -> Vec<Evidence> {
        vec![Evidence {
            kind: "text".into(),
            snippet: "buy now cheap pills".into(),
            rationale: "sells medication without prescription".into(),
        }]
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("rw_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn job_crud() {
        let storage = test_storage().await;
        let job = sample_job(JobStatus::Active);
        storage.insert_job(&job).await.expect("insert job");

        let found = storage.get_job(&job.id).await.expect("get job").unwrap();
        assert_eq!(found.url, job.url);
        assert_eq!(found.mode, JobMode::Static);
        assert_eq!(found.webhook_url, job.webhook_url);
        assert_eq!(found.created_at, ts_roundtrip(job.created_at));

        let paused = sample_job(JobStatus::Paused);
        storage.insert_job(&paused).await.unwrap();

        assert_eq!(storage.list_jobs(None).await.unwrap().len(), 2);
        let active = storage.list_jobs(Some(JobStatus::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, job.id);

        let updated = Job {
            interval_secs: 120,
            status: JobStatus::Paused,
            webhook_url: None,
            updated_at: Utc::now(),
            ..found
        };
        assert!(storage.update_job(&updated).await.expect("update job"));
        let found = storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(found.interval_secs, 120);
        assert_eq!(found.status, JobStatus::Paused);
        assert!(found.webhook_url.is_none());

        assert!(storage.list_jobs(Some(JobStatus::Active)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_job_is_none() {
        let storage = test_storage().await;
        assert!(storage.get_job(&JobId::new()).await.unwrap().is_none());
        assert!(!storage.update_job(&sample_job(JobStatus::Active)).await.unwrap());
        assert!(!storage.delete_job(&JobId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn run_lifecycle() {
        let storage = test_storage().await;
        let job = sample_job(JobStatus::Active);
        storage.insert_job(&job).await.unwrap();

        let run = storage.open_run(&job.id).await.expect("open run");
        let stored = storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        assert!(stored.finished_at.is_none());
        assert!(stored.risk_level.is_none());

        let finished_at = Utc::now();
        let done = RunCompletion {
            finished_at,
            risk_level: RiskLevel::High,
            flags: vec!["pharmacy".into()],
            evidence: evidence(),
            content_hash: "abc123".into(),
            risk_at: Some(finished_at),
        };
        storage.complete_run(&run.id, &done).await.expect("complete run");

        let stored = storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.risk_level, Some(RiskLevel::High));
        assert_eq!(stored.flags, vec!["pharmacy".to_string()]);
        assert_eq!(stored.evidence, evidence());
        assert_eq!(stored.content_hash.as_deref(), Some("abc123"));
        assert_eq!(stored.risk_at, Some(ts_roundtrip(finished_at)));
    }

    #[tokio::test]
    async fn fail_after_complete_keeps_verdict() {
        let storage = test_storage().await;
        let job = sample_job(JobStatus::Active);
        storage.insert_job(&job).await.unwrap();
        let run = storage.open_run(&job.id).await.unwrap();

        let done = RunCompletion {
            finished_at: Utc::now(),
            risk_level: RiskLevel::High,
            flags: vec![],
            evidence: vec![],
            content_hash: "h".into(),
            risk_at: None,
        };
        storage.complete_run(&run.id, &done).await.unwrap();
        storage
            .fail_run(&run.id, Utc::now(), "delivery error after 3 attempt(s): HTTP 500")
            .await
            .expect("fail run");

        let stored = storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.risk_level, Some(RiskLevel::High));
        assert!(stored.error.unwrap().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn runs_listed_newest_first() {
        let storage = test_storage().await;
        let job = sample_job(JobStatus::Active);
        storage.insert_job(&job).await.unwrap();

        let first = storage.open_run(&job.id).await.unwrap();
        let second = storage.open_run(&job.id).await.unwrap();
        let third = storage.open_run(&job.id).await.unwrap();

        let runs = storage.list_runs(&job.id, 10).await.expect("list runs");
        let ids: Vec<_> = runs.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![third.id, second.id.clone(), first.id]);

        let limited = storage.list_runs(&job.id, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[1].id, second.id);
    }

    #[tokio::test]
    async fn job_state_upsert_and_clear() {
        let storage = test_storage().await;
        let job = sample_job(JobStatus::Active);
        storage.insert_job(&job).await.unwrap();

        assert!(storage.get_job_state(&job.id).await.unwrap().is_none());

        let risk_at = Utc::now() - Duration::minutes(5);
        let risky = JobState {
            job_id: job.id.clone(),
            last_hash: Some("h1".into()),
            last_risk_level: Some(RiskLevel::Low),
            last_flags: Some(vec!["gambling".into()]),
            last_evidence: Some(evidence()),
            last_risk_at: Some(risk_at),
            last_notified_at: None,
        };
        storage.upsert_job_state(&risky).await.expect("insert state");

        let stored = storage.get_job_state(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.last_risk_level, Some(RiskLevel::Low));
        assert_eq!(stored.last_evidence, Some(evidence()));
        assert_eq!(stored.last_risk_at, Some(ts_roundtrip(risk_at)));

        let notified_at = Utc::now();
        storage.mark_notified(&job.id, notified_at).await.unwrap();

        let clean = JobState {
            job_id: job.id.clone(),
            last_hash: Some("h2".into()),
            last_notified_at: Some(notified_at),
            ..JobState::default()
        };
        storage.upsert_job_state(&clean).await.expect("replace state");

        let stored = storage.get_job_state(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.last_hash.as_deref(), Some("h2"));
        assert!(stored.last_risk_level.is_none());
        assert!(stored.last_flags.is_none());
        assert!(stored.last_evidence.is_none());
        assert!(stored.last_risk_at.is_none());
        assert_eq!(stored.last_notified_at, Some(ts_roundtrip(notified_at)));
    }

    #[tokio::test]
    async fn delete_job_cascades() {
        let storage = test_storage().await;
        let job = sample_job(JobStatus::Active);
        storage.insert_job(&job).await.unwrap();
        let run = storage.open_run(&job.id).await.unwrap();
        storage
            .upsert_job_state(&JobState {
                job_id: job.id.clone(),
                last_hash: Some("h".into()),
                ..JobState::default()
            })
            .await
            .unwrap();

        assert!(storage.delete_job(&job.id).await.expect("delete job"));
        assert!(storage.get_job(&job.id).await.unwrap().is_none());
        assert!(storage.get_run(&run.id).await.unwrap().is_none());
        assert!(storage.get_job_state(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("rw_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_job(&sample_job(JobStatus::Active)).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.list_jobs(None).await.unwrap().len(), 1);
        let result = ro.insert_job(&sample_job(JobStatus::Active)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    /// Timestamps are stored at microsecond precision.
    fn ts_roundtrip(dt: DateTime<Utc>) -> DateTime<Utc> {
        parse_ts(&ts(&dt)).unwrap()
    }
}
