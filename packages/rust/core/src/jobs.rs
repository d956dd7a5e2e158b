//! Job management shared by the CLI and the HTTP API.
//!
//! Every mutation is persisted first and then mirrored into the
//! [`Scheduler`] (when one is running), so a status or interval change takes
//! effect before the next tick.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use url::Url;

use riskwatch_fetcher::normalize_target;
use riskwatch_shared::{
    Job, JobId, JobMode, JobStatus, MAX_INTERVAL_SECS, MIN_INTERVAL_SECS, Result, RiskwatchError,
    Run,
};
use riskwatch_storage::Storage;

use crate::scheduler::Scheduler;

/// Fields accepted when creating a job.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub url: String,
    pub interval_secs: u32,
    #[serde(default)]
    pub mode: JobMode,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPatch {
    pub interval_secs: Option<u32>,
    pub mode: Option<JobMode>,
    pub webhook_url: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobPatch {
    fn is_empty(&self) -> bool {
        self.interval_secs.is_none()
            && self.mode.is_none()
            && self.webhook_url.is_none()
            && self.status.is_none()
    }
}

/// What a manual trigger did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOutcome {
    /// A run was dispatched.
    Queued,
    /// A run for this job was already in flight; nothing new started.
    Coalesced,
}

// ---------------------------------------------------------------------------
// JobService
// ---------------------------------------------------------------------------

pub struct JobService {
    storage: Arc<Storage>,
    scheduler: Option<Arc<Scheduler>>,
    default_webhook: Option<String>,
}

impl JobService {
    /// `scheduler` is `None` for offline management (e.g. CLI commands
    /// against the database while no server is running).
    pub fn new(
        storage: Arc<Storage>,
        scheduler: Option<Arc<Scheduler>>,
        default_webhook: Option<String>,
    ) -> Self {
        Self {
            storage,
            scheduler,
            default_webhook,
        }
    }

    #[instrument(skip_all, fields(url = %new.url))]
    pub async fn create(&self, new: NewJob) -> Result<Job> {
        let url = validate_http_url("url", &new.url)?;
        validate_interval(new.interval_secs)?;
        let webhook_url = new
            .webhook_url
            .or_else(|| self.default_webhook.clone())
            .map(|w| validate_http_url("webhook_url", &w))
            .transpose()?;

        let now = now();
        let job = Job {
            id: JobId::new(),
            url,
            interval_secs: new.interval_secs,
            mode: new.mode,
            webhook_url,
            status: JobStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_job(&job).await?;

        if let Some(scheduler) = &self.scheduler {
            scheduler.schedule_job(&job.id, job.interval_secs).await;
        }
        info!(job_id = %job.id, interval_secs = job.interval_secs, "job created");
        Ok(job)
    }

    pub async fn get(&self, id: &JobId) -> Result<Job> {
        self.storage
            .get_job(id)
            .await?
            .ok_or_else(|| RiskwatchError::job_not_found(id))
    }

    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.storage.list_jobs(status).await
    }

    /// Apply `patch`, then reschedule an active job or drop a paused one's
    /// trigger.
    #[instrument(skip_all, fields(job_id = %id))]
    pub async fn update(&self, id: &JobId, patch: JobPatch) -> Result<Job> {
        let mut job = self.get(id).await?;

        if let Some(interval) = patch.interval_secs {
            validate_interval(interval)?;
        }
        let webhook_url = patch
            .webhook_url
            .as_deref()
            .map(|w| validate_http_url("webhook_url", w))
            .transpose()?;

        if !patch.is_empty() {
            if let Some(interval) = patch.interval_secs {
                job.interval_secs = interval;
            }
            if let Some(mode) = patch.mode {
                job.mode = mode;
            }
            if webhook_url.is_some() {
                job.webhook_url = webhook_url;
            }
            if let Some(status) = patch.status {
                job.status = status;
            }
            job.updated_at = now();

            if !self.storage.update_job(&job).await? {
                return Err(RiskwatchError::job_not_found(id));
            }
        }

        if let Some(scheduler) = &self.scheduler {
            if job.is_active() {
                scheduler.schedule_job(&job.id, job.interval_secs).await;
            } else {
                scheduler.remove_job(&job.id).await;
            }
        }
        info!(status = %job.status, interval_secs = job.interval_secs, "job updated");
        Ok(job)
    }

    /// Delete a job with its runs and state, and stop its trigger.
    #[instrument(skip_all, fields(job_id = %id))]
    pub async fn delete(&self, id: &JobId) -> Result<()> {
        if !self.storage.delete_job(id).await? {
            return Err(RiskwatchError::job_not_found(id));
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.remove_job(id).await;
        }
        info!("job deleted");
        Ok(())
    }

    /// Runs for a job, newest first.
    pub async fn list_runs(&self, id: &JobId, limit: u32) -> Result<Vec<Run>> {
        self.get(id).await?;
        self.storage.list_runs(id, limit).await
    }

    /// Fire-and-forget manual run sharing the job's in-flight guard.
    pub async fn trigger(&self, id: &JobId) -> Result<TriggerOutcome> {
        self.get(id).await?;
        let scheduler = self
            .scheduler
            .as_ref()
            .ok_or_else(|| RiskwatchError::config("no scheduler running"))?;

        Ok(if scheduler.run_now(id).await {
            TriggerOutcome::Queued
        } else {
            TriggerOutcome::Coalesced
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current time at the precision storage keeps, so returned jobs compare
/// equal to their stored form.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn validate_interval(secs: u32) -> Result<()> {
    if (MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&secs) {
        Ok(())
    } else {
        Err(RiskwatchError::validation(format!(
            "interval_secs must be between {MIN_INTERVAL_SECS} and {MAX_INTERVAL_SECS}, got {secs}"
        )))
    }
}

/// Parse `raw` as an absolute http(s) URL, assuming `https://` when the
/// scheme is omitted. Returns the normalized form.
fn validate_http_url(field: &str, raw: &str) -> Result<String> {
    let url: Url = normalize_target(raw)
        .map_err(|_| RiskwatchError::validation(format!("{field}: invalid URL {raw:?}")))?;

    if !matches!(url.scheme(), "http" | "https")
        || url.host_str().is_none()
        || !url.username().is_empty()
        || url.password().is_some()
    {
        return Err(RiskwatchError::validation(format!(
            "{field}: expected an http(s) URL, got {raw:?}"
        )));
    }
    Ok(url.to_string())
}
