//! SQL migration definitions for the riskwatch database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: jobs, runs, job_state",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Monitoring subscriptions
CREATE TABLE IF NOT EXISTS jobs (
    id            TEXT PRIMARY KEY,
    url           TEXT NOT NULL,
    interval_secs INTEGER NOT NULL,
    mode          TEXT NOT NULL,
    webhook_url   TEXT,
    status        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

-- Append-only run history
CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    job_id       TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    status       TEXT NOT NULL,
    risk_level   TEXT,
    flags        TEXT,
    evidence     TEXT,
    content_hash TEXT,
    risk_at      TEXT,
    error        TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_job_started ON runs(job_id, started_at);

-- Change-detection / carry-forward cache, one row per job
CREATE TABLE IF NOT EXISTS job_state (
    job_id           TEXT PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
    last_hash        TEXT,
    last_risk_level  TEXT,
    last_flags       TEXT,
    last_evidence    TEXT,
    last_risk_at     TEXT,
    last_notified_at TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
