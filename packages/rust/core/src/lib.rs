//! Monitoring core for riskwatch.
//!
//! This crate ties the fetcher, analyzer, storage, and webhook delivery
//! together:
//! - [`hash`] — deterministic content hashing for change detection
//! - [`notifier`] — webhook delivery with linear backoff
//! - [`orchestrator`] — one check of one job, end to end
//! - [`scheduler`] — per-job recurring triggers with overlap prevention
//! - [`jobs`] — job management used by the CLI and the HTTP API

pub mod hash;
pub mod jobs;
pub mod notifier;
pub mod orchestrator;
pub mod scheduler;

pub use hash::content_hash;
pub use jobs::{JobPatch, JobService, NewJob, TriggerOutcome};
pub use notifier::{Notifier, RiskNotification, WebhookNotifier};
pub use orchestrator::{RunOrchestrator, RunOutcome, normalize_images};
pub use scheduler::{JobRunner, RECONCILE_INTERVAL, Scheduler};
