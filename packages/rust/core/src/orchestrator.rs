//! One check of one job: fetch → hash → compare → (skip or analyze) →
//! persist → notify.
//!
//! Every step failure after the run is opened is recorded on the run as
//! `failed` and reported as [`RunOutcome::Failed`]; only a missing job or a
//! storage failure while recording the outcome surfaces as `Err`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use riskwatch_analyzer::RiskAnalyzer;
use riskwatch_fetcher::{ContentFetcher, RawImage};
use riskwatch_shared::{Job, JobId, JobState, Result, RiskLevel, RiskwatchError, Run, RunId};
use riskwatch_storage::{RunCompletion, Storage};

use crate::hash::content_hash;
use crate::notifier::{Notifier, RiskNotification};
use crate::scheduler::JobRunner;

/// Result of [`RunOrchestrator::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The job is paused; no run was created.
    Skipped,
    Succeeded { run_id: RunId, risk_level: RiskLevel },
    Failed { run_id: RunId, error: String },
}

/// Flatten fetcher image entries to URLs, dropping entries without one.
pub fn normalize_images(images: Vec<RawImage>) -> Vec<String> {
    images.into_iter().filter_map(RawImage::into_src).collect()
}

// ---------------------------------------------------------------------------
// RunOrchestrator
// ---------------------------------------------------------------------------

/// Runs checks against the configured collaborators.
pub struct RunOrchestrator {
    storage: Arc<Storage>,
    fetcher: Arc<dyn ContentFetcher>,
    analyzer: Arc<dyn RiskAnalyzer>,
    notifier: Arc<dyn Notifier>,
}

impl RunOrchestrator {
    pub fn new(
        storage: Arc<Storage>,
        fetcher: Arc<dyn ContentFetcher>,
        analyzer: Arc<dyn RiskAnalyzer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            storage,
            fetcher,
            analyzer,
            notifier,
        }
    }

    /// Run one check of `job_id`.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn execute(&self, job_id: &JobId) -> Result<RunOutcome> {
        let job = self
            .storage
            .get_job(job_id)
            .await?
            .ok_or_else(|| RiskwatchError::job_not_found(job_id))?;

        if !job.is_active() {
            debug!("job paused, skipping");
            return Ok(RunOutcome::Skipped);
        }

        let run = self.storage.open_run(&job.id).await?;

        match self.check(&job, &run).await {
            Ok(risk_level) => Ok(RunOutcome::Succeeded {
                run_id: run.id,
                risk_level,
            }),
            Err(e) => {
                let message = e.to_string();
                self.storage
                    .fail_run(&run.id, Utc::now(), &message)
                    .await?;
                Ok(RunOutcome::Failed {
                    run_id: run.id,
                    error: message,
                })
            }
        }
    }

    async fn check(&self, job: &Job, run: &Run) -> Result<RiskLevel> {
        let content = self.fetcher.fetch(&job.url, job.mode).await?;
        let images = normalize_images(content.images);
        let hash = content_hash(&content.text, &images);

        let previous = self.storage.get_job_state(&job.id).await?;

        if let Some(state) = previous
            .as_ref()
            .filter(|s| s.last_hash.as_deref() == Some(hash.as_str()))
        {
            let risk_level = state.last_risk_level.unwrap_or(RiskLevel::None);
            self.storage
                .complete_run(
                    &run.id,
                    &RunCompletion {
                        finished_at: Utc::now(),
                        risk_level,
                        flags: state.last_flags.clone().unwrap_or_default(),
                        evidence: state.last_evidence.clone().unwrap_or_default(),
                        content_hash: hash,
                        risk_at: state.last_risk_at,
                    },
                )
                .await?;
            debug!(%risk_level, "content unchanged, analysis skipped");
            return Ok(risk_level);
        }

        let assessment = self
            .analyzer
            .analyze(&job.url, &content.text, &images)
            .await?;

        let finished_at = Utc::now();
        let risk_level = assessment.risk_level;
        let risky = risk_level.is_risky();
        let risk_at = risky.then_some(finished_at);

        self.storage
            .complete_run(
                &run.id,
                &RunCompletion {
                    finished_at,
                    risk_level,
                    flags: assessment.flags.clone(),
                    evidence: assessment.evidence.clone(),
                    content_hash: hash.clone(),
                    risk_at,
                },
            )
            .await?;

        let last_notified_at = previous.and_then(|s| s.last_notified_at);
        let state = if risky {
            JobState {
                job_id: job.id.clone(),
                last_hash: Some(hash),
                last_risk_level: Some(risk_level),
                last_flags: Some(assessment.flags.clone()),
                last_evidence: Some(assessment.evidence.clone()),
                last_risk_at: risk_at,
                last_notified_at,
            }
        } else {
            JobState {
                job_id: job.id.clone(),
                last_hash: Some(hash),
                last_notified_at,
                ..JobState::default()
            }
        };
        self.storage.upsert_job_state(&state).await?;

        if risky {
            if let Some(webhook) = job.webhook_url.as_deref() {
                let payload = RiskNotification {
                    job_id: job.id.clone(),
                    run_id: run.id.clone(),
                    url: job.url.clone(),
                    risk_level,
                    flags: assessment.flags,
                    evidence: assessment.evidence,
                    timestamp: finished_at,
                };
                // NOTE: a delivery failure here turns an already-completed
                // `success` run into `failed`; the verdict stays on the row.
                self.notifier.deliver(webhook, &payload).await?;
                self.storage.mark_notified(&job.id, Utc::now()).await?;
                info!(%risk_level, "risk notification delivered");
            }
        }

        Ok(risk_level)
    }
}

#[async_trait]
impl JobRunner for RunOrchestrator {
    async fn run_job(&self, job_id: &JobId) {
        match self.execute(job_id).await {
            Ok(RunOutcome::Skipped) => {}
            Ok(RunOutcome::Succeeded { run_id, risk_level }) => {
                info!(%job_id, %run_id, %risk_level, "run succeeded");
            }
            Ok(RunOutcome::Failed { run_id, error }) => {
                warn!(%job_id, %run_id, %error, "run failed");
            }
            Err(e) => error!(%job_id, error = %e, "run could not be recorded"),
        }
    }
}
