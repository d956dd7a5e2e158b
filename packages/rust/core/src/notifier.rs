//! Webhook delivery of risk notifications.
//!
//! Delivery retries transport failures and non-2xx responses up to a fixed
//! attempt count, waiting `backoff_base * attempt` between attempts. Nothing
//! here touches storage.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use riskwatch_shared::{Evidence, JobId, NotifierConfig, Result, RiskLevel, RiskwatchError, RunId};

/// User-Agent string for webhook requests.
const USER_AGENT: &str = concat!("riskwatch/", env!("CARGO_PKG_VERSION"));

/// JSON body POSTed to a job's webhook when a run is risky.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskNotification {
    pub job_id: JobId,
    pub run_id: RunId,
    pub url: String,
    pub risk_level: RiskLevel,
    pub flags: Vec<String>,
    pub evidence: Vec<Evidence>,
    pub timestamp: DateTime<Utc>,
}

/// Delivers notifications to an endpoint.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, endpoint: &str, payload: &RiskNotification) -> Result<()>;
}

// ---------------------------------------------------------------------------
// WebhookNotifier
// ---------------------------------------------------------------------------

/// HTTP webhook notifier with linear backoff.
pub struct WebhookNotifier {
    client: Client,
    max_attempts: u32,
    backoff_base: Duration,
}

impl WebhookNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RiskwatchError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base(),
        })
    }

    async fn attempt(
        &self,
        endpoint: &str,
        payload: &RiskNotification,
    ) -> std::result::Result<(), String> {
        let response = self
            .client
            .post(endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {status}"))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip_all, fields(endpoint = %endpoint, run_id = %payload.run_id))]
    async fn deliver(&self, endpoint: &str, payload: &RiskNotification) -> Result<()> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.attempt(endpoint, payload).await {
                Ok(()) => {
                    debug!(attempt, "webhook delivered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "webhook attempt failed"
                    );
                    last_error = e;
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff_base * attempt).await;
            }
        }

        Err(RiskwatchError::Delivery {
            attempts: self.max_attempts,
            message: last_error,
        })
    }
}
