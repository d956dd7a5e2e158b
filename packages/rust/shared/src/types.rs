//! Core domain types for riskwatch jobs, runs, and per-job state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RiskwatchError;

/// Shortest permitted check interval, in seconds.
pub const MIN_INTERVAL_SECS: u32 = 30;

/// Longest permitted check interval (one day), in seconds.
pub const MAX_INTERVAL_SECS: u32 = 60 * 60 * 24;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// A UUID v7 identifier for monitoring jobs.
    JobId
);

uuid_id!(
    /// A UUID v7 identifier for runs (time-sortable, so ids order like `started_at`).
    RunId
);

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

macro_rules! str_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable lowercase name, as stored and serialized.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = RiskwatchError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(RiskwatchError::validation(format!(
                        "invalid {}: {other:?}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

/// How a job's page is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// Plain HTTP GET + HTML extraction.
    Static,
    /// Headless-browser rendering.
    Dynamic,
    /// Static first, rendered when the static result looks empty.
    #[default]
    Auto,
}

str_enum!(JobMode {
    Static => "static",
    Dynamic => "dynamic",
    Auto => "auto",
});

/// Whether a job is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Paused,
}

str_enum!(JobStatus {
    Active => "active",
    Paused => "paused",
});

/// Verdict produced by the risk analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    None,
    Low,
    High,
}

str_enum!(RiskLevel {
    None => "none",
    Low => "low",
    High => "high",
});

impl RiskLevel {
    /// `low` and `high` are risky; `none` is not.
    pub fn is_risky(&self) -> bool {
        matches!(self, Self::Low | Self::High)
    }
}

/// Lifecycle of a run: `running` until exactly one terminal update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

str_enum!(RunStatus {
    Running => "running",
    Success => "success",
    Failed => "failed",
});

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// One structured finding backing a risk verdict.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Evidence {
    /// Finding category (`text`, `image`, ...).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// The offending excerpt or image URL.
    #[serde(default)]
    pub snippet: String,
    /// Why the excerpt is considered risky.
    #[serde(default)]
    pub rationale: String,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A persistent subscription to periodically check one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Page to monitor.
    pub url: String,
    /// Seconds between checks, within [`MIN_INTERVAL_SECS`, `MAX_INTERVAL_SECS`].
    pub interval_secs: u32,
    pub mode: JobMode,
    /// Where risk notifications are POSTed. `None` disables delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Active
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub risk_level: Option<RiskLevel>,
    pub flags: Vec<String>,
    pub evidence: Vec<Evidence>,
    /// SHA-256 over the fetched text lines and image URLs.
    pub content_hash: Option<String>,
    /// When the current content was first assessed as risky.
    pub risk_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Per-job change-detection and carry-forward cache.
///
/// `last_risk_*` fields are only populated while the content at `last_hash`
/// is considered risky; a clean assessment of new content clears them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub last_hash: Option<String>,
    pub last_risk_level: Option<RiskLevel>,
    pub last_flags: Option<Vec<String>>,
    pub last_evidence: Option<Vec<Evidence>>,
    pub last_risk_at: Option<DateTime<Utc>>,
    pub last_notified_at: Option<DateTime<Utc>>,
}
