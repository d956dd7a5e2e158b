//! Error types for riskwatch.
//!
//! Library crates use [`RiskwatchError`] via `thiserror`.
//! The app crate wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all riskwatch operations.
#[derive(Debug, thiserror::Error)]
pub enum RiskwatchError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The content source was unreachable or rejected the request.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// The risk classifier was unavailable or returned unparseable output.
    #[error("analysis error: {0}")]
    Analysis(String),

    /// Webhook delivery failed after exhausting every attempt.
    #[error("delivery error after {attempts} attempt(s): {message}")]
    Delivery { attempts: u32, message: String },

    /// No job exists with the given id.
    #[error("job not found: {id}")]
    JobNotFound { id: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error (interval bounds, malformed URL, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RiskwatchError>;

impl RiskwatchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error for a job id.
    pub fn job_not_found(id: impl std::fmt::Display) -> Self {
        Self::JobNotFound { id: id.to_string() }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = RiskwatchError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = RiskwatchError::validation("interval_secs must be between 30 and 86400");
        assert!(err.to_string().contains("between 30 and 86400"));

        let err = RiskwatchError::Delivery {
            attempts: 3,
            message: "HTTP 500".into(),
        };
        assert_eq!(err.to_string(), "delivery error after 3 attempt(s): HTTP 500");

        let err = RiskwatchError::job_not_found("abc");
        assert_eq!(err.to_string(), "job not found: abc");
    }
}
