//! Shared types, error model, and configuration for riskwatch.
//!
//! This crate is the foundation depended on by all other riskwatch crates.
//! It provides:
//! - [`RiskwatchError`] — the unified error type
//! - Domain types ([`Job`], [`Run`], [`JobState`], [`RiskLevel`], ...)
//! - Configuration ([`AppConfig`], per-component sections, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnalyzerConfig, AppConfig, FetcherConfig, NotifierConfig, ServerConfig, StorageConfig,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    validate_api_key,
};
pub use error::{Result, RiskwatchError};
pub use types::{
    Evidence, Job, JobId, JobMode, JobState, JobStatus, MAX_INTERVAL_SECS, MIN_INTERVAL_SECS,
    RiskLevel, Run, RunId, RunStatus,
};
