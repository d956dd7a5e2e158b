//! Application configuration for riskwatch.
//!
//! User config lives at `~/.riskwatch/riskwatch.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RiskwatchError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "riskwatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".riskwatch";

// ---------------------------------------------------------------------------
// Config structs (matching riskwatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP API settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Content fetching.
    #[serde(default)]
    pub fetcher: FetcherConfig,

    /// Risk classifier settings.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Webhook delivery.
    #[serde(default)]
    pub notifier: NotifierConfig,
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the HTTP API binds to.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file. `~` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.riskwatch/riskwatch.db".into()
}

/// `[fetcher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Timeout for a static page fetch.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// In `auto` mode, a static fetch with fewer text lines than this (and no
    /// images) is retried through the rendering service.
    #[serde(default = "default_auto_min_text_lines")]
    pub auto_min_text_lines: usize,

    /// Headless-browser rendering service used for `dynamic` pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_endpoint: Option<String>,

    /// Timeout for a rendered fetch.
    #[serde(default = "default_render_timeout")]
    pub render_timeout_secs: u64,

    /// Permit loopback/private targets (local testing only).
    #[serde(default)]
    pub allow_private_targets: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            auto_min_text_lines: default_auto_min_text_lines(),
            render_endpoint: None,
            render_timeout_secs: default_render_timeout(),
            allow_private_targets: false,
        }
    }
}

fn default_fetch_timeout() -> u64 {
    15
}
fn default_auto_min_text_lines() -> usize {
    5
}
fn default_render_timeout() -> u64 {
    45
}

/// `[analyzer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier sent to the Messages API.
    #[serde(default = "default_model")]
    pub model: String,

    /// API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Page text beyond this many characters is cut off.
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,

    /// Maximum images attached to one request.
    #[serde(default = "default_max_images")]
    pub max_images: usize,

    /// Images larger than this are skipped.
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    /// Response token budget.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Timeout for the classifier call.
    #[serde(default = "default_analyzer_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_base_url(),
            max_text_chars: default_max_text_chars(),
            max_images: default_max_images(),
            max_image_bytes: default_max_image_bytes(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_analyzer_timeout(),
        }
    }
}

fn default_api_key_env() -> String {
    "CLAUDE_API_KEY".into()
}
fn default_model() -> String {
    "claude-3-5-sonnet-20241022".into()
}
fn default_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_max_text_chars() -> usize {
    12_000
}
fn default_max_images() -> usize {
    8
}
fn default_max_image_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_max_tokens() -> u32 {
    512
}
fn default_analyzer_timeout() -> u64 {
    60
}

/// `[notifier]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Total delivery attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Linear backoff base; the wait after attempt `n` is `backoff_ms * n`.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Per-request timeout.
    #[serde(default = "default_notifier_timeout")]
    pub timeout_secs: u64,

    /// Webhook used for new jobs that do not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_webhook_url: Option<String>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_notifier_timeout(),
            default_webhook_url: None,
        }
    }
}

impl NotifierConfig {
    /// Backoff base as a [`Duration`].
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1500
}
fn default_notifier_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.riskwatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| RiskwatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.riskwatch/riskwatch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RiskwatchError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| RiskwatchError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RiskwatchError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RiskwatchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RiskwatchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| RiskwatchError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}

/// Read the classifier API key from the configured env var.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.analyzer.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(RiskwatchError::config(format!(
            "classifier API key not found. Set the {var_name} environment variable."
        ))),
    }
}
