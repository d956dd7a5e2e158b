//! Page fetching and content extraction for monitored URLs.
//!
//! This crate provides:
//! - [`ContentFetcher`] — the fetch seam the run orchestrator depends on
//! - [`StaticFetcher`] — plain HTTP GET + HTML extraction
//! - [`RenderFetcher`] — rendering through a headless-browser service
//! - [`PageFetcher`] — mode dispatch (`static` / `dynamic` / `auto`)

mod guard;
mod render;
mod static_fetch;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

use riskwatch_shared::{FetcherConfig, JobMode, Result, RiskwatchError};

pub use guard::is_ssrf_target;
pub use render::RenderFetcher;
pub use static_fetch::StaticFetcher;

/// User-Agent string for fetch requests.
pub(crate) const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (compatible; riskwatch/",
    env!("CARGO_PKG_VERSION"),
    ")"
);

// ---------------------------------------------------------------------------
// Fetch result
// ---------------------------------------------------------------------------

/// An image reference as reported by a fetcher.
///
/// Fetchers disagree on shape: the static extractor reports `{src, alt}`
/// records, the renderer bare URLs. Anything else deserializes into
/// [`RawImage::Other`] so that a malformed entry never fails a fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawImage {
    Url(String),
    Record {
        src: Option<String>,
        #[serde(default)]
        alt: Option<String>,
    },
    Other(serde_json::Value),
}

impl RawImage {
    /// The image URL, if this entry carries a non-empty one.
    pub fn into_src(self) -> Option<String> {
        let src = match self {
            Self::Url(url) => url,
            Self::Record { src: Some(src), .. } => src,
            Self::Record { src: None, .. } | Self::Other(_) => return None,
        };
        let trimmed = src.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.len() == src.len() {
            Some(src)
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Extracted page content, in document order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchedContent {
    /// Visible text blocks.
    pub text: Vec<String>,
    /// Image references.
    pub images: Vec<RawImage>,
}

/// Fetches a page and extracts its text and images.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str, mode: JobMode) -> Result<FetchedContent>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a user-supplied target, assuming `https://` when no scheme is given.
pub fn normalize_target(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    Url::parse(&candidate).map_err(|e| RiskwatchError::Fetch(format!("invalid URL {raw:?}: {e}")))
}

/// `auto` mode heuristic: a static result this sparse is probably a
/// client-rendered page and should be fetched again through the renderer.
pub fn needs_render(text_lines: usize, image_count: usize, min_text_lines: usize) -> bool {
    text_lines < min_text_lines && image_count == 0
}

// ---------------------------------------------------------------------------
// PageFetcher
// ---------------------------------------------------------------------------

/// Mode-dispatching fetcher used in production.
pub struct PageFetcher {
    static_fetcher: StaticFetcher,
    renderer: Option<RenderFetcher>,
    auto_min_text_lines: usize,
    allow_private_targets: bool,
}

impl PageFetcher {
    /// Build the static client and, if an endpoint is configured, the renderer.
    pub fn new(config: &FetcherConfig) -> Result<Self> {
        let renderer = config
            .render_endpoint
            .as_deref()
            .map(|endpoint| RenderFetcher::new(endpoint, config.render_timeout_secs))
            .transpose()?;

        Ok(Self {
            static_fetcher: StaticFetcher::new(config.timeout_secs)?,
            renderer,
            auto_min_text_lines: config.auto_min_text_lines,
            allow_private_targets: config.allow_private_targets,
        })
    }

    fn renderer(&self) -> Result<&RenderFetcher> {
        self.renderer.as_ref().ok_or_else(|| {
            RiskwatchError::Fetch("dynamic mode requires fetcher.render_endpoint".into())
        })
    }
}

#[async_trait]
impl ContentFetcher for PageFetcher {
    #[instrument(skip_all, fields(url = %url, mode = %mode))]
    async fn fetch(&self, url: &str, mode: JobMode) -> Result<FetchedContent> {
        let target = normalize_target(url)?;
        if !self.allow_private_targets && is_ssrf_target(&target) {
            return Err(RiskwatchError::Fetch(format!(
                "{target}: refusing to fetch a private or local address"
            )));
        }

        match mode {
            JobMode::Static => self.static_fetcher.fetch_page(&target).await,
            JobMode::Dynamic => self.renderer()?.fetch_page(&target).await,
            JobMode::Auto => {
                let content = self.static_fetcher.fetch_page(&target).await?;
                if !needs_render(
                    content.text.len(),
                    content.images.len(),
                    self.auto_min_text_lines,
                ) {
                    return Ok(content);
                }
                match &self.renderer {
                    Some(renderer) => {
                        info!(
                            text_lines = content.text.len(),
                            "static result too sparse, rendering"
                        );
                        renderer.fetch_page(&target).await
                    }
                    None => {
                        debug!("static result sparse but no renderer configured");
                        Ok(content)
                    }
                }
            }
        }
    }
}
