//! Static page fetching: plain HTTP GET followed by HTML extraction.
//!
//! Text comes from block-level content elements (`p`, `h1`-`h3`, `li`);
//! anything under `script`, `style` or `noscript` is ignored.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use riskwatch_shared::{Result, RiskwatchError};

use crate::{FetchedContent, RawImage, USER_AGENT};

static TEXT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p, h1, h2, h3, li").expect("valid selector"));
pub(crate) static IMG_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img[src]").expect("valid selector"));

/// Tags whose contents are never visible text.
const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript"];

// ---------------------------------------------------------------------------
// StaticFetcher
// ---------------------------------------------------------------------------

/// Fetches pages with a single GET and extracts their content.
pub struct StaticFetcher {
    client: Client,
}

impl StaticFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout_secs)?,
        })
    }

    /// GET `url` and extract its text blocks and `img` records.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn fetch_page(&self, url: &Url) -> Result<FetchedContent> {
        let body = get_html(&self.client, url).await?;
        let doc = Html::parse_document(&body);

        let content = FetchedContent {
            text: extract_text(&doc),
            images: extract_images(&doc, url),
        };
        debug!(
            text_lines = content.text.len(),
            images = content.images.len(),
            "static extraction complete"
        );
        Ok(content)
    }
}

/// Build the HTTP client shared by the fetchers.
pub(crate) fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RiskwatchError::Fetch(format!("failed to build HTTP client: {e}")))
}

async fn get_html(client: &Client, url: &Url) -> Result<String> {
    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| RiskwatchError::Fetch(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(RiskwatchError::Fetch(format!("{url}: HTTP {status}")));
    }

    // `text()` decodes lossily, so undecodable bytes never fail a fetch.
    response
        .text()
        .await
        .map_err(|e| RiskwatchError::Fetch(format!("{url}: body read failed: {e}")))
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Collapse runs of whitespace to single spaces and trim.
pub(crate) fn collapse_whitespace(raw: &str) -> String {
    static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
    WS_RE.replace_all(raw, " ").trim().to_string()
}

pub(crate) fn is_hidden(el: &ElementRef<'_>) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .chain(std::iter::once(*el))
        .any(|a| HIDDEN_TAGS.contains(&a.value().name()))
}

fn extract_text(doc: &Html) -> Vec<String> {
    doc.select(&TEXT_SEL)
        .filter(|el| !is_hidden(el))
        .map(|el| collapse_whitespace(&el.text().collect::<Vec<_>>().join(" ")))
        .filter(|line| !line.is_empty())
        .collect()
}

fn extract_images(doc: &Html, base_url: &Url) -> Vec<RawImage> {
    let mut images = Vec::new();

    for el in doc.select(&IMG_SEL) {
        let Some(src) = el.value().attr("src") else {
            continue;
        };
        let src = src.trim();
        if src.is_empty() {
            continue;
        }
        if let Ok(resolved) = base_url.join(src) {
            images.push(RawImage::Record {
                src: Some(resolved.to_string()),
                alt: el.value().attr("alt").map(str::to_string),
            });
        }
    }

    images
}
