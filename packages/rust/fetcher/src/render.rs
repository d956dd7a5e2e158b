//! Rendered page fetching through an external headless-browser service.
//!
//! The service accepts `POST {"url": "..."}` and answers with the page's
//! HTML after scripts have run.

use std::collections::HashSet;
use std::sync::LazyLock;

use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use riskwatch_shared::{Result, RiskwatchError};

use crate::static_fetch::{IMG_SEL, build_client, collapse_whitespace, is_hidden};
use crate::{FetchedContent, RawImage};

static BODY_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("valid selector"));

#[derive(Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
}

/// Fetches pages via the rendering service.
pub struct RenderFetcher {
    client: Client,
    endpoint: Url,
}

impl RenderFetcher {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            RiskwatchError::config(format!("invalid render_endpoint {endpoint:?}: {e}"))
        })?;
        Ok(Self {
            client: build_client(timeout_secs)?,
            endpoint,
        })
    }

    #[instrument(skip_all, fields(url = %url))]
    pub async fn fetch_page(&self, url: &Url) -> Result<FetchedContent> {
        let response = self
            .client
            .post(self.endpoint.as_str())
            .json(&RenderRequest { url: url.as_str() })
            .send()
            .await
            .map_err(|e| RiskwatchError::Fetch(format!("{url}: render request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RiskwatchError::Fetch(format!(
                "{url}: render service returned HTTP {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RiskwatchError::Fetch(format!("{url}: render body read failed: {e}")))?;

        let doc = Html::parse_document(&body);
        let content = FetchedContent {
            text: body_lines(&doc),
            images: rendered_images(&doc, url),
        };
        debug!(
            text_lines = content.text.len(),
            images = content.images.len(),
            "render extraction complete"
        );
        Ok(content)
    }
}

/// Every visible text node under `body`, one line each.
fn body_lines(doc: &Html) -> Vec<String> {
    let Some(body) = doc.select(&BODY_SEL).next() else {
        return Vec::new();
    };

    body.descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let parent = node.parent().and_then(ElementRef::wrap)?;
            if is_hidden(&parent) {
                return None;
            }
            let line = collapse_whitespace(text);
            (!line.is_empty()).then_some(line)
        })
        .collect()
}

/// Absolute, de-duplicated `http(s)` image URLs in document order.
fn rendered_images(doc: &Html, base_url: &Url) -> Vec<RawImage> {
    let mut seen = HashSet::new();

    doc.select(&IMG_SEL)
        .filter_map(|el| el.value().attr("src"))
        .map(str::trim)
        .filter(|src| !src.is_empty())
        .filter_map(|src| base_url.join(src).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|u| u.to_string())
        .filter(|u| seen.insert(u.clone()))
        .map(RawImage::Url)
        .collect()
}
