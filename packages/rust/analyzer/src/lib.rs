//! Risk assessment of page content via the Anthropic Messages API.
//!
//! This crate provides:
//! - [`RiskAnalyzer`] — the classification seam used by the run orchestrator
//! - [`ClaudeAnalyzer`] — the production implementation
//! - [`Assessment`] — the normalized verdict

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use riskwatch_shared::{AnalyzerConfig, Evidence, Result, RiskLevel, RiskwatchError};

const ANTHROPIC_VERSION: &str = "2023-06-01";

const SYSTEM_PROMPT: &str = "You are a content safety classifier. Respond with JSON only.";

/// Image media types the Messages API accepts.
const SUPPORTED_MEDIA_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];

/// Timeout for downloading a single image to attach.
const IMAGE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

/// A normalized risk verdict for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    /// Short description of what kind of site this is.
    pub site_context: String,
    pub risk_level: RiskLevel,
    pub flags: Vec<String>,
    pub evidence: Vec<Evidence>,
    /// Plain-language explanation of the decision.
    pub summary: String,
}

/// Classifies page content.
#[async_trait]
pub trait RiskAnalyzer: Send + Sync {
    async fn analyze(&self, url: &str, text: &[String], images: &[String]) -> Result<Assessment>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// The classifier's JSON answer, before normalization.
#[derive(Deserialize)]
struct RawVerdict {
    site_context: Option<String>,
    risk_level: Option<String>,
    flags: Option<Vec<String>>,
    evidence: Option<Vec<serde_json::Value>>,
    summary: Option<String>,
}

impl RawVerdict {
    fn normalize(self) -> Result<Assessment> {
        let level = self.risk_level.unwrap_or_else(|| "none".into());
        let risk_level = level
            .trim()
            .to_ascii_lowercase()
            .parse::<RiskLevel>()
            .map_err(|_| RiskwatchError::Analysis(format!("unrecognised risk level {level:?}")))?;

        // Malformed evidence entries are dropped rather than failing the verdict.
        let evidence = self
            .evidence
            .unwrap_or_default()
            .into_iter()
            .filter_map(|value| serde_json::from_value::<Evidence>(value).ok())
            .collect();

        Ok(Assessment {
            site_context: self.site_context.unwrap_or_default(),
            risk_level,
            flags: self.flags.unwrap_or_default(),
            evidence,
            summary: self.summary.unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------------
// ClaudeAnalyzer
// ---------------------------------------------------------------------------

/// [`RiskAnalyzer`] backed by Claude.
pub struct ClaudeAnalyzer {
    client: Client,
    config: AnalyzerConfig,
    api_key: Option<String>,
}

impl ClaudeAnalyzer {
    /// Build an analyzer with an explicit key. A missing key is only an error
    /// once [`RiskAnalyzer::analyze`] is called.
    pub fn new(config: AnalyzerConfig, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RiskwatchError::Analysis(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    /// Build an analyzer reading the key from `config.api_key_env`.
    pub fn from_env(config: AnalyzerConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.as_deref().is_none_or(str::is_empty) {
            warn!(
                env = %config.api_key_env,
                "classifier API key not set; analysis will fail"
            );
        }
        Self::new(config, api_key)
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    /// Download up to `max_images` images as base64 image blocks.
    async fn collect_images(&self, urls: &[String]) -> Vec<serde_json::Value> {
        let mut blocks = Vec::new();
        for url in urls.iter().take(self.config.max_images) {
            match self.fetch_image(url).await {
                Some((media_type, data)) => blocks.push(json!({
                    "type": "image",
                    "source": { "type": "base64", "media_type": media_type, "data": data },
                })),
                None => debug!(%url, "image skipped"),
            }
        }
        blocks
    }

    async fn fetch_image(&self, url: &str) -> Option<(String, String)> {
        let response = self
            .client
            .get(url)
            .timeout(IMAGE_TIMEOUT)
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;

        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())?;
        if !SUPPORTED_MEDIA_TYPES.contains(&media_type.as_str()) {
            return None;
        }

        let bytes = response.bytes().await.ok()?;
        if bytes.len() > self.config.max_image_bytes {
            return None;
        }
        Some((media_type, BASE64.encode(&bytes)))
    }
}

#[async_trait]
impl RiskAnalyzer for ClaudeAnalyzer {
    #[instrument(skip_all, fields(url = %url, text_lines = text.len(), images = images.len()))]
    async fn analyze(&self, url: &str, text: &[String], images: &[String]) -> Result<Assessment> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            RiskwatchError::Analysis(format!("{} is not set", self.config.api_key_env))
        })?;

        let page_text = truncate_text(text, self.config.max_text_chars);
        let mut content = vec![json!({
            "type": "text",
            "text": build_prompt(url, &page_text, images),
        })];
        content.extend(self.collect_images(images).await);

        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": SYSTEM_PROMPT,
            "messages": [{ "role": "user", "content": content }],
        });

        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| RiskwatchError::Analysis(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RiskwatchError::Analysis(format!(
                "classifier returned HTTP {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let message: MessagesResponse = response
            .json()
            .await
            .map_err(|e| RiskwatchError::Analysis(format!("malformed API response: {e}")))?;

        let raw: String = message
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect();

        let assessment = extract_json(raw.trim())?.normalize()?;
        info!(
            risk_level = %assessment.risk_level,
            flags = assessment.flags.len(),
            "content assessed"
        );
        Ok(assessment)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Join lines with `\n` and cut to at most `max_chars` characters.
fn truncate_text(lines: &[String], max_chars: usize) -> String {
    let text = lines.join("\n");
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text,
    }
}

fn build_prompt(url: &str, text: &str, image_urls: &[String]) -> String {
    format!(
        "You are a content safety analyst. First infer the website context (e.g., portfolio, \
         e-commerce, news, documentation, hobby, research, community). Then assess risk ONLY \
         if the content is promotional, instructional, transactional, or directly depicting \
         harmful items. Do NOT flag neutral mentions in academic, historical, portfolio, or \
         news contexts unless there is clear promotion or instruction.\n\n\
         Return ONLY valid JSON with keys:\n\
         - site_context: short string\n\
         - risk_level: none|low|high\n\
         - flags: array of strings\n\
         - evidence: array of objects with fields {{type, snippet, rationale}}\n\
         - summary: 1-3 sentences explaining the decision in plain language\n\n\
         URL: {url}\n\
         Image URLs (for reference): {image_urls:?}\n\
         Text:\n{text}"
    )
}

/// Parse the classifier's answer, tolerating prose or code fences around
/// the JSON object.
fn extract_json(text: &str) -> Result<RawVerdict> {
    if let Ok(parsed) = serde_json::from_str(text) {
        return Ok(parsed);
    }

    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(RiskwatchError::Analysis(format!(
            "no JSON object in classifier output: {:?}",
            text.chars().take(120).collect::<String>()
        )));
    };
    if end <= start {
        return Err(RiskwatchError::Analysis("no JSON object in classifier output".into()));
    }

    serde_json::from_str(&text[start..=end])
        .map_err(|e| RiskwatchError::Analysis(format!("unparseable classifier output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> AnalyzerConfig {
        AnalyzerConfig {
            base_url: server.uri(),
            ..AnalyzerConfig::default()
        }
    }

    fn reply(text: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "text", "text": text }],
        }))
    }

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn truncates_on_char_boundary() {
        let text = lines(&["héllo", "wörld"]);
        assert_eq!(truncate_text(&text, 7), "héllo\nw");
        assert_eq!(truncate_text(&text, 100), "héllo\nwörld");
    }

    #[test]
    fn extract_json_from_fenced_prose() {
        let raw = "Sure.\n```json\n{\"risk_level\": \"low\", \"flags\": [\"vape\"]}\n```";
        let verdict = extract_json(raw).unwrap().normalize().unwrap();
        assert_eq!(verdict.risk_level, RiskLevel::Low);
        assert_eq!(verdict.flags, vec!["vape"]);
        assert!(verdict.evidence.is_empty());
        assert!(verdict.summary.is_empty());
    }

    #[test]
    fn extract_json_without_object_fails() {
        let err = extract_json("I cannot help with that.").err().unwrap();
        assert!(matches!(err, RiskwatchError::Analysis(_)));
        assert!(extract_json("} backwards {").is_err());
    }

    #[test]
    fn missing_fields_default() {
        let verdict = extract_json("{}").unwrap().normalize().unwrap();
        assert_eq!(verdict.risk_level, RiskLevel::None);
        assert!(verdict.flags.is_empty());

        let verdict = extract_json(r#"{"risk_level": "HIGH", "flags": null}"#)
            .unwrap()
            .normalize()
            .unwrap();
        assert_eq!(verdict.risk_level, RiskLevel::High);
    }

    #[test]
    fn unknown_risk_level_is_error() {
        let err = extract_json(r#"{"risk_level": "critical"}"#)
            .unwrap()
            .normalize()
            .unwrap_err();
        assert!(err.to_string().contains("critical"));
    }

    #[test]
    fn malformed_evidence_dropped() {
        let verdict = extract_json(
            r#"{"risk_level": "high", "evidence": ["loose", {"type": "text", "snippet": "buy"}]}"#,
        )
        .unwrap()
        .normalize()
        .unwrap();
        assert_eq!(verdict.evidence.len(), 1);
        assert_eq!(verdict.evidence[0].snippet, "buy");
    }

    #[tokio::test]
    async fn missing_key_fails_without_calling_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(reply("{}"))
            .expect(0)
            .mount(&server)
            .await;

        let analyzer = ClaudeAnalyzer::new(config_for(&server), None).unwrap();
        let err = analyzer
            .analyze("https://example.com", &lines(&["hi"]), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CLAUDE_API_KEY"));
    }

    #[tokio::test]
    async fn analyze_sends_key_and_parses_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(reply(
                r#"{"site_context": "e-commerce", "risk_level": "high",
                    "flags": ["weapons"],
                    "evidence": [{"type": "text", "snippet": "buy now", "rationale": "sale"}],
                    "summary": "Sells weapons."}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let analyzer =
            ClaudeAnalyzer::new(config_for(&server), Some("sk-test".into())).unwrap();
        let verdict = analyzer
            .analyze("https://shop.example.com", &lines(&["buy now"]), &[])
            .await
            .unwrap();

        assert_eq!(verdict.site_context, "e-commerce");
        assert_eq!(verdict.risk_level, RiskLevel::High);
        assert_eq!(verdict.flags, vec!["weapons"]);
        assert_eq!(verdict.evidence[0].rationale, "sale");
    }

    #[tokio::test]
    async fn only_supported_images_attached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok.png"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(vec![0x89, b'P', b'N', b'G'], "image/png"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page.html"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/huge.jpg"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(vec![0u8; 64], "image/jpeg"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(reply(r#"{"risk_level": "none"}"#))
            .mount(&server)
            .await;

        let config = AnalyzerConfig {
            max_image_bytes: 32,
            ..config_for(&server)
        };
        let analyzer = ClaudeAnalyzer::new(config, Some("sk-test".into())).unwrap();
        let images = vec![
            format!("{}/ok.png", server.uri()),
            format!("{}/page.html", server.uri()),
            format!("{}/huge.jpg", server.uri()),
            format!("{}/missing.gif", server.uri()),
        ];
        analyzer
            .analyze("https://example.com", &lines(&["text"]), &images)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let call = requests
            .iter()
            .find(|r| r.url.path() == "/v1/messages")
            .expect("messages call");
        let body: serde_json::Value = serde_json::from_slice(&call.body).unwrap();
        let content = body["messages"][0]["content"].as_array().unwrap();

        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["source"]["media_type"], "image/png");
        assert_eq!(content[1]["source"]["data"], BASE64.encode([0x89, b'P', b'N', b'G']));
    }

    #[tokio::test]
    async fn api_error_is_analysis_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let analyzer = ClaudeAnalyzer::new(config_for(&server), Some("k".into())).unwrap();
        let err = analyzer
            .analyze("https://example.com", &lines(&["x"]), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RiskwatchError::Analysis(_)));
        assert!(err.to_string().contains("overloaded"));
    }
}
