//! Backend clients: pure transport to one provider, one protocol each.
//!
//! A client constructs the request, attaches auth, applies the configured
//! timeout, and retries raw connection failures a small fixed number of
//! times. HTTP-status failures are never retried here; they bubble up to the
//! strategy engine for classification. No business logic, no prompt
//! mutation.

pub mod chat_api;
pub mod images_api;

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::errors::BackendError;

pub use chat_api::ChatApiClient;
pub use images_api::ImagesApiClient;

/// Result of one structured-generation call.
#[derive(Debug, Clone)]
pub enum StructuredImageData {
    /// Decoded inline image bytes (`b64_json` shape).
    Inline(Vec<u8>),
    /// A URL to fetch the image from (`url` shape).
    Url(String),
}

/// A reference image encoded for inline transmission.
#[derive(Debug, Clone)]
pub struct InlineImage {
    /// Full `data:` URI including mime prefix.
    pub data_uri: String,
}

impl InlineImage {
    pub fn from_bytes(bytes: &[u8], mime: &str) -> Self {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self {
            data_uri: format!("data:{mime};base64,{encoded}"),
        }
    }
}

/// The message body of a chat completion, kept loosely typed: proxies embed
/// image payloads in several shapes and the engine's extractor does the
/// interpretation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatMessageBody {
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub multi_mod_content: Option<serde_json::Value>,
}

/// One structured-generation call. Implementations are pure transport.
#[async_trait]
pub trait StructuredImageBackend: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        size: &str,
    ) -> Result<StructuredImageData, BackendError>;
}

/// One conversational-multimodal call.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Image generation via chat completion; the raw message body is
    /// returned for payload extraction.
    async fn generate_image(
        &self,
        model: &str,
        prompt: &str,
        refs: &[InlineImage],
        aspect_ratio: &str,
        resolution: &str,
    ) -> Result<ChatMessageBody, BackendError>;

    /// Plain text completion.
    async fn complete_text(&self, model: &str, prompt: &str) -> Result<String, BackendError>;
}

/// Secondary fetch for url-shaped image payloads.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BackendError>;
}

/// HTTP fetcher with a fixed timeout, used for markdown/bare-url payloads.
pub struct HttpImageFetcher {
    http: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new() -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Provider {
                status: status.as_u16(),
                message: format!("image fetch from {url} failed"),
                retry_after: None,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Mine a provider error body for a human-readable message.
///
/// Proxies disagree on where the message lives; check the nested `error`
/// object first, preferring the localized field, then top-level equivalents.
pub(crate) fn provider_error_message(body: &serde_json::Value) -> String {
    let from_fields = |value: &serde_json::Value| -> Option<String> {
        for key in ["message_zh", "message", "msg", "detail"] {
            if let Some(text) = value.get(key).and_then(|m| m.as_str())
                && !text.is_empty()
            {
                return Some(text.to_string());
            }
        }
        None
    };

    if let Some(err) = body.get("error") {
        if let Some(message) = from_fields(err) {
            return message;
        }
        if !err.is_null() {
            return err.to_string();
        }
    }
    from_fields(body).unwrap_or_default()
}

/// Parse a `Retry-After` header value (seconds form only).
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = value.trim().parse().ok()?;
    if secs > 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

static HTML_LIKE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<!doctype\s+html|<html\b|<head\b|<meta\b|<script\b|<body\b|</html>|</head>|</body>",
    )
    .unwrap()
});

/// Guard against a proxy serving its website instead of the JSON API, which
/// happens when the configured base URL is missing the `/v1` suffix.
pub(crate) fn looks_like_html(text: &str) -> bool {
    let snippet: String = text.trim_start().chars().take(4096).collect();
    HTML_LIKE_REGEX.is_match(&snippet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_message_prefers_localized_nested_field() {
        let body = json!({ "error": { "message_zh": "通道不可用", "message": "no channel" } });
        assert_eq!(provider_error_message(&body), "通道不可用");
    }

    #[test]
    fn error_message_falls_back_through_fields() {
        let body = json!({ "error": { "detail": "quota exceeded" } });
        assert_eq!(provider_error_message(&body), "quota exceeded");

        let top_level = json!({ "msg": "bad request" });
        assert_eq!(provider_error_message(&top_level), "bad request");

        let empty = json!({});
        assert_eq!(provider_error_message(&empty), "");
    }

    #[test]
    fn error_message_stringifies_unknown_error_shape() {
        let body = json!({ "error": ["weird", "shape"] });
        assert_eq!(provider_error_message(&body), r#"["weird","shape"]"#);
    }

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn retry_after_rejects_dates_and_zero() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(reqwest::header::RETRY_AFTER, "0".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn html_detection_catches_websites() {
        assert!(looks_like_html("<!DOCTYPE html><html><body>hi</body></html>"));
        assert!(looks_like_html("  <html lang=\"en\">"));
        assert!(!looks_like_html("A red sneaker on white background"));
    }

    #[test]
    fn inline_image_builds_data_uri() {
        let inline = InlineImage::from_bytes(b"abc", "image/jpeg");
        assert!(inline.data_uri.starts_with("data:image/jpeg;base64,"));
    }
}
