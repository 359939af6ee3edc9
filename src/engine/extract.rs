//! Image payload extraction from conversational multimodal responses.
//!
//! Proxies return the generated image in one of several encodings. The
//! extractor scans a response message and yields candidates in a fixed
//! priority order; the engine uses the first candidate that decodes:
//!
//! 1. proxy-specific `multi_mod_content` parts carrying `inline_data`
//! 2. structured content parts of type `image_url` with a `data:` URI
//! 3. a markdown image link in a text body (secondary fetch)
//! 4. a bare image URL in a text body (secondary fetch)
//! 5. a raw `data:image/...;base64,...` blob inside a text body

use std::sync::LazyLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use tracing::warn;

use crate::backend::ChatMessageBody;

static MARKDOWN_IMAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\((https?://[^\s\)]+)\)").unwrap());

static BARE_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(https?://[^\s\)\]]+\.(?:png|jpg|jpeg|gif|webp|bmp)(?:\?[^\s\)\]]*)?)")
        .unwrap()
});

static DATA_URI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"data:image/[^;]+;base64,([A-Za-z0-9+/=]+)").unwrap());

/// One extraction candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    /// Decoded inline bytes, ready for validation.
    Inline(Vec<u8>),
    /// A URL that needs a secondary fetch.
    Remote(String),
}

/// Scan a chat message for image payload candidates, best first.
pub fn extract_image_payloads(message: &ChatMessageBody) -> Vec<ImagePayload> {
    let mut candidates = Vec::new();

    if let Some(parts) = message.multi_mod_content.as_ref().and_then(|v| v.as_array()) {
        for part in parts {
            if let Some(data) = part
                .get("inline_data")
                .and_then(|d| d.get("data"))
                .and_then(|d| d.as_str())
                && let Some(bytes) = decode_base64(data)
            {
                candidates.push(ImagePayload::Inline(bytes));
            }
        }
    }

    match message.content.as_ref() {
        Some(content) if content.is_array() => {
            for part in content.as_array().into_iter().flatten() {
                if part.get("type").and_then(|t| t.as_str()) == Some("image_url")
                    && let Some(url) = part
                        .get("image_url")
                        .and_then(|u| u.get("url"))
                        .and_then(|u| u.as_str())
                {
                    if let Some(encoded) = url.strip_prefix("data:image").and_then(|rest| {
                        rest.split_once(',').map(|(_, data)| data)
                    }) {
                        if let Some(bytes) = decode_base64(encoded) {
                            candidates.push(ImagePayload::Inline(bytes));
                        }
                    } else if url.starts_with("http") {
                        candidates.push(ImagePayload::Remote(url.to_string()));
                    }
                }
            }
        }
        Some(content) => {
            if let Some(text) = content.as_str() {
                candidates.extend(extract_from_text(text));
            }
        }
        None => {}
    }

    candidates
}

/// Extract candidates from a plain text body.
fn extract_from_text(text: &str) -> Vec<ImagePayload> {
    let mut candidates = Vec::new();

    if let Some(caps) = MARKDOWN_IMAGE_REGEX.captures(text)
        && let Some(url) = caps.get(1)
    {
        candidates.push(ImagePayload::Remote(url.as_str().to_string()));
    }

    for caps in BARE_URL_REGEX.captures_iter(text) {
        if let Some(url) = caps.get(1) {
            let remote = ImagePayload::Remote(url.as_str().to_string());
            if !candidates.contains(&remote) {
                candidates.push(remote);
            }
        }
    }

    if let Some(caps) = DATA_URI_REGEX.captures(text)
        && let Some(encoded) = caps.get(1)
        && let Some(bytes) = decode_base64(encoded.as_str())
    {
        candidates.push(ImagePayload::Inline(bytes));
    }

    candidates
}

fn decode_base64(encoded: &str) -> Option<Vec<u8>> {
    match BASE64.decode(encoded.trim()) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!("skipping undecodable base64 image payload: {err}");
            None
        }
    }
}
