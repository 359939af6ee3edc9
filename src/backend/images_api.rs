//! Client for the structured generation protocol (`/images/generations`).
//!
//! Request: `{model, prompt, n: 1, size}`. Response: `{data: [{b64_json |
//! url}]}` on success, `{error: {...}}` with a 4xx/5xx status on failure.
//! Reference images are not supported by this protocol family.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ProviderSettings;
use crate::engine::backoff::{BACKOFF_BASE_SECS, TRANSPORT_BACKOFF_CAP_SECS, backoff_delay};
use crate::errors::BackendError;

use super::{StructuredImageBackend, StructuredImageData, parse_retry_after, provider_error_message};

#[derive(Serialize)]
struct ImagesRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'a str,
}

#[derive(Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    #[serde(default, alias = "b64", alias = "base64")]
    b64_json: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Structured-generation transport for one OpenAI-compatible provider.
pub struct ImagesApiClient {
    http: reqwest::Client,
    settings: ProviderSettings,
}

impl ImagesApiClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            settings: settings.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/images/generations",
            self.settings.api_base.trim_end_matches('/')
        )
    }

    /// Send the request, retrying raw connection failures only.
    async fn send_with_transport_retry(
        &self,
        model: &str,
        payload: &ImagesRequest<'_>,
    ) -> Result<reqwest::Response, BackendError> {
        let attempts = self.settings.transport_retries + 1;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .http
                .post(self.endpoint())
                .bearer_auth(self.settings.api_key_for_model(model))
                .json(payload)
                .send()
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) if attempt < attempts => {
                    let wait = backoff_delay(attempt, BACKOFF_BASE_SECS, TRANSPORT_BACKOFF_CAP_SECS);
                    warn!(
                        "images request transport error, retrying in {:.1}s (attempt {attempt}/{attempts}): {err}",
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(BackendError::Transport(err.to_string())),
            }
        }
    }
}

#[async_trait]
impl StructuredImageBackend for ImagesApiClient {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        size: &str,
    ) -> Result<StructuredImageData, BackendError> {
        let payload = ImagesRequest {
            model,
            prompt,
            n: 1,
            size,
        };

        let response = self.send_with_transport_retry(model, &payload).await?;
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());

        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
            return Err(BackendError::Provider {
                status: status.as_u16(),
                message: provider_error_message(&body),
                retry_after,
            });
        }

        let body: ImagesResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(format!("images response was not JSON: {e}")))?;

        let first = body
            .data
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Malformed("images response carried no data".into()))?;

        if let Some(encoded) = first.b64_json {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| BackendError::Malformed(format!("invalid b64_json payload: {e}")))?;
            return Ok(StructuredImageData::Inline(bytes));
        }
        if let Some(url) = first.url {
            return Ok(StructuredImageData::Url(url));
        }
        Err(BackendError::Malformed(
            "images response had neither b64_json nor url".into(),
        ))
    }
}

/// Map an aspect ratio onto the limited size set Images APIs accept.
/// Orientation is preserved; exact dimensions are the provider's business.
pub fn size_for_aspect_ratio(aspect_ratio: &str) -> &'static str {
    let Some((w, h)) = aspect_ratio.trim().split_once(':') else {
        return "1024x1024";
    };
    match (w.trim().parse::<f64>(), h.trim().parse::<f64>()) {
        (Ok(w), Ok(h)) if w > 0.0 && h > 0.0 => {
            if (w - h).abs() < f64::EPSILON {
                "1024x1024"
            } else if w > h {
                "1792x1024"
            } else {
                "1024x1792"
            }
        }
        _ => "1024x1024",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_mapping_preserves_orientation() {
        assert_eq!(size_for_aspect_ratio("1:1"), "1024x1024");
        assert_eq!(size_for_aspect_ratio("16:9"), "1792x1024");
        assert_eq!(size_for_aspect_ratio("3:4"), "1024x1792");
    }

    #[test]
    fn size_mapping_defaults_square_on_garbage() {
        assert_eq!(size_for_aspect_ratio("wide"), "1024x1024");
        assert_eq!(size_for_aspect_ratio("0:9"), "1024x1024");
        assert_eq!(size_for_aspect_ratio(""), "1024x1024");
    }

    #[test]
    fn response_deserializes_b64_aliases() {
        let json = r#"{"data": [{"b64": "aGk="}]}"#;
        let parsed: ImagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data[0].b64_json.as_deref(), Some("aGk="));
    }

    #[test]
    fn response_deserializes_url_shape() {
        let json = r#"{"data": [{"url": "https://cdn.example.com/a.png"}]}"#;
        let parsed: ImagesResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.data[0].b64_json.is_none());
        assert_eq!(
            parsed.data[0].url.as_deref(),
            Some("https://cdn.example.com/a.png")
        );
    }

    #[test]
    fn request_serializes_expected_shape() {
        let request = ImagesRequest {
            model: "seedream-4",
            prompt: "a red mug",
            n: 1,
            size: "1024x1024",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "seedream-4");
        assert_eq!(json["n"], 1);
        assert_eq!(json["size"], "1024x1024");
    }
}
