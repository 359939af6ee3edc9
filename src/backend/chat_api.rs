//! Client for the conversational multimodal protocol (`/chat/completions`).
//!
//! Image generation rides a chat completion: reference images go inline as
//! `data:` URIs, the aspect ratio and resolution ride a system line (the
//! request shape has no field for them), and the response message may embed
//! the image in any of the encodings the engine's extractor understands.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::config::ProviderSettings;
use crate::engine::backoff::{BACKOFF_BASE_SECS, TRANSPORT_BACKOFF_CAP_SECS, backoff_delay};
use crate::errors::BackendError;

use super::{
    ChatBackend, ChatMessageBody, InlineImage, looks_like_html, parse_retry_after,
    provider_error_message,
};

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

/// Conversational-multimodal transport for one OpenAI-compatible provider.
pub struct ChatApiClient {
    http: reqwest::Client,
    settings: ProviderSettings,
}

impl ChatApiClient {
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
            "{}/chat/completions",
            self.settings.api_base.trim_end_matches('/')
        )
    }

    async fn post_completion(
        &self,
        model: &str,
        body: serde_json::Value,
    ) -> Result<ChatMessageBody, BackendError> {
        let attempts = self.settings.transport_retries + 1;
        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;
            match self
                .http
                .post(self.endpoint())
                .bearer_auth(self.settings.api_key_for_model(model))
                .json(&body)
                .send()
                .await
            {
                Ok(response) => break response,
                Err(err) if attempt < attempts => {
                    let wait = backoff_delay(attempt, BACKOFF_BASE_SECS, TRANSPORT_BACKOFF_CAP_SECS);
                    warn!(
                        "chat request transport error, retrying in {:.1}s (attempt {attempt}/{attempts}): {err}",
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(BackendError::Transport(err.to_string())),
            }
        };

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());

        if !status.is_success() {
            let error_body: serde_json::Value =
                response.json().await.unwrap_or(serde_json::Value::Null);
            return Err(BackendError::Provider {
                status: status.as_u16(),
                message: provider_error_message(&error_body),
                retry_after,
            });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(format!("chat response was not JSON: {e}")))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| BackendError::Malformed("chat response carried no choices".into()))
    }
}

#[async_trait]
impl ChatBackend for ChatApiClient {
    async fn generate_image(
        &self,
        model: &str,
        prompt: &str,
        refs: &[InlineImage],
        aspect_ratio: &str,
        resolution: &str,
    ) -> Result<ChatMessageBody, BackendError> {
        // Reference images first, then the text prompt.
        let mut content: Vec<serde_json::Value> = refs
            .iter()
            .map(|image| json!({ "type": "image_url", "image_url": { "url": image.data_uri } }))
            .collect();
        content.push(json!({ "type": "text", "text": prompt }));

        let body = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": format!("aspect_ratio={aspect_ratio};resolution={resolution}") },
                { "role": "user", "content": content },
            ],
            "max_tokens": 4096,
        });

        self.post_completion(model, body).await
    }

    async fn complete_text(&self, model: &str, prompt: &str) -> Result<String, BackendError> {
        let body = json!({
            "model": model,
            "messages": [ { "role": "user", "content": prompt } ],
            "temperature": 0.3,
            "max_tokens": 1024,
        });

        let message = self.post_completion(model, body).await?;
        let text = match message.content {
            Some(serde_json::Value::String(text)) => text,
            // Some proxies answer with content parts even for text requests.
            Some(serde_json::Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };

        let text = text.trim().to_string();
        if looks_like_html(&text) {
            return Err(BackendError::Malformed(
                "got HTML-shaped output; check the API base ends with /v1".into(),
            ));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_response_parses_string_content() {
        let json = r#"{"choices": [{"message": {"content": "a short caption"}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed.choices[0].message.content,
            Some(serde_json::Value::String("a short caption".into()))
        );
    }

    #[test]
    fn completion_response_parses_multi_mod_content() {
        let json = r#"{
            "choices": [{"message": {
                "content": null,
                "multi_mod_content": [{"inline_data": {"data": "aGk="}}]
            }}]
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.choices[0].message.multi_mod_content.is_some());
    }

    #[test]
    fn completion_response_tolerates_missing_choices() {
        let parsed: ChatCompletionResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.choices.is_empty());
    }
}
