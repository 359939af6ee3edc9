//! The request strategy engine.
//!
//! Given a [`GenerationRequest`], produce one image (or text) result using
//! the most compatible backend protocol, retrying and adapting on failure,
//! without ever blocking longer than a bounded worst-case time.
//!
//! Recovery is layered:
//! - transient failures retry in place with capped exponential backoff;
//! - content-policy rejections fall through an ordered chain of prompt
//!   variants, each with a fresh attempt budget;
//! - a "no channel" failure on the conversational protocol falls back once
//!   to the structured protocol (dropping reference images).

pub mod backoff;
pub mod classify;
pub mod extract;
pub mod prompt;
pub mod routing;

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::images_api::size_for_aspect_ratio;
use crate::backend::{
    ChatApiClient, ChatBackend, HttpImageFetcher, ImageFetcher, ImagesApiClient, InlineImage,
    StructuredImageBackend, StructuredImageData,
};
use crate::config::RuntimeConfig;
use crate::errors::{BackendError, EngineError};
use crate::request::{GeneratedImage, GenerationRequest};

pub use classify::{FailureClass, classify, classify_backend, hint_for};
pub use extract::{ImagePayload, extract_image_payloads};
pub use routing::{Protocol, ResolvedRoute, RouteTable, normalize_model};

use backoff::{BACKOFF_BASE_SECS, HTTP_BACKOFF_CAP_SECS, backoff_delay};
use prompt::prompt_variants;

/// Attempt floor per prompt variant. The images endpoint is the rate-limited
/// one, so the budget never drops below this even with retries configured
/// lower.
const MIN_ATTEMPTS: u32 = 5;

/// Engine knobs captured from the runtime configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Configured retry count; the per-variant budget is
    /// `max(max_retries + 1, 5)`.
    pub max_retries: u32,
    /// Normalized API base; used for model aliasing.
    pub api_base: String,
}

/// One classified failure, kept for surfacing after recovery is exhausted.
#[derive(Debug, Clone)]
struct Failure {
    class: FailureClass,
    status: Option<u16>,
    message: String,
}

impl Failure {
    fn from_backend(err: &BackendError) -> Self {
        Self {
            class: classify_backend(err),
            status: err.status(),
            message: err.message(),
        }
    }

    fn undecodable(detail: String) -> Self {
        Self {
            class: FailureClass::Fatal,
            status: None,
            message: detail,
        }
    }

    fn into_engine_error(self, model: &str) -> EngineError {
        let hint = hint_for(self.class, self.status);
        let mut message = match self.status {
            Some(status) => format!("HTTP {status}"),
            None => self.class.to_string(),
        };
        message.push_str(hint);
        if !self.message.is_empty() {
            message.push_str(": ");
            message.push_str(&self.message);
        }
        EngineError::Exhausted {
            model: model.to_string(),
            class: self.class,
            message,
        }
    }
}

/// Outcome of one attempt loop over a single prompt variant.
enum AttemptOutcome {
    Success(GeneratedImage),
    /// Confirmed non-transient rejection of this prompt; try the next variant.
    NextVariant(Failure),
    /// Surface immediately; further variants would not help.
    Surface(Failure),
}

/// The strategy engine. Holds the backend clients behind trait objects so
/// tests can script them.
pub struct GenerationEngine {
    structured: Arc<dyn StructuredImageBackend>,
    chat: Arc<dyn ChatBackend>,
    fetcher: Arc<dyn ImageFetcher>,
    routes: RouteTable,
    settings: EngineSettings,
}

impl GenerationEngine {
    /// Wire the engine with explicit backends.
    pub fn with_backends(
        structured: Arc<dyn StructuredImageBackend>,
        chat: Arc<dyn ChatBackend>,
        fetcher: Arc<dyn ImageFetcher>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            structured,
            chat,
            fetcher,
            routes: RouteTable::standard(),
            settings,
        }
    }

    /// Wire the engine with real HTTP clients from the configuration.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, EngineError> {
        let structured = ImagesApiClient::new(&config.provider)
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;
        let chat = ChatApiClient::new(&config.provider)
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;
        let fetcher =
            HttpImageFetcher::new().map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;
        Ok(Self::with_backends(
            Arc::new(structured),
            Arc::new(chat),
            Arc::new(fetcher),
            EngineSettings {
                max_retries: config.provider.max_retries,
                api_base: config.provider.api_base.clone(),
            },
        ))
    }

    /// Generate one image for the request, routing by model identifier.
    pub async fn generate_image(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedImage, EngineError> {
        let model = normalize_model(&request.model, &self.settings.api_base);
        let route = self.routes.resolve(&model);
        debug!(
            "routing model {model} to {:?} (strict_vocabulary={})",
            route.protocol, route.strict_vocabulary
        );

        match route.protocol {
            Protocol::Structured => {
                if request.has_references() {
                    warn!(
                        "model {model} uses the structured protocol; {} reference image(s) will be ignored",
                        request.reference_paths().len()
                    );
                }
                self.generate_structured(&model, request, route.strict_vocabulary)
                    .await
            }
            Protocol::Conversational => {
                match self.generate_conversational(&model, request).await {
                    Ok(image) => Ok(image),
                    Err(err) if err.class() == FailureClass::NoChannel => {
                        warn!(
                            "no chat channel for model {model}; falling back to the structured \
                             protocol (reference images dropped)"
                        );
                        self.generate_structured(&model, request, route.strict_vocabulary)
                            .await
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Generate a plain text completion (outline/description work).
    pub async fn generate_text(&self, model: &str, prompt: &str) -> Result<String, EngineError> {
        let budget = (self.settings.max_retries + 1).max(3);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.chat.complete_text(model, prompt).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    let failure = Failure::from_backend(&err);
                    if !failure.class.is_retryable() || attempt >= budget {
                        return Err(failure.into_engine_error(model));
                    }
                    let wait = retry_wait(&err, attempt);
                    warn!(
                        "text completion failed ({}), retrying in {:.1}s (attempt {attempt}/{budget})",
                        failure.class,
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// The structured-protocol flow: prompt variants outer, attempts inner.
    async fn generate_structured(
        &self,
        model: &str,
        request: &GenerationRequest,
        strict_vocabulary: bool,
    ) -> Result<GeneratedImage, EngineError> {
        let variants = prompt_variants(&request.prompt, &request.aspect_ratio, strict_vocabulary);
        if variants.is_empty() {
            return Err(EngineError::Other(anyhow::anyhow!(
                "empty prompt after sanitization"
            )));
        }
        let size = size_for_aspect_ratio(&request.aspect_ratio);
        let budget = self.attempt_budget();

        let mut last_failure: Option<Failure> = None;
        let variant_count = variants.len();
        for (index, variant) in variants.into_iter().enumerate() {
            if index > 0 {
                debug!("trying prompt variant {}/{variant_count}", index + 1);
            }
            match self.attempt_loop(model, &variant, size, budget).await {
                AttemptOutcome::Success(image) => return Ok(image),
                AttemptOutcome::NextVariant(failure) => {
                    warn!(
                        "prompt variant {}/{variant_count} rejected ({}); moving on",
                        index + 1,
                        failure.class
                    );
                    last_failure = Some(failure);
                }
                AttemptOutcome::Surface(failure) => {
                    return Err(failure.into_engine_error(model));
                }
            }
        }

        // Only reachable when every variant ended in a confirmed rejection.
        let failure = last_failure.unwrap_or_else(|| Failure {
            class: FailureClass::Unclassified,
            status: None,
            message: "no prompt variant produced a result".to_string(),
        });
        Err(failure.into_engine_error(model))
    }

    /// Retry one prompt variant until success, rejection, or budget
    /// exhaustion.
    async fn attempt_loop(
        &self,
        model: &str,
        prompt: &str,
        size: &str,
        budget: u32,
    ) -> AttemptOutcome {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.structured.generate(model, prompt, size).await {
                Ok(data) => {
                    let bytes = match data {
                        StructuredImageData::Inline(bytes) => bytes,
                        StructuredImageData::Url(url) => match self.fetcher.fetch(&url).await {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                let failure = Failure::from_backend(&err);
                                if !failure.class.is_retryable() || attempt >= budget {
                                    return AttemptOutcome::Surface(failure);
                                }
                                let wait = retry_wait(&err, attempt);
                                warn!(
                                    "image fetch failed ({}), retrying in {:.1}s (attempt {attempt}/{budget})",
                                    failure.class,
                                    wait.as_secs_f64()
                                );
                                tokio::time::sleep(wait).await;
                                continue;
                            }
                        },
                    };
                    return match decode_image(&bytes) {
                        Ok(image) => AttemptOutcome::Success(image),
                        // A corrupt payload is fatal for this variant, but a
                        // different prompt may still produce a clean one.
                        Err(detail) => AttemptOutcome::NextVariant(Failure::undecodable(detail)),
                    };
                }
                Err(err) => {
                    let failure = Failure::from_backend(&err);
                    match failure.class {
                        FailureClass::ContentRejected => {
                            return AttemptOutcome::NextVariant(failure);
                        }
                        FailureClass::Fatal | FailureClass::Unclassified => {
                            return AttemptOutcome::Surface(failure);
                        }
                        FailureClass::RateLimited
                        | FailureClass::NoChannel
                        | FailureClass::Transient => {
                            if attempt >= budget {
                                return AttemptOutcome::Surface(failure);
                            }
                            let wait = retry_wait(&err, attempt);
                            warn!(
                                "images request throttled ({}), retrying in {:.1}s (attempt {attempt}/{budget})",
                                failure.class,
                                wait.as_secs_f64()
                            );
                            tokio::time::sleep(wait).await;
                        }
                    }
                }
            }
        }
    }

    /// The conversational-protocol flow: one chat call, then payload
    /// extraction in priority order.
    async fn generate_conversational(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<GeneratedImage, EngineError> {
        let refs = load_references(request)?;
        debug!(
            "chat image generation with {} reference image(s)",
            refs.len()
        );

        let message = self
            .chat
            .generate_image(
                model,
                &request.prompt,
                &refs,
                &request.aspect_ratio,
                &request.resolution,
            )
            .await
            .map_err(|err| Failure::from_backend(&err).into_engine_error(model))?;

        let payloads = extract_image_payloads(&message);
        if payloads.is_empty() {
            return Err(EngineError::NoImagePayload {
                model: model.to_string(),
            });
        }

        for payload in payloads {
            let bytes = match payload {
                ImagePayload::Inline(bytes) => bytes,
                ImagePayload::Remote(url) => match self.fetcher.fetch(&url).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("failed to fetch image payload from {url}: {err}");
                        continue;
                    }
                },
            };
            match decode_image(&bytes) {
                Ok(image) => return Ok(image),
                Err(detail) => {
                    warn!("skipping undecodable image payload: {detail}");
                }
            }
        }

        Err(EngineError::NoImagePayload {
            model: model.to_string(),
        })
    }

    fn attempt_budget(&self) -> u32 {
        (self.settings.max_retries + 1).max(MIN_ATTEMPTS)
    }
}

/// Wait before the next retry: server hint when present, else capped
/// exponential backoff.
fn retry_wait(err: &BackendError, attempt: u32) -> std::time::Duration {
    if let BackendError::Provider {
        retry_after: Some(hint),
        ..
    } = err
    {
        return *hint;
    }
    backoff_delay(attempt, BACKOFF_BASE_SECS, HTTP_BACKOFF_CAP_SECS)
}

/// Validate bytes as a loadable image.
fn decode_image(bytes: &[u8]) -> Result<GeneratedImage, String> {
    let format = image::guess_format(bytes).map_err(|e| format!("unknown image format: {e}"))?;
    let decoded =
        image::load_from_memory(bytes).map_err(|e| format!("undecodable image payload: {e}"))?;
    Ok(GeneratedImage {
        bytes: bytes.to_vec(),
        width: decoded.width(),
        height: decoded.height(),
        format,
    })
}

/// Read and inline-encode the request's reference images, primary first.
fn load_references(request: &GenerationRequest) -> Result<Vec<InlineImage>, EngineError> {
    let mut refs = Vec::new();
    for path in request.reference_paths() {
        let bytes = std::fs::read(path).map_err(|source| EngineError::ReferenceRead {
            path: path.clone(),
            source,
        })?;
        refs.push(InlineImage::from_bytes(&bytes, mime_for_path(path)));
    }
    Ok(refs)
}

fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        _ => "image/jpeg",
    }
}
