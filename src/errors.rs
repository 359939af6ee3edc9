//! Typed error hierarchy for the vitrine orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `BackendError` — transport and provider-level failures from one HTTP call
//! - `EngineError` — strategy-engine failures after retry/fallback recovery
//! - `JobError` — submission and job-lifecycle failures

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::FailureClass;
use crate::job::JobId;

/// Errors from a single backend HTTP call.
///
/// Backend clients are pure transport: they retry raw connection failures a
/// small fixed number of times, but HTTP-status failures are returned
/// unretried so the strategy engine can classify them.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The provider answered with a non-success HTTP status.
    #[error("provider returned HTTP {status}: {message}")]
    Provider {
        status: u16,
        message: String,
        /// Server-suggested wait before retrying, from the Retry-After header.
        retry_after: Option<Duration>,
    },

    /// The request never produced an HTTP response (connect failure, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response arrived but its body was not in the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Provider message if this is a provider error, otherwise the display form.
    pub fn message(&self) -> String {
        match self {
            Self::Provider { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// HTTP status if the provider answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors surfaced by the strategy engine after its recovery budget is spent.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Retry, prompt-variant, and protocol fallbacks all exhausted.
    ///
    /// `message` is human-readable and already carries the
    /// classification-specific hint; `class` is the classification of the
    /// last failing attempt.
    #[error("image generation failed for model {model}: {message}")]
    Exhausted {
        model: String,
        class: FailureClass,
        message: String,
    },

    /// The multimodal response contained no extractable image payload.
    #[error("no image payload found in multimodal response (model {model})")]
    NoImagePayload { model: String },

    /// A reference image could not be read from the scratch workspace.
    #[error("failed to read reference image {path}: {source}")]
    ReferenceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Classification of the underlying failure, for fallback decisions.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Exhausted { class, .. } => *class,
            Self::NoImagePayload { .. } => FailureClass::Fatal,
            Self::ReferenceRead { .. } | Self::Other(_) => FailureClass::Unclassified,
        }
    }
}

/// Errors from job submission and lifecycle management.
#[derive(Debug, Error)]
pub enum JobError {
    /// A second unit of work was submitted under an id that is already
    /// running. Job ids are freshly generated per request, so this is a
    /// programming error, not a recoverable runtime condition.
    #[error("job {id} already has an active execution")]
    AlreadyActive { id: JobId },

    /// The orchestrator is shutting down and accepts no new work. The job
    /// record has already been transitioned to FAILED when this is returned.
    #[error("orchestrator is shutting down; job {id} rejected")]
    ShuttingDown { id: JobId },

    #[error("failed to stage reference files: {0}")]
    Workspace(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_provider_error_carries_status_and_message() {
        let err = BackendError::Provider {
            status: 503,
            message: "No available channels".to_string(),
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.message(), "No available channels");
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn backend_transport_error_has_no_status() {
        let err = BackendError::Transport("connection refused".to_string());
        assert_eq!(err.status(), None);
        assert!(err.message().contains("connection refused"));
    }

    #[test]
    fn engine_exhausted_exposes_class() {
        let err = EngineError::Exhausted {
            model: "seedream-4".to_string(),
            class: FailureClass::ContentRejected,
            message: "prompt judged non-pictorial".to_string(),
        };
        assert_eq!(err.class(), FailureClass::ContentRejected);
        assert!(err.to_string().contains("seedream-4"));
    }

    #[test]
    fn engine_no_payload_is_fatal() {
        let err = EngineError::NoImagePayload {
            model: "gemini-3-pro-image-preview".to_string(),
        };
        assert_eq!(err.class(), FailureClass::Fatal);
    }

    #[test]
    fn job_error_already_active_carries_id() {
        let id = uuid::Uuid::new_v4();
        let err = JobError::AlreadyActive { id };
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&BackendError::Transport("x".into()));
        assert_std_error(&EngineError::NoImagePayload { model: "m".into() });
        assert_std_error(&JobError::ShuttingDown {
            id: uuid::Uuid::new_v4(),
        });
    }
}
