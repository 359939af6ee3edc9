//! Failure classification for backend errors.
//!
//! Providers here are proxies with non-uniform error bodies, so
//! classification is string-pattern based rather than code based. It is
//! isolated behind [`classify`]: the rest of the engine branches on
//! [`FailureClass`] and never re-inspects raw error text.

use std::fmt;

use crate::errors::BackendError;

/// Handling strategy for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// HTTP 429; retry after a wait.
    RateLimited,
    /// The key/group has no routable channel for this model.
    NoChannel,
    /// The prompt was rejected by a content filter; retrying the same prompt
    /// is pointless.
    ContentRejected,
    /// Any other 5xx or a raw transport failure; retry with backoff.
    Transient,
    /// 401/403/404 and unclassified 4xx; surfaced immediately.
    Fatal,
    /// Failures not arising from a backend call (local I/O etc.).
    Unclassified,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::NoChannel => "NO_CHANNEL",
            Self::ContentRejected => "CONTENT_REJECTED",
            Self::Transient => "TRANSIENT",
            Self::Fatal => "FATAL",
            Self::Unclassified => "UNCLASSIFIED",
        };
        f.write_str(name)
    }
}

impl FailureClass {
    /// Whether the same prompt is worth retrying after a wait.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::NoChannel | Self::Transient)
    }
}

/// Classify a provider failure from its HTTP status and message text.
///
/// Pure and idempotent: the same input always yields the same class.
/// Matching is case-insensitive substring matching, per provider reality.
pub fn classify(status: Option<u16>, message: &str) -> FailureClass {
    let msg = message.to_lowercase();

    if status == Some(429) {
        return FailureClass::RateLimited;
    }
    if msg.contains("no available channel") {
        return FailureClass::NoChannel;
    }
    if is_content_rejection(&msg) {
        return FailureClass::ContentRejected;
    }
    match status {
        Some(s) if (500..600).contains(&s) => FailureClass::Transient,
        Some(_) => FailureClass::Fatal,
        // No HTTP status at all: a raw transport failure.
        None => FailureClass::Transient,
    }
}

/// Classify any backend error.
pub fn classify_backend(err: &BackendError) -> FailureClass {
    match err {
        BackendError::Provider {
            status, message, ..
        } => classify(Some(*status), message),
        BackendError::Transport(_) => FailureClass::Transient,
        BackendError::Malformed(_) => FailureClass::Fatal,
    }
}

fn is_content_rejection(lower_msg: &str) -> bool {
    lower_msg.contains("non-pictorial vocabulary")
        || lower_msg.contains("content has been flagged")
        || (lower_msg.contains("flagged") && lower_msg.contains("content"))
        || (lower_msg.contains("policy") && lower_msg.contains("content"))
}

/// Classification-specific hint appended to surfaced error messages.
pub fn hint_for(class: FailureClass, status: Option<u16>) -> &'static str {
    match (status, class) {
        (Some(401), _) => " (API key invalid or missing)",
        (Some(403), _) => " (this key/group has no permission for the model)",
        (Some(404), _) => " (the service may not support this endpoint)",
        (_, FailureClass::NoChannel) => {
            " (no available channel for this model on this key/group; check permissions or switch models)"
        }
        (_, FailureClass::ContentRejected) => {
            " (prompt judged non-pictorial or flagged; simplify it to a scene description)"
        }
        (_, FailureClass::RateLimited) => {
            " (rate limited; wait 10-30s, or lower concurrency for batch generation)"
        }
        _ => "",
    }
}
