//! Runtime configuration for the orchestrator and backend clients.
//!
//! Configuration is resolved once from the environment into an immutable
//! [`RuntimeConfig`] value. Jobs capture a snapshot at submission time via
//! [`ConfigHandle`], so a configuration change mid-run is only observed by
//! jobs submitted afterwards.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Result, anyhow};

/// Default OpenAI-compatible API base when none is configured.
const DEFAULT_API_BASE: &str = "https://aihubmix.com/v1";

/// Credentials and transport settings for the configured provider.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: String,
    /// Normalized base URL; always carries the `/v1` suffix.
    pub api_base: String,
    /// API key override for the seedream model family, if configured.
    pub seedream_api_key: Option<String>,
    /// Per-attempt request timeout applied by the backend clients.
    pub request_timeout: Duration,
    /// Configured retry count for the engine's attempt loop.
    pub max_retries: u32,
    /// Raw connect-failure retries inside a backend client.
    pub transport_retries: u32,
}

impl ProviderSettings {
    /// API key to use for `model`, honoring the seedream override.
    pub fn api_key_for_model(&self, model: &str) -> &str {
        if model.to_lowercase().contains("seedream")
            && let Some(ref key) = self.seedream_api_key
        {
            return key;
        }
        &self.api_key
    }
}

/// Bounded worker-pool sizes, per job-kind family.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub image_workers: usize,
    pub description_workers: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            image_workers: 2,
            description_workers: 3,
        }
    }
}

/// The full configuration snapshot a job runs with.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub provider: ProviderSettings,
    pub workers: WorkerSettings,
    pub image_model: String,
    pub text_model: String,
    pub default_aspect_ratio: String,
    pub default_resolution: String,
}

impl RuntimeConfig {
    /// Resolve configuration from environment variables.
    ///
    /// `VITRINE_API_KEY` (falling back to `OPENAI_API_KEY`) is required;
    /// everything else has a default.
    pub fn from_env() -> Result<Self> {
        let api_key = env_var("VITRINE_API_KEY")
            .or_else(|| env_var("OPENAI_API_KEY"))
            .ok_or_else(|| anyhow!("VITRINE_API_KEY (or OPENAI_API_KEY) is required"))?;

        let api_base = normalize_api_base(
            &env_var("VITRINE_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        );

        let request_timeout = Duration::from_secs(
            parse_env("VITRINE_REQUEST_TIMEOUT_SECS").unwrap_or(180u64),
        );

        Ok(Self {
            provider: ProviderSettings {
                api_key,
                api_base,
                seedream_api_key: env_var("VITRINE_SEEDREAM_API_KEY"),
                request_timeout,
                max_retries: parse_env("VITRINE_MAX_RETRIES").unwrap_or(2),
                transport_retries: parse_env("VITRINE_TRANSPORT_RETRIES").unwrap_or(2),
            },
            workers: WorkerSettings {
                image_workers: parse_env("VITRINE_IMAGE_WORKERS").unwrap_or(2),
                description_workers: parse_env("VITRINE_DESCRIPTION_WORKERS").unwrap_or(3),
            },
            image_model: env_var("VITRINE_IMAGE_MODEL")
                .unwrap_or_else(|| "gemini-3-pro-image-preview".to_string()),
            text_model: env_var("VITRINE_TEXT_MODEL")
                .unwrap_or_else(|| "gemini-3-flash-preview".to_string()),
            default_aspect_ratio: env_var("VITRINE_ASPECT_RATIO")
                .unwrap_or_else(|| "16:9".to_string()),
            default_resolution: env_var("VITRINE_RESOLUTION").unwrap_or_else(|| "2K".to_string()),
        })
    }

    /// Build a config for tests and embedding without touching the environment.
    pub fn for_provider(api_key: impl Into<String>, api_base: &str) -> Self {
        Self {
            provider: ProviderSettings {
                api_key: api_key.into(),
                api_base: normalize_api_base(api_base),
                seedream_api_key: None,
                request_timeout: Duration::from_secs(180),
                max_retries: 2,
                transport_retries: 2,
            },
            workers: WorkerSettings::default(),
            image_model: "gemini-3-pro-image-preview".to_string(),
            text_model: "gemini-3-flash-preview".to_string(),
            default_aspect_ratio: "16:9".to_string(),
            default_resolution: "2K".to_string(),
        }
    }

    /// Set the worker counts.
    pub fn with_workers(mut self, image_workers: usize, description_workers: usize) -> Self {
        self.workers = WorkerSettings {
            image_workers,
            description_workers,
        };
        self
    }

    /// Set the engine retry count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.provider.max_retries = max_retries;
        self
    }

    /// Set the default image model.
    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = model.into();
        self
    }
}

/// Shared, updatable configuration. The orchestrator snapshots it at each
/// submission; in-flight jobs keep the snapshot they started with.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<RuntimeConfig>>,
}

impl ConfigHandle {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Clone the current configuration.
    pub fn snapshot(&self) -> RuntimeConfig {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply a mutation; visible to submissions that happen afterwards.
    pub fn update(&self, mutate: impl FnOnce(&mut RuntimeConfig)) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        mutate(&mut guard);
    }
}

/// Normalize an OpenAI-compatible API base URL.
///
/// Many proxies require the `/v1` suffix; a bare domain would route requests
/// to an HTML website instead of the JSON API.
pub fn normalize_api_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_API_BASE.to_string();
    }
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
}

/// Validate a `W:H` aspect-ratio string.
pub fn is_valid_aspect_ratio(value: &str) -> bool {
    let Some((w, h)) = value.split_once(':') else {
        return false;
    };
    matches!(
        (w.parse::<u32>(), h.parse::<u32>()),
        (Ok(w), Ok(h)) if w > 0 && h > 0
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_appends_v1_suffix() {
        assert_eq!(normalize_api_base("https://yunwu.ai"), "https://yunwu.ai/v1");
        assert_eq!(
            normalize_api_base("https://yunwu.ai/"),
            "https://yunwu.ai/v1"
        );
    }

    #[test]
    fn normalize_keeps_existing_v1() {
        assert_eq!(
            normalize_api_base("https://aihubmix.com/v1"),
            "https://aihubmix.com/v1"
        );
        assert_eq!(
            normalize_api_base("https://aihubmix.com/v1/"),
            "https://aihubmix.com/v1"
        );
    }

    #[test]
    fn seedream_key_override_applies_to_seedream_models_only() {
        let mut config = RuntimeConfig::for_provider("main-key", "https://yunwu.ai");
        config.provider.seedream_api_key = Some("sd-key".to_string());
        assert_eq!(
            config.provider.api_key_for_model("doubao-seedream-4-0"),
            "sd-key"
        );
        assert_eq!(
            config.provider.api_key_for_model("gemini-3-pro-image-preview"),
            "main-key"
        );
    }

    #[test]
    fn config_handle_snapshot_is_isolated_from_updates() {
        let handle = ConfigHandle::new(
            RuntimeConfig::for_provider("k", "https://api.example.com").with_workers(2, 3),
        );
        let before = handle.snapshot();
        handle.update(|c| c.workers.image_workers = 8);
        assert_eq!(before.workers.image_workers, 2);
        assert_eq!(handle.snapshot().workers.image_workers, 8);
    }

    #[test]
    fn aspect_ratio_validation() {
        assert!(is_valid_aspect_ratio("16:9"));
        assert!(is_valid_aspect_ratio("1:1"));
        assert!(!is_valid_aspect_ratio("16x9"));
        assert!(!is_valid_aspect_ratio("0:9"));
        assert!(!is_valid_aspect_ratio("banana"));
    }

    #[test]
    fn builders_override_defaults() {
        let config = RuntimeConfig::for_provider("k", "https://api.example.com")
            .with_max_retries(7)
            .with_image_model("seedream-4");
        assert_eq!(config.provider.max_retries, 7);
        assert_eq!(config.image_model, "seedream-4");
    }
}
