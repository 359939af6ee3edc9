//! Static routing from model identifiers to backend protocols.
//!
//! Providers expose the same logical capability through two incompatible
//! request shapes. Which one a model answers on is only knowable from its
//! name, so routing is a table of name patterns resolved once per request,
//! not conditionals scattered through the engine.

use serde::{Deserialize, Serialize};

/// The two supported image-generation wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Single request `{model, prompt, n, size}`; no reference images.
    Structured,
    /// Chat-style request with inline reference images.
    Conversational,
}

#[derive(Debug, Clone, Copy)]
enum ModelPattern {
    Substring(&'static str),
    Prefix(&'static str),
}

impl ModelPattern {
    fn matches(&self, model: &str) -> bool {
        match self {
            Self::Substring(s) => model.contains(s),
            Self::Prefix(p) => model.starts_with(p),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Route {
    pattern: ModelPattern,
    protocol: Protocol,
    /// Provider known to reject non-pictorial vocabulary; gets the
    /// synthesized descriptive fallback prompt first.
    strict_vocabulary: bool,
}

/// Outcome of routing one model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub protocol: Protocol,
    pub strict_vocabulary: bool,
}

/// The routing table. Kept as ordinary data so the full model-name matching
/// surface lives in one place.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
    default_protocol: Protocol,
}

impl RouteTable {
    /// The standard table: known Images-API model families route to the
    /// structured protocol; everything else is conversational.
    pub fn standard() -> Self {
        Self {
            routes: vec![
                Route {
                    pattern: ModelPattern::Substring("seedream"),
                    protocol: Protocol::Structured,
                    strict_vocabulary: true,
                },
                Route {
                    pattern: ModelPattern::Substring("gpt-image"),
                    protocol: Protocol::Structured,
                    strict_vocabulary: false,
                },
                Route {
                    pattern: ModelPattern::Substring("dall"),
                    protocol: Protocol::Structured,
                    strict_vocabulary: false,
                },
                Route {
                    pattern: ModelPattern::Prefix("doubao-"),
                    protocol: Protocol::Structured,
                    strict_vocabulary: false,
                },
            ],
            default_protocol: Protocol::Conversational,
        }
    }

    /// Resolve a model identifier to a protocol. First matching row wins.
    pub fn resolve(&self, model: &str) -> ResolvedRoute {
        let normalized = model.trim().to_lowercase();
        for route in &self.routes {
            if route.pattern.matches(&normalized) {
                return ResolvedRoute {
                    protocol: route.protocol,
                    strict_vocabulary: route.strict_vocabulary,
                };
            }
        }
        ResolvedRoute {
            protocol: self.default_protocol,
            strict_vocabulary: false,
        }
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Rewrite model aliases that some proxies do not route.
///
/// `nanobananpro` is a community alias for `gemini-3-pro-image-preview`;
/// sending the alias to yunwu yields "No available channels".
pub fn normalize_model(model: &str, api_base: &str) -> String {
    let raw = model.trim();
    if api_base.to_lowercase().contains("yunwu.ai") && raw.eq_ignore_ascii_case("nanobananpro") {
        return "gemini-3-pro-image-preview".to_string();
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seedream_routes_structured_and_strict() {
        let table = RouteTable::standard();
        let route = table.resolve("doubao-seedream-4-0-250828");
        assert_eq!(route.protocol, Protocol::Structured);
        assert!(route.strict_vocabulary);
    }

    #[test]
    fn images_api_families_route_structured() {
        let table = RouteTable::standard();
        assert_eq!(table.resolve("gpt-image-1").protocol, Protocol::Structured);
        assert_eq!(table.resolve("dall-e-3").protocol, Protocol::Structured);
        assert_eq!(
            table.resolve("doubao-vision-pro").protocol,
            Protocol::Structured
        );
    }

    #[test]
    fn unknown_models_route_conversational() {
        let table = RouteTable::standard();
        let route = table.resolve("gemini-3-pro-image-preview");
        assert_eq!(route.protocol, Protocol::Conversational);
        assert!(!route.strict_vocabulary);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let table = RouteTable::standard();
        assert_eq!(table.resolve("GPT-Image-1").protocol, Protocol::Structured);
    }

    #[test]
    fn doubao_prefix_does_not_match_midstring() {
        let table = RouteTable::standard();
        assert_eq!(
            table.resolve("my-doubao-clone").protocol,
            Protocol::Conversational
        );
    }

    #[test]
    fn nanobanana_alias_rewritten_on_yunwu_only() {
        assert_eq!(
            normalize_model("nanobananpro", "https://yunwu.ai/v1"),
            "gemini-3-pro-image-preview"
        );
        assert_eq!(
            normalize_model("nanobananpro", "https://aihubmix.com/v1"),
            "nanobananpro"
        );
        assert_eq!(
            normalize_model("gemini-3-pro-image-preview", "https://yunwu.ai/v1"),
            "gemini-3-pro-image-preview"
        );
    }
}
