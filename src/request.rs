//! Ephemeral generation request and result types.
//!
//! A [`GenerationRequest`] lives for exactly one job execution; it is never
//! persisted. Attempt-level state stays inside the engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Optional generation mode flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    /// Replace the subject in the primary reference with the product implied
    /// by the auxiliary references, keeping composition and lighting.
    ProductReplace,
}

/// One image-generation request handed to the strategy engine.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Primary reference image (a composition to imitate or edit).
    pub primary_ref: Option<PathBuf>,
    /// Additional reference images (product shots, style references).
    pub auxiliary_refs: Vec<PathBuf>,
    /// Target aspect ratio as `W:H`.
    pub aspect_ratio: String,
    /// Target resolution label (`1K`/`2K`/`4K`); proxies may ignore it.
    pub resolution: String,
    pub mode: Option<RequestMode>,
    /// Target model identifier; drives protocol routing.
    pub model: String,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            primary_ref: None,
            auxiliary_refs: Vec::new(),
            aspect_ratio: "16:9".to_string(),
            resolution: "2K".to_string(),
            mode: None,
            model: model.into(),
        }
    }

    pub fn with_primary_ref(mut self, path: impl Into<PathBuf>) -> Self {
        self.primary_ref = Some(path.into());
        self
    }

    pub fn with_auxiliary_refs(mut self, paths: Vec<PathBuf>) -> Self {
        self.auxiliary_refs = paths;
        self
    }

    pub fn with_aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.aspect_ratio = ratio.into();
        self
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = resolution.into();
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Reference images in send order: primary first, then auxiliaries.
    pub fn reference_paths(&self) -> Vec<&PathBuf> {
        self.primary_ref
            .iter()
            .chain(self.auxiliary_refs.iter())
            .collect()
    }

    pub fn has_references(&self) -> bool {
        self.primary_ref.is_some() || !self.auxiliary_refs.is_empty()
    }
}

/// A validated, decodable generated image.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    /// Raw bytes as returned by the provider (already validated decodable).
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Detected container format.
    pub format: image::ImageFormat,
}

impl GeneratedImage {
    /// Preferred file extension for the detected format.
    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("png")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_paths_orders_primary_first() {
        let request = GenerationRequest::new("a poster", "gemini-3-pro-image-preview")
            .with_primary_ref("/tmp/ref.png")
            .with_auxiliary_refs(vec![PathBuf::from("/tmp/a.png"), PathBuf::from("/tmp/b.png")]);
        let paths: Vec<_> = request
            .reference_paths()
            .into_iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        assert_eq!(paths, vec!["/tmp/ref.png", "/tmp/a.png", "/tmp/b.png"]);
    }

    #[test]
    fn has_references_checks_both_kinds() {
        let bare = GenerationRequest::new("p", "m");
        assert!(!bare.has_references());
        let with_aux = GenerationRequest::new("p", "m")
            .with_auxiliary_refs(vec![PathBuf::from("/tmp/a.png")]);
        assert!(with_aux.has_references());
    }

    #[test]
    fn request_mode_serializes_snake_case() {
        let json = serde_json::to_string(&RequestMode::ProductReplace).unwrap();
        assert_eq!(json, "\"product_replace\"");
    }
}
