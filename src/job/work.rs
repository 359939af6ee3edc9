//! Job bodies: the glue between the orchestrator and the strategy engine.
//!
//! Each body owns its scratch workspace for the whole execution, drives the
//! engine, writes results into the output directory, and reports sub-step
//! progress through the context.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::engine::GenerationEngine;
use crate::request::{GeneratedImage, GenerationRequest, RequestMode};

use super::orchestrator::JobContext;
use super::workspace::ScratchWorkspace;

/// Prompt preamble for product replacement against a reference composition.
const PRODUCT_REPLACE_INSTRUCTION: &str = "Replace the product in the first reference image with \
     the product shown in the other reference images. Keep the original composition, lighting and \
     layout.";

/// Inputs for a one-off material image.
pub struct MaterialParams {
    pub prompt: String,
    pub primary_ref: Option<PathBuf>,
    pub auxiliary_refs: Vec<PathBuf>,
    pub aspect_ratio: String,
    pub resolution: String,
    pub mode: Option<RequestMode>,
    pub model: String,
    pub output_dir: PathBuf,
}

/// Generate one marketing material image. `total = 1`.
pub async fn generate_material(
    ctx: JobContext,
    engine: Arc<GenerationEngine>,
    params: MaterialParams,
    workspace: ScratchWorkspace,
) -> Result<()> {
    // Held for the whole execution; reclaimed on every exit path.
    let _workspace = workspace;

    let prompt = match params.mode {
        Some(RequestMode::ProductReplace) => {
            format!("{PRODUCT_REPLACE_INSTRUCTION}\n\n{}", params.prompt)
        }
        None => params.prompt.clone(),
    };

    let mut request = GenerationRequest::new(prompt, &params.model)
        .with_aspect_ratio(&params.aspect_ratio)
        .with_resolution(&params.resolution)
        .with_auxiliary_refs(params.auxiliary_refs.clone());
    if let Some(ref primary) = params.primary_ref {
        request = request.with_primary_ref(primary);
    }
    if let Some(mode) = params.mode {
        request = request.with_mode(mode);
    }

    match engine.generate_image(&request).await {
        Ok(image) => {
            let stem = format!("material-{}", ctx.job_id);
            write_image(&params.output_dir, &stem, &image)?;
            ctx.registry.update_progress(ctx.job_id, 1, 0);
            Ok(())
        }
        Err(err) => {
            ctx.registry.update_progress(ctx.job_id, 0, 1);
            // Summarized for the registry; no backtraces reach the caller.
            Err(anyhow!("{err}"))
        }
    }
}

/// One page of a batch image job.
pub struct PageSpec {
    pub index: u32,
    pub prompt: String,
}

/// Inputs for a batch of page images.
pub struct PageImageParams {
    pub pages: Vec<PageSpec>,
    /// Shared product reference staged in the workspace, if any.
    pub primary_ref: Option<PathBuf>,
    pub aspect_ratio: String,
    pub resolution: String,
    pub model: String,
    pub output_dir: PathBuf,
}

/// Generate one image per page on the inner bounded pool.
pub async fn generate_page_images(
    ctx: JobContext,
    engine: Arc<GenerationEngine>,
    params: PageImageParams,
    workspace: ScratchWorkspace,
) -> Result<()> {
    let _workspace = workspace;
    let PageImageParams {
        pages,
        primary_ref,
        aspect_ratio,
        resolution,
        model,
        output_dir,
    } = params;

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;

    let engine = &engine;
    let primary_ref = &primary_ref;
    let aspect_ratio = &aspect_ratio;
    let resolution = &resolution;
    let model = &model;
    let output_dir = &output_dir;
    ctx.run_substeps(pages, |page| async move {
        let mut request = GenerationRequest::new(page.prompt, model)
            .with_aspect_ratio(aspect_ratio)
            .with_resolution(resolution);
        if let Some(primary) = primary_ref {
            request = request.with_primary_ref(primary);
        }
        let image = engine
            .generate_image(&request)
            .await
            .map_err(|err| anyhow!("page {}: {err}", page.index))?;
        write_image(output_dir, &format!("page-{:02}", page.index), &image)?;
        Ok(())
    })
    .await
}

/// One page outline of a batch description job.
pub struct PageOutline {
    pub index: u32,
    pub outline: String,
}

/// Inputs for a batch of page descriptions.
pub struct DescriptionParams {
    pub outlines: Vec<PageOutline>,
    pub model: String,
    pub output_dir: PathBuf,
}

/// Generate one text description per page outline.
pub async fn generate_descriptions(
    ctx: JobContext,
    engine: Arc<GenerationEngine>,
    params: DescriptionParams,
) -> Result<()> {
    let DescriptionParams {
        outlines,
        model,
        output_dir,
    } = params;

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;

    let engine = &engine;
    let model = &model;
    let output_dir = &output_dir;
    ctx.run_substeps(outlines, |page| async move {
        let text = engine
            .generate_text(model, &page.outline)
            .await
            .map_err(|err| anyhow!("page {}: {err}", page.index))?;
        if text.trim().is_empty() {
            return Err(anyhow!("page {}: empty completion", page.index));
        }
        let path = output_dir.join(format!("page-{:02}.md", page.index));
        std::fs::write(&path, text)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("wrote {}", path.display());
        Ok(())
    })
    .await
}

/// Write a generated image under `dir` with its detected extension.
fn write_image(dir: &Path, stem: &str, image: &GeneratedImage) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output dir {}", dir.display()))?;
    let path = dir.join(format!("{stem}.{}", image.extension()));
    std::fs::write(&path, &image.bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(
        "wrote {} ({}x{})",
        path.display(),
        image.width,
        image.height
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png() -> GeneratedImage {
        let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([0, 0, 0, 255]));
        let mut bytes = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut bytes);
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut cursor, image::ImageFormat::Png)
            .unwrap();
        GeneratedImage {
            bytes,
            width: 1,
            height: 1,
            format: image::ImageFormat::Png,
        }
    }

    #[test]
    fn write_image_uses_detected_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "material-abc", &tiny_png()).unwrap();
        assert_eq!(path.extension().unwrap(), "png");
        assert!(path.exists());
    }

    #[test]
    fn write_image_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        let path = write_image(&nested, "page-01", &tiny_png()).unwrap();
        assert!(path.starts_with(&nested));
        assert!(path.exists());
    }
}
