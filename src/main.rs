use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use vitrine::config::{ConfigHandle, RuntimeConfig, is_valid_aspect_ratio};
use vitrine::engine::GenerationEngine;
use vitrine::errors::JobError;
use vitrine::job::work::{
    DescriptionParams, MaterialParams, PageOutline, generate_descriptions, generate_material,
};
use vitrine::job::{
    GLOBAL_SCOPE, JobId, JobKind, JobOrchestrator, JobRegistry, JobStatus, ScratchWorkspace,
};
use vitrine::request::RequestMode;

#[derive(Parser)]
#[command(name = "vitrine")]
#[command(version, about = "Generation job orchestrator for e-commerce marketing imagery")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one marketing material image
    Generate {
        /// Image generation prompt
        #[arg(short, long)]
        prompt: String,

        /// Primary reference image (a composition to imitate or edit)
        #[arg(long = "ref")]
        reference: Option<PathBuf>,

        /// Additional reference images (repeatable)
        #[arg(long = "extra")]
        extras: Vec<PathBuf>,

        /// Target aspect ratio as W:H
        #[arg(long)]
        aspect_ratio: Option<String>,

        /// Target resolution label (1K/2K/4K)
        #[arg(long)]
        resolution: Option<String>,

        /// Target model (defaults to VITRINE_IMAGE_MODEL)
        #[arg(short, long)]
        model: Option<String>,

        /// Replace the product in the reference with the one in the extras
        #[arg(long)]
        product_replace: bool,

        /// Output directory
        #[arg(short, long, default_value = "output")]
        out: PathBuf,

        /// Owner project id (defaults to the global scope)
        #[arg(long)]
        project: Option<String>,
    },
    /// Generate page descriptions from outlines
    Describe {
        /// One page outline per flag (repeatable)
        #[arg(long = "outline", required = true)]
        outlines: Vec<String>,

        /// Target model (defaults to VITRINE_TEXT_MODEL)
        #[arg(short, long)]
        model: Option<String>,

        /// Output directory
        #[arg(short, long, default_value = "output")]
        out: PathBuf,

        /// Owner project id (defaults to the global scope)
        #[arg(long)]
        project: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Generate {
            prompt,
            reference,
            extras,
            aspect_ratio,
            resolution,
            model,
            product_replace,
            out,
            project,
        } => {
            run_generate(
                prompt,
                reference,
                extras,
                aspect_ratio,
                resolution,
                model,
                product_replace,
                out,
                project,
            )
            .await
        }
        Commands::Describe {
            outlines,
            model,
            out,
            project,
        } => run_describe(outlines, model, out, project).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "vitrine=debug" } else { "vitrine=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[allow(clippy::too_many_arguments)]
async fn run_generate(
    prompt: String,
    reference: Option<PathBuf>,
    extras: Vec<PathBuf>,
    aspect_ratio: Option<String>,
    resolution: Option<String>,
    model: Option<String>,
    product_replace: bool,
    out: PathBuf,
    project: Option<String>,
) -> Result<()> {
    let mut config = RuntimeConfig::from_env()?;
    if let Some(ratio) = aspect_ratio {
        if !is_valid_aspect_ratio(&ratio) {
            bail!("invalid aspect ratio {ratio:?}; expected W:H");
        }
        config.default_aspect_ratio = ratio;
    }
    if let Some(resolution) = resolution {
        config.default_resolution = resolution;
    }
    let model = model.unwrap_or_else(|| config.image_model.clone());

    if product_replace && (reference.is_none() || extras.is_empty()) {
        bail!("--product-replace needs --ref and at least one --extra");
    }

    let registry = JobRegistry::new();
    let orchestrator = JobOrchestrator::new(registry.clone(), ConfigHandle::new(config.clone()));
    let engine = Arc::new(GenerationEngine::from_config(&config)?);

    // Stage reference files before submission; the workspace travels with
    // the job and is reclaimed when it finishes.
    let workspace = ScratchWorkspace::create(&std::env::temp_dir().join("vitrine"))?;
    let primary_ref = reference
        .map(|path| stage_file(&workspace, &path))
        .transpose()?;
    let auxiliary_refs = extras
        .iter()
        .map(|path| stage_file(&workspace, path))
        .collect::<Result<Vec<_>>>()?;

    let scope = project.as_deref().unwrap_or(GLOBAL_SCOPE);
    let job_id = registry.create(JobKind::GenerateMaterial, scope, 1);
    info!("submitting material job {job_id} (model {model})");

    let params = MaterialParams {
        prompt,
        primary_ref,
        auxiliary_refs,
        aspect_ratio: config.default_aspect_ratio.clone(),
        resolution: config.default_resolution.clone(),
        mode: product_replace.then_some(RequestMode::ProductReplace),
        model,
        output_dir: out,
    };
    orchestrator.submit(job_id, JobKind::GenerateMaterial, move |ctx| {
        generate_material(ctx, engine, params, workspace)
    })?;

    wait_for_job(&registry, job_id).await
}

async fn run_describe(
    outlines: Vec<String>,
    model: Option<String>,
    out: PathBuf,
    project: Option<String>,
) -> Result<()> {
    let config = RuntimeConfig::from_env()?;
    let model = model.unwrap_or_else(|| config.text_model.clone());

    let registry = JobRegistry::new();
    let orchestrator = JobOrchestrator::new(registry.clone(), ConfigHandle::new(config.clone()));
    let engine = Arc::new(GenerationEngine::from_config(&config)?);

    let scope = project.as_deref().unwrap_or(GLOBAL_SCOPE);
    let total = outlines.len() as u32;
    let job_id = registry.create(JobKind::GenerateDescriptions, scope, total);
    info!("submitting description job {job_id} ({total} page(s), model {model})");

    let params = DescriptionParams {
        outlines: outlines
            .into_iter()
            .enumerate()
            .map(|(index, outline)| PageOutline {
                index: index as u32 + 1,
                outline,
            })
            .collect(),
        model,
        output_dir: out,
    };
    orchestrator.submit(job_id, JobKind::GenerateDescriptions, move |ctx| {
        generate_descriptions(ctx, engine, params)
    })?;

    wait_for_job(&registry, job_id).await
}

fn stage_file(workspace: &ScratchWorkspace, path: &Path) -> Result<PathBuf> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("ref.png");
    let staged = workspace.stage(name, &bytes).map_err(JobError::Workspace)?;
    Ok(staged)
}

async fn wait_for_job(registry: &JobRegistry, job_id: JobId) -> Result<()> {
    let mut last_settled = 0;
    loop {
        let Some(job) = registry.get(job_id) else {
            bail!("job {job_id} record disappeared");
        };
        if job.progress.settled() != last_settled {
            last_settled = job.progress.settled();
            info!(
                "progress: {}/{} done ({} failed)",
                job.progress.settled(),
                job.progress.total,
                job.progress.failed
            );
        }
        match job.status {
            JobStatus::Completed => {
                println!(
                    "job {job_id} completed: {} succeeded, {} failed",
                    job.progress.completed, job.progress.failed
                );
                return Ok(());
            }
            JobStatus::Failed => {
                bail!(
                    "job {job_id} failed: {}",
                    job.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            JobStatus::Pending | JobStatus::Running => {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}
