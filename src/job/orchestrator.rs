//! The job orchestrator.
//!
//! Accepts a job description, runs it on a bounded per-family worker pool,
//! and keeps the registry truthful: every submitted job reaches a terminal
//! state even when its body errors or panics. Submission is synchronous;
//! only the work runs in the background.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHandle, RuntimeConfig};
use crate::errors::JobError;

use super::{JobFamily, JobId, JobKind, JobRegistry};

struct FamilyPool {
    size: usize,
    semaphore: Arc<Semaphore>,
}

/// Everything a job body needs: its id, the registry, and the configuration
/// snapshot captured at submission time.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub registry: JobRegistry,
    pub config: RuntimeConfig,
    /// Bound for the job's inner sub-step pool; mirrors the family worker
    /// count at submission time.
    pub substep_workers: usize,
}

impl JobContext {
    /// Run the job's sub-steps on a bounded inner pool.
    ///
    /// Progress counters go through one guarded mutation site, so
    /// concurrent sub-steps cannot lose updates. Policy: the job as a whole
    /// fails only when zero sub-steps succeed; partial success completes
    /// with the counters telling the story.
    pub async fn run_substeps<T, F, Fut>(&self, items: Vec<T>, step: F) -> anyhow::Result<()>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let total = items.len() as u32;
        let semaphore = Semaphore::new(self.substep_workers.max(1));
        let progress = tokio::sync::Mutex::new((0u32, 0u32, None::<String>));

        let step = &step;
        let semaphore = &semaphore;
        let progress = &progress;
        let futures = items.into_iter().enumerate().map(|(index, item)| async move {
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                // The semaphore is never closed; keep the counters honest
                // anyway if that ever changes.
                Err(_) => {
                    let mut guard = progress.lock().await;
                    guard.1 += 1;
                    self.registry
                        .update_progress(self.job_id, guard.0, guard.1);
                    return;
                }
            };
            let result = step(item).await;
            let mut guard = progress.lock().await;
            match result {
                Ok(()) => guard.0 += 1,
                Err(err) => {
                    guard.1 += 1;
                    if guard.2.is_none() {
                        guard.2 = Some(format!("sub-step {}: {err:#}", index + 1));
                    }
                }
            }
            self.registry
                .update_progress(self.job_id, guard.0, guard.1);
        });
        futures::future::join_all(futures).await;

        let (completed, failed, first_error) = progress.lock().await.clone();
        if total > 0 && completed == 0 {
            anyhow::bail!(
                "all {total} sub-step(s) failed; first failure: {}",
                first_error.unwrap_or_else(|| "unknown".to_string())
            );
        }
        if failed > 0 {
            warn!(
                "job {} finished partially: {completed}/{total} succeeded, {failed} failed",
                self.job_id
            );
        }
        Ok(())
    }
}

/// Schedules job bodies onto bounded background workers and guarantees the
/// registry reaches a terminal state for every accepted submission.
pub struct JobOrchestrator {
    registry: JobRegistry,
    config: ConfigHandle,
    pools: Mutex<HashMap<JobFamily, FamilyPool>>,
    active: Arc<Mutex<HashSet<JobId>>>,
    shutdown: AtomicBool,
}

impl JobOrchestrator {
    pub fn new(registry: JobRegistry, config: ConfigHandle) -> Self {
        Self {
            registry,
            config,
            pools: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashSet::new())),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Schedule `work` for the job. Returns immediately; the work runs on a
    /// family worker once a pool slot frees up.
    ///
    /// Rejections are observable before this returns: a rejected job is
    /// already FAILED in the registry.
    pub fn submit<F, Fut>(&self, job_id: JobId, kind: JobKind, work: F) -> Result<(), JobError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            let message = "orchestrator is shutting down; submission rejected";
            warn!("job {job_id}: {message}");
            self.registry
                .transition_to_terminal(job_id, false, Some(message.to_string()));
            return Err(JobError::ShuttingDown { id: job_id });
        }

        {
            let mut active = lock(&self.active);
            if !active.insert(job_id) {
                // Ids are freshly generated per request; hitting this means a
                // caller reused one.
                error!("duplicate submission for job {job_id}; rejecting");
                return Err(JobError::AlreadyActive { id: job_id });
            }
        }

        let config = self.config.snapshot();
        let family = kind.family();
        let workers = match family {
            JobFamily::Image => config.workers.image_workers,
            JobFamily::Description => config.workers.description_workers,
        }
        .max(1);
        let semaphore = self.pool_for(family, workers);

        let ctx = JobContext {
            job_id,
            registry: self.registry.clone(),
            config,
            substep_workers: workers,
        };
        let registry = self.registry.clone();
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    registry.transition_to_terminal(
                        job_id,
                        false,
                        Some("worker pool closed before the job could start".to_string()),
                    );
                    lock(&active).remove(&job_id);
                    return;
                }
            };

            registry.transition_to_running(job_id);
            info!("job {job_id} ({kind:?}) started");

            // The body runs in its own task so a panic unwinds there and
            // lands here as a JoinError instead of killing the supervisor.
            let outcome = tokio::spawn(async move { work(ctx).await }).await;
            match outcome {
                Ok(Ok(())) => {
                    info!("job {job_id} completed");
                    registry.transition_to_terminal(job_id, true, None);
                }
                Ok(Err(err)) => {
                    let summary = format!("{err:#}");
                    error!("job {job_id} failed: {summary}");
                    registry.transition_to_terminal(job_id, false, Some(summary));
                }
                Err(join_err) => {
                    let summary = if join_err.is_panic() {
                        let payload = join_err.into_panic();
                        let message = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        format!("job panicked: {message}")
                    } else {
                        "job task was cancelled".to_string()
                    };
                    error!("job {job_id} did not finish cleanly: {summary}");
                    registry.transition_to_terminal(job_id, false, Some(summary));
                }
            }
            lock(&active).remove(&job_id);
        });

        Ok(())
    }

    /// Stop accepting new submissions. In-flight jobs run to completion.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        info!("orchestrator shutting down; new submissions rejected");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// The family semaphore sized for `size` workers. A size change installs
    /// a fresh pool for newly submitted work; jobs already holding permits
    /// of the old pool are unaffected.
    fn pool_for(&self, family: JobFamily, size: usize) -> Arc<Semaphore> {
        let mut pools = lock(&self.pools);
        let pool = pools.entry(family).or_insert_with(|| FamilyPool {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
        });
        if pool.size != size {
            debug!("{family:?} pool resized {} -> {size}", pool.size);
            *pool = FamilyPool {
                size,
                semaphore: Arc::new(Semaphore::new(size)),
            };
        }
        Arc::clone(&pool.semaphore)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
