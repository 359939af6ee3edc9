//! In-process job registry.
//!
//! The durable record of a job's identity, status, and progress. Mutated
//! only by the orchestrator; read by status-polling collaborators from any
//! thread. Terminal states are sticky and progress counters are clamped
//! monotonic, so a misbehaving caller cannot violate the job state machine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use super::{JobId, JobKind, JobSnapshot, JobStatus, Progress};

/// Shared handle to the job store. Cheap to clone.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<RwLock<HashMap<JobId, JobSnapshot>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a PENDING record and return its id.
    pub fn create(&self, kind: JobKind, owner_scope: &str, total: u32) -> JobId {
        let id = Uuid::new_v4();
        let record = JobSnapshot {
            id,
            kind,
            owner_scope: owner_scope.to_string(),
            status: JobStatus::Pending,
            progress: Progress::new(total),
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.write().insert(id, record);
        id
    }

    /// `PENDING → RUNNING`. A transition from any other state is ignored.
    pub fn transition_to_running(&self, id: JobId) {
        let mut map = self.write();
        let Some(record) = map.get_mut(&id) else {
            warn!("transition_to_running: job {id} no longer exists");
            return;
        };
        match record.status {
            JobStatus::Pending => record.status = JobStatus::Running,
            other => warn!("transition_to_running: job {id} is {other:?}, ignoring"),
        }
    }

    /// Set absolute progress counters. Values are clamped so counters stay
    /// monotonic and `completed + failed` never exceeds `total`.
    pub fn update_progress(&self, id: JobId, completed: u32, failed: u32) {
        let mut map = self.write();
        let Some(record) = map.get_mut(&id) else {
            warn!("update_progress: job {id} no longer exists");
            return;
        };
        if record.status.is_terminal() {
            warn!("update_progress: job {id} already terminal, ignoring");
            return;
        }
        let progress = &mut record.progress;
        let mut completed = completed.max(progress.completed);
        let mut failed = failed.max(progress.failed);
        if completed + failed > progress.total {
            warn!(
                "update_progress: job {id} counters {completed}+{failed} exceed total {}, clamping",
                progress.total
            );
            // Clamp while keeping both counters monotonic.
            completed = completed.min(progress.total - progress.failed);
            failed = failed.min(progress.total - completed);
        }
        progress.completed = completed;
        progress.failed = failed;
    }

    /// Transition into a terminal state. Idempotent: once terminal, later
    /// calls are ignored. `error` is recorded only on failure.
    pub fn transition_to_terminal(&self, id: JobId, success: bool, error: Option<String>) {
        let mut map = self.write();
        let Some(record) = map.get_mut(&id) else {
            warn!("transition_to_terminal: job {id} no longer exists");
            return;
        };
        if record.status.is_terminal() {
            warn!(
                "transition_to_terminal: job {id} already {:?}, ignoring",
                record.status
            );
            return;
        }
        record.status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        record.error = if success { None } else { error };
        record.completed_at = Some(Utc::now());
    }

    /// Read one job's current snapshot.
    pub fn get(&self, id: JobId) -> Option<JobSnapshot> {
        self.read().get(&id).cloned()
    }

    /// Delete a record. The running execution, if any, continues; its result
    /// simply goes unobserved.
    pub fn remove(&self, id: JobId) -> Option<JobSnapshot> {
        self.write().remove(&id)
    }

    /// All jobs for an owner scope, newest first.
    pub fn list_for_scope(&self, owner_scope: &str) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .read()
            .values()
            .filter(|j| j.owner_scope == owner_scope)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobSnapshot>> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobSnapshot>> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
