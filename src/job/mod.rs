//! Asynchronous generation jobs: domain types, registry, orchestrator,
//! scratch workspaces, and the job bodies themselves.

pub mod orchestrator;
pub mod registry;
pub mod work;
pub mod workspace;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use orchestrator::{JobContext, JobOrchestrator};
pub use registry::JobRegistry;
pub use workspace::ScratchWorkspace;

/// Opaque unique job identifier, freshly generated per request.
pub type JobId = Uuid;

/// Owner scope for jobs not attached to any project.
pub const GLOBAL_SCOPE: &str = "global";

/// Enumerated job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// One-off marketing material image.
    GenerateMaterial,
    /// Batch of page images for a project.
    GenerateImages,
    /// Batch of page descriptions (text).
    GenerateDescriptions,
}

impl JobKind {
    /// The worker family whose pool (and rate-limit budget) this kind uses.
    pub fn family(&self) -> JobFamily {
        match self {
            Self::GenerateMaterial | Self::GenerateImages => JobFamily::Image,
            Self::GenerateDescriptions => JobFamily::Description,
        }
    }
}

/// Worker families with independently sized pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobFamily {
    Image,
    Description,
}

/// Job status. `Pending → Running → {Completed, Failed}`; terminal states
/// are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Sub-step progress counters. Monotonically non-decreasing within a run;
/// `completed + failed` never exceeds `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl Progress {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            completed: 0,
            failed: 0,
        }
    }

    /// Sub-steps that have reached an outcome.
    pub fn settled(&self) -> u32 {
        self.completed + self.failed
    }

    pub fn is_settled(&self) -> bool {
        self.settled() >= self.total
    }
}

/// A read snapshot of one job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub owner_scope: String,
    pub status: JobStatus,
    pub progress: Progress,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
