//! Per-job scratch workspaces for staged reference files.
//!
//! A workspace is created before submission, moved into the job body, and
//! reclaimed when dropped, which covers success, classified failure, and
//! panic unwind alike.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

/// A temporary directory owned by exactly one job execution.
pub struct ScratchWorkspace {
    dir: TempDir,
}

impl ScratchWorkspace {
    /// Allocate a workspace under `root`, creating `root` if needed.
    pub fn create(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix("vitrine-job-")
            .tempdir_in(root)?;
        debug!("created scratch workspace {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a reference file into the workspace and return its path.
    pub fn stage(&self, name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        // Reject path traversal in client-supplied names.
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"))?;
        let path = self.dir.path().join(file_name);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Remove the workspace now, surfacing removal errors. Dropping does the
    /// same best-effort.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}
