//! Per-project exclusive lock.
//!
//! At most one execution (or publish) may hold a project at a time. The lock
//! is keyed on the project path and remembers which owner holds it, so a
//! release by anyone other than the holder is detected as a bookkeeping
//! fault rather than silently freeing someone else's lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::ExecutionError;
use crate::execution::ExecutionId;

/// Target used for bookkeeping faults that take the process down.
pub const FATAL_TARGET: &str = "beadwork::fatal";

#[derive(Debug, Clone, Default)]
pub struct ProjectLocks {
    held: Arc<Mutex<HashMap<PathBuf, ExecutionId>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PathBuf, ExecutionId>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `project` for `owner`, or fail with `AlreadyRunning`.
    pub fn try_acquire(
        &self,
        project: &Path,
        owner: ExecutionId,
    ) -> Result<ProjectLockGuard, ExecutionError> {
        let mut table = self.table();
        if table.contains_key(project) {
            return Err(ExecutionError::AlreadyRunning {
                project: project.to_path_buf(),
            });
        }
        table.insert(project.to_path_buf(), owner);
        Ok(ProjectLockGuard {
            locks: self.clone(),
            project: project.to_path_buf(),
            owner,
            released: false,
        })
    }

    pub fn holder(&self, project: &Path) -> Option<ExecutionId> {
        self.table().get(project).copied()
    }

    pub fn is_held(&self, project: &Path) -> bool {
        self.holder(project).is_some()
    }

    fn release_for(&self, project: &Path, owner: ExecutionId) -> Result<(), ExecutionError> {
        let mut table = self.table();
        match table.get(project) {
            Some(holder) if *holder == owner => {
                table.remove(project);
                Ok(())
            }
            Some(holder) => Err(ExecutionError::LockReleaseFault {
                project: project.to_path_buf(),
                detail: format!("held by {}, released by {}", holder, owner),
            }),
            None => Err(ExecutionError::LockReleaseFault {
                project: project.to_path_buf(),
                detail: format!("not held, released by {}", owner),
            }),
        }
    }
}

/// Proof of holding a project lock. Released exactly once, either by
/// [`ProjectLockGuard::release`] or on drop.
#[derive(Debug)]
pub struct ProjectLockGuard {
    locks: ProjectLocks,
    project: PathBuf,
    owner: ExecutionId,
    released: bool,
}

impl ProjectLockGuard {
    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn owner(&self) -> ExecutionId {
        self.owner
    }

    pub fn release(mut self) -> Result<(), ExecutionError> {
        self.released = true;
        self.locks.release_for(&self.project, self.owner)
    }
}

impl Drop for ProjectLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.locks.release_for(&self.project, self.owner) {
            abort_on_lock_fault(&err);
        }
    }
}

/// A failed release means the single-flight guarantee can no longer be
/// trusted. Log at the fatal target and stop the process.
pub fn abort_on_lock_fault(err: &ExecutionError) -> ! {
    tracing::error!(target: FATAL_TARGET, error = %err, "project lock bookkeeping is inconsistent; aborting");
    std::process::abort()
}
