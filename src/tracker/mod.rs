//! Issue tracker integration.
//!
//! The orchestrator files follow-up items when an execution times out or a
//! required quality gate fails. Filing is best effort: a tracker failure is
//! logged and never changes an execution's outcome.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{TrackerKind, TrackerSettings};
use crate::errors::TrackerError;

/// Follow-up item to create in a project's tracker. Priority 0 is the most
/// urgent, 4 the least.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUp {
    pub project_id: String,
    pub project_path: PathBuf,
    pub title: String,
    pub description: String,
    pub priority: u8,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_followup(&self, followup: &FollowUp) -> Result<(), TrackerError>;
}

/// Files follow-ups with the beads CLI: `bd create <title> --description
/// <text> --priority <n>`, run inside the project directory.
pub struct BeadsTracker {
    bd_cmd: String,
}

impl BeadsTracker {
    pub fn new(bd_cmd: impl Into<String>) -> Self {
        Self {
            bd_cmd: bd_cmd.into(),
        }
    }
}

#[async_trait]
impl IssueTracker for BeadsTracker {
    async fn create_followup(&self, followup: &FollowUp) -> Result<(), TrackerError> {
        let output = Command::new(&self.bd_cmd)
            .arg("create")
            .arg(&followup.title)
            .arg("--description")
            .arg(&followup.description)
            .arg("--priority")
            .arg(followup.priority.min(4).to_string())
            .current_dir(&followup.project_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| TrackerError::Io {
                program: self.bd_cmd.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(TrackerError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Drops every follow-up. Used when no tracker is configured.
pub struct NoopTracker;

#[async_trait]
impl IssueTracker for NoopTracker {
    async fn create_followup(&self, followup: &FollowUp) -> Result<(), TrackerError> {
        tracing::debug!(project = %followup.project_id, title = %followup.title, "tracker disabled, dropping follow-up");
        Ok(())
    }
}

pub fn build_tracker(settings: &TrackerSettings) -> Arc<dyn IssueTracker> {
    match settings.kind {
        TrackerKind::Beads => Arc::new(BeadsTracker::new(&settings.bd_cmd)),
        TrackerKind::None => Arc::new(NoopTracker),
    }
}

/// Create a follow-up, logging instead of propagating any failure.
pub async fn file_followup(tracker: &dyn IssueTracker, followup: FollowUp) {
    match tracker.create_followup(&followup).await {
        Ok(()) => {
            tracing::info!(project = %followup.project_id, title = %followup.title, "filed follow-up");
        }
        Err(e) => {
            tracing::warn!(project = %followup.project_id, title = %followup.title, error = %e, "failed to file follow-up");
        }
    }
}
