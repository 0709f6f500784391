//! Runners launch a command in an isolated environment and hand back a
//! stream of output plus an exit notification.
//!
//! ```text
//!   Runner::spawn(CommandSpec) ──► RunHandle { id, output: mpsc, exit: oneshot }
//!   Runner::terminate(id)       ──► best-effort stop; exit still arrives on `exit`
//!   Runner::is_alive(id)        ──► leak detection after a missed grace period
//! ```
//!
//! - `ProcessRunner` runs the command as a local child process.
//! - `DockerRunner` runs it in a throwaway container with the project
//!   mounted at `/workspace`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::config::{RunnerKind, Settings};
use crate::errors::RunnerError;

pub mod docker;
pub mod process;

pub use docker::DockerRunner;
pub use process::ProcessRunner;

/// Capacity of the output channel between a runner and its reader.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// The runner kills the command on its own once this elapses.
    pub timeout: Duration,
    /// Project id, used to label containers.
    pub project_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunExit {
    pub exit_code: i32,
    /// The runner's own timeout fired before the command exited.
    pub terminated_by_timeout: bool,
}

/// A launched command. Output chunks arrive in order on `output`; the
/// channel closes when the command's output ends.
#[derive(Debug)]
pub struct RunHandle {
    pub id: String,
    pub output: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<RunExit>,
}

/// Collect output still buffered once the command has exited. Descendants
/// that inherited the output can keep it open, so collection stops after
/// `limit`.
pub async fn drain_output(output: &mut mpsc::Receiver<String>, limit: Duration) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + limit;
    let mut chunks = Vec::new();
    while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, output.recv()).await {
        chunks.push(chunk);
    }
    chunks
}

/// Abstraction over command execution for testability.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn spawn(&self, spec: CommandSpec) -> Result<RunHandle, RunnerError>;

    /// Ask the command to stop. Idempotent; unknown handles are ignored.
    async fn terminate(&self, handle_id: &str) -> Result<(), RunnerError>;

    async fn is_alive(&self, handle_id: &str) -> bool;

    /// Command a person can run to get a shell where `handle_id` runs.
    fn attach_command(&self, _handle_id: &str) -> Option<String> {
        None
    }
}

/// Build the runner selected in settings.
pub fn build_runner(settings: &Settings) -> Result<Arc<dyn Runner>> {
    match settings.runner.kind {
        RunnerKind::Process => Ok(Arc::new(ProcessRunner::new())),
        RunnerKind::Docker => Ok(Arc::new(DockerRunner::connect(
            &settings.sandbox,
            settings.orchestrator.grace_period(),
        )?)),
    }
}
