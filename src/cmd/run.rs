//! Foreground execution — `beadwork run <project> <bead>`.

use std::path::Path;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use beadwork::config::Settings;
use beadwork::execution::{ExecutionRequest, ExecutionState, ExecutionStore, ProjectLocks};
use beadwork::orchestrator::{ExecutionConfig, Orchestrator};
use beadwork::runner::build_runner;
use beadwork::tracker::build_tracker;

/// Process exit status for a finished execution.
pub fn exit_code_for(state: ExecutionState) -> i32 {
    match state {
        ExecutionState::Completed => 0,
        ExecutionState::Blocked => 2,
        ExecutionState::TimedOut => 3,
        ExecutionState::Cancelled => 130,
        _ => 1,
    }
}

/// Run one bead, streaming output to stdout. Ctrl-c cancels the execution.
/// Returns the process exit status.
pub async fn cmd_run(settings: Settings, project_path: &Path, bead_id: &str) -> Result<i32> {
    let project_path = project_path
        .canonicalize()
        .with_context(|| format!("Project directory not found: {}", project_path.display()))?;
    if !project_path.is_dir() {
        anyhow::bail!("Not a directory: {}", project_path.display());
    }
    let project_id = project_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| project_path.display().to_string());

    let gates = settings.gates_for_project(&project_path)?;
    let config = ExecutionConfig::from_settings(&settings, gates);
    let orchestrator = Orchestrator::new(
        ExecutionStore::new(settings.orchestrator.max_retained),
        ProjectLocks::new(),
        build_runner(&settings)?,
        build_tracker(&settings.tracker),
    );

    let request = ExecutionRequest {
        project_id,
        bead_id: bead_id.to_string(),
        project_path,
    };
    let id = orchestrator.start(request, config).await?;
    tracing::info!(execution = %id, bead = %bead_id, "execution started");

    let mut chunks = std::pin::pin!(orchestrator.stream_output(id, 0)?);
    let mut stdout = tokio::io::stdout();
    let mut cancel_requested = false;
    loop {
        tokio::select! {
            chunk = chunks.next() => match chunk {
                Some(chunk) => {
                    stdout.write_all(chunk.as_bytes()).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                eprintln!("\nCancelling...");
                if let Err(e) = orchestrator.cancel(id).await {
                    tracing::warn!(execution = %id, error = %e, "cancel rejected");
                }
            }
        }
    }

    let execution = orchestrator.wait(id).await?;
    eprintln!();
    eprintln!("Execution {} finished: {}", id, execution.state);
    if let Some(reason) = &execution.blocked_reason {
        eprintln!("Blocked: {}", reason);
    }
    if let Some(results) = &execution.quality_gate_result {
        for (gate, passed) in results {
            eprintln!("  {} {}", if *passed { "✓" } else { "✗" }, gate);
        }
    }
    Ok(exit_code_for(execution.state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(ExecutionState::Completed), 0);
        assert_eq!(exit_code_for(ExecutionState::Blocked), 2);
        assert_eq!(exit_code_for(ExecutionState::TimedOut), 3);
        assert_eq!(exit_code_for(ExecutionState::Cancelled), 130);
        assert_eq!(exit_code_for(ExecutionState::Failed), 1);
    }
}
