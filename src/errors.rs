//! Typed error hierarchy for beadwork.
//!
//! Four enums cover the subsystems:
//! - `ExecutionError` — orchestrator, record store and project lock failures
//! - `RunnerError` — process/container runner failures
//! - `TrackerError` — issue tracker (follow-up filing) failures
//! - `PublishError` — push and pull-request failures

use std::path::PathBuf;

use thiserror::Error;

use crate::execution::{ExecutionId, ExecutionState};

/// Errors from the execution orchestrator and its bookkeeping.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("An execution is already running for project {}", project.display())]
    AlreadyRunning { project: PathBuf },

    #[error("Execution {id} not found")]
    NotFound { id: ExecutionId },

    #[error("Execution {id} cannot be cancelled while {state}")]
    NotCancellable { id: ExecutionId, state: ExecutionState },

    #[error("No live execution to attach to in project {project_id}")]
    NotAttachable { project_id: String },

    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("Project lock for {} could not be released: {detail}", project.display())]
    LockReleaseFault { project: PathBuf, detail: String },
}

/// Errors from a runner implementation.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Empty command")]
    EmptyCommand,

    #[error("Docker error: {0}")]
    Docker(String),
}

/// Errors from the issue tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tracker command exited with {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },
}

/// Errors from pushing a branch and opening a pull request.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Locked(#[from] ExecutionError),

    #[error("`{command}` failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("Failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
