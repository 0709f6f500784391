use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::tail_lines;

/// Opaque execution identifier, unique per `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ExecutionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| format!("Invalid execution id: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Queued,
    Running,
    AwaitingQualityGate,
    Completed,
    Blocked,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::AwaitingQualityGate => "awaiting_quality_gate",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Blocked | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Cancellation is honored only before quality gates start.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Whether new output may still be appended in this state.
    pub fn accepts_output(&self) -> bool {
        matches!(self, Self::Running | Self::AwaitingQualityGate)
    }

    pub fn can_transition_to(&self, to: ExecutionState) -> bool {
        is_valid_transition(*self, to)
    }
}

/// The full transition table. Anything not listed here is rejected.
pub fn is_valid_transition(from: ExecutionState, to: ExecutionState) -> bool {
    use ExecutionState::*;
    matches!(
        (from, to),
        (Queued, Running)
            | (Queued, Failed)
            | (Queued, Cancelled)
            | (Running, AwaitingQualityGate)
            | (Running, Blocked)
            | (Running, Failed)
            | (Running, TimedOut)
            | (Running, Cancelled)
            | (AwaitingQualityGate, Completed)
            | (AwaitingQualityGate, Failed)
    )
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "awaiting_quality_gate" => Ok(Self::AwaitingQualityGate),
            "completed" => Ok(Self::Completed),
            "blocked" => Ok(Self::Blocked),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid execution state: {}", s)),
        }
    }
}

/// Implementing a bead, or reviewing what is already on the branch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    #[default]
    Work,
    Review,
}

/// What a caller asks the orchestrator to run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub project_id: String,
    pub bead_id: String,
    pub project_path: PathBuf,
}

/// One attempt to run the agent against one bead.
///
/// Cloning an `Execution` out of the store yields a point-in-time snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub project_id: String,
    pub bead_id: String,
    pub project_path: PathBuf,
    #[serde(default)]
    pub kind: ExecutionKind,
    pub state: ExecutionState,
    pub command: Vec<String>,
    /// Runner handle (container id for docker) once the agent is spawned.
    pub runner_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_output_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Output chunks in arrival order.
    pub output: Vec<String>,
    pub output_bytes: usize,
    pub exit_code: Option<i32>,
    pub blocked_reason: Option<String>,
    /// Per-gate pass/fail; present only once gates have been evaluated.
    pub quality_gate_result: Option<BTreeMap<String, bool>>,
    /// No output for longer than the idle threshold.
    pub idle: bool,
}

impl Execution {
    pub fn queued(id: ExecutionId, request: &ExecutionRequest, command: Vec<String>) -> Self {
        Self {
            id,
            project_id: request.project_id.clone(),
            bead_id: request.bead_id.clone(),
            project_path: request.project_path.clone(),
            kind: ExecutionKind::Work,
            state: ExecutionState::Queued,
            command,
            runner_handle: None,
            created_at: Utc::now(),
            started_at: None,
            last_output_at: None,
            ended_at: None,
            output: Vec::new(),
            output_bytes: 0,
            exit_code: None,
            blocked_reason: None,
            quality_gate_result: None,
            idle: false,
        }
    }

    /// The whole output buffer as one string.
    pub fn output_text(&self) -> String {
        self.output.concat()
    }
}

/// Summary used by the progress endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressInfo {
    pub running: bool,
    pub execution_id: Option<ExecutionId>,
    pub state: Option<ExecutionState>,
    pub output: String,
    pub recent: Vec<String>,
    pub bytes: usize,
    pub idle: bool,
}

impl ProgressInfo {
    pub const RECENT_LINES: usize = 10;

    pub fn idle_project() -> Self {
        Self {
            running: false,
            execution_id: None,
            state: None,
            output: String::new(),
            recent: Vec::new(),
            bytes: 0,
            idle: false,
        }
    }

    pub fn from_execution(execution: &Execution) -> Self {
        let output = execution.output_text();
        let recent = tail_lines(&output, Self::RECENT_LINES)
            .lines()
            .map(str::to_string)
            .collect();
        Self {
            running: !execution.state.is_terminal(),
            execution_id: Some(execution.id),
            state: Some(execution.state),
            output,
            recent,
            bytes: execution.output_bytes,
            idle: execution.idle,
        }
    }
}
