//! Execution orchestrator.
//!
//! ```text
//!  start(request, config)
//!    ├─ reserve project lock ────────── AlreadyRunning if held
//!    ├─ insert `queued` record
//!    ├─ Runner::spawn ───────────────── spawn error → `failed`, lock released
//!    ├─ `running`
//!    └─ tokio::spawn(supervise)
//!          monitor loop: output │ block marker │ deadline │ cancel │ idle tick
//!          exit 0 → `awaiting_quality_gate` → gates → `completed` | `failed`
//!          finish: terminal state + lock release in one critical section
//! ```
//!
//! One supervising task runs per active execution. It is the only writer of
//! its record after `start` returns; `cancel` only signals it.

mod monitor;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::errors::ExecutionError;
use crate::execution::{
    Execution, ExecutionId, ExecutionKind, ExecutionRequest, ExecutionState, ExecutionStore,
    ProgressInfo, ProjectLockGuard, ProjectLocks,
};
use crate::gates::QualityGate;
use crate::runner::{CommandSpec, Runner};
use crate::signals::DEFAULT_BLOCK_MARKER;
use crate::tracker::IssueTracker;
use crate::util::expand_placeholders;

/// Extra time `cancel` waits beyond the grace period for the supervising
/// task to record the terminal state.
const CANCEL_SETTLE_MARGIN: Duration = Duration::from_secs(5);

/// Per-execution knobs, resolved from settings and the project's gates.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub kind: ExecutionKind,
    /// Agent argv; `{project_id}` and `{bead_id}` are substituted.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub absolute_timeout: Duration,
    pub idle_threshold: Duration,
    pub grace_period: Duration,
    pub block_marker: String,
    pub gates: Vec<QualityGate>,
    pub short_circuit_gates: bool,
    pub followup_priority: u8,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            kind: ExecutionKind::Work,
            command: vec!["claude".to_string()],
            env: BTreeMap::new(),
            absolute_timeout: Duration::from_secs(6 * 60 * 60),
            idle_threshold: Duration::from_secs(5 * 60),
            grace_period: Duration::from_secs(10),
            block_marker: DEFAULT_BLOCK_MARKER.to_string(),
            gates: Vec::new(),
            short_circuit_gates: false,
            followup_priority: 1,
        }
    }
}

impl ExecutionConfig {
    pub fn from_settings(settings: &Settings, gates: Vec<QualityGate>) -> Self {
        let orchestrator = &settings.orchestrator;
        Self {
            kind: ExecutionKind::Work,
            command: settings.agent.command.clone(),
            env: settings.agent.env.clone(),
            absolute_timeout: orchestrator.absolute_timeout(),
            idle_threshold: orchestrator.idle_threshold(),
            grace_period: orchestrator.grace_period(),
            block_marker: orchestrator.block_marker.clone(),
            gates,
            short_circuit_gates: orchestrator.short_circuit_gates,
            followup_priority: orchestrator.followup_priority,
        }
    }

    /// A review run: the review command, no quality gates.
    pub fn for_review(settings: &Settings) -> Self {
        Self {
            kind: ExecutionKind::Review,
            command: settings.agent.review_command.clone(),
            ..Self::from_settings(settings, Vec::new())
        }
    }
}

/// How to get a shell next to a live execution.
#[derive(Debug, Clone, Serialize)]
pub struct AttachInfo {
    pub execution_id: ExecutionId,
    pub container_id: String,
    pub command: String,
}

struct ActiveExecution {
    cancel: CancellationToken,
    grace_period: Duration,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: ExecutionStore,
    locks: ProjectLocks,
    runner: Arc<dyn Runner>,
    tracker: Arc<dyn IssueTracker>,
    active: Arc<Mutex<HashMap<ExecutionId, ActiveExecution>>>,
}

impl Orchestrator {
    pub fn new(
        store: ExecutionStore,
        locks: ProjectLocks,
        runner: Arc<dyn Runner>,
        tracker: Arc<dyn IssueTracker>,
    ) -> Self {
        Self {
            store,
            locks,
            runner,
            tracker,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    pub fn locks(&self) -> &ProjectLocks {
        &self.locks
    }

    fn active(&self) -> MutexGuard<'_, HashMap<ExecutionId, ActiveExecution>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start an execution and return its id without waiting for it.
    ///
    /// Fails only with `AlreadyRunning`. A runner that cannot be spawned
    /// still yields an id whose record is `failed` with the spawn error as
    /// its output.
    pub async fn start(
        &self,
        request: ExecutionRequest,
        config: ExecutionConfig,
    ) -> Result<ExecutionId, ExecutionError> {
        let id = ExecutionId::new();
        let lock = self.locks.try_acquire(&request.project_path, id)?;

        let command = expand_placeholders(&config.command, &request.project_id, &request.bead_id);
        let mut queued = Execution::queued(id, &request, command.clone());
        queued.kind = config.kind;
        self.store.insert(queued);
        let cancel = CancellationToken::new();
        self.active().insert(
            id,
            ActiveExecution {
                cancel: cancel.clone(),
                grace_period: config.grace_period,
            },
        );
        tracing::info!(
            execution = %id,
            project = %request.project_id,
            bead = %request.bead_id,
            kind = ?config.kind,
            "execution queued"
        );

        let spec = CommandSpec {
            argv: command,
            workdir: request.project_path.clone(),
            env: agent_env(&config, &request),
            // backstop only; the monitor's own deadline fires first
            timeout: config.absolute_timeout + config.grace_period,
            project_id: request.project_id.clone(),
        };
        let handle = match self.runner.spawn(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(execution = %id, error = %e, "agent failed to start");
                let diagnostic = format!("failed to start agent: {}\n", e);
                self.record_finish(id, ExecutionState::Failed, Some(lock), move |execution| {
                    push_output(execution, diagnostic)
                });
                return Ok(id);
            }
        };

        let handle_id = handle.id.clone();
        if let Err(e) = self.store.transition(id, ExecutionState::Running, |execution| {
            execution.runner_handle = Some(handle_id)
        }) {
            tracing::error!(execution = %id, error = %e, "could not mark execution running");
            if let Err(e) = self.runner.terminate(&handle.id).await {
                tracing::warn!(execution = %id, error = %e, "failed to terminate runner");
            }
            self.record_finish(id, ExecutionState::Failed, Some(lock), |_| {});
            return Ok(id);
        }
        tracing::info!(execution = %id, handle = %handle.id, "execution running");

        let this = self.clone();
        tokio::spawn(async move {
            this.supervise(id, request, config, handle, cancel, lock)
                .await;
        });
        Ok(id)
    }

    /// Point-in-time snapshot.
    pub fn get_status(&self, id: ExecutionId) -> Result<Execution, ExecutionError> {
        self.store.get(id).ok_or(ExecutionError::NotFound { id })
    }

    /// Request cancellation and wait for the execution to settle.
    ///
    /// Terminal executions are returned unchanged. Executions already in
    /// quality-gate evaluation are rejected with `NotCancellable`.
    pub async fn cancel(&self, id: ExecutionId) -> Result<Execution, ExecutionError> {
        let current = self.get_status(id)?;
        if current.state.is_terminal() {
            return Ok(current);
        }
        if !current.state.is_cancellable() {
            return Err(ExecutionError::NotCancellable {
                id,
                state: current.state,
            });
        }

        let grace_period = {
            let active = self.active();
            match active.get(&id) {
                Some(entry) => {
                    entry.cancel.cancel();
                    entry.grace_period
                }
                None => Duration::ZERO,
            }
        };
        tracing::info!(execution = %id, "cancellation requested");

        let settled = tokio::time::timeout(
            grace_period + CANCEL_SETTLE_MARGIN,
            self.store.wait_terminal(id),
        )
        .await;
        let snapshot = match settled {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Err(ExecutionError::NotFound { id }),
            Err(_) => {
                tracing::warn!(execution = %id, "execution did not settle after cancellation");
                self.get_status(id)?
            }
        };
        if snapshot.state == ExecutionState::AwaitingQualityGate {
            // the cancel raced with a clean agent exit
            return Err(ExecutionError::NotCancellable {
                id,
                state: snapshot.state,
            });
        }
        Ok(snapshot)
    }

    /// Block until the execution reaches a terminal state.
    pub async fn wait(&self, id: ExecutionId) -> Result<Execution, ExecutionError> {
        self.store
            .wait_terminal(id)
            .await
            .ok_or(ExecutionError::NotFound { id })
    }

    /// Output chunks from `offset`, plus whether the log is final.
    pub fn output_since(
        &self,
        id: ExecutionId,
        offset: usize,
    ) -> Result<(Vec<String>, bool), ExecutionError> {
        self.store
            .output_since(id, offset)
            .ok_or(ExecutionError::NotFound { id })
    }

    /// Replay output from `offset`, then follow it live until the execution
    /// is terminal.
    pub fn stream_output(
        &self,
        id: ExecutionId,
        offset: usize,
    ) -> Result<impl Stream<Item = String> + Send + 'static + use<>, ExecutionError> {
        self.store
            .stream_output(id, offset)
            .ok_or(ExecutionError::NotFound { id })
    }

    /// Shell access to the project's live execution, when its runner offers
    /// one.
    pub fn attach(&self, project_id: &str) -> Result<AttachInfo, ExecutionError> {
        let not_attachable = || ExecutionError::NotAttachable {
            project_id: project_id.to_string(),
        };
        let execution = self
            .store
            .latest_for_project(project_id)
            .filter(|execution| !execution.state.is_terminal())
            .ok_or_else(not_attachable)?;
        let container_id = execution.runner_handle.ok_or_else(not_attachable)?;
        let command = self
            .runner
            .attach_command(&container_id)
            .ok_or_else(not_attachable)?;
        Ok(AttachInfo {
            execution_id: execution.id,
            container_id,
            command,
        })
    }

    /// Progress of the most recent execution for a project.
    pub fn progress(&self, project_id: &str) -> ProgressInfo {
        self.store
            .latest_for_project(project_id)
            .map(|execution| ProgressInfo::from_execution(&execution))
            .unwrap_or_else(ProgressInfo::idle_project)
    }

    /// Move to a terminal state, releasing the lock in the same step, and
    /// forget the cancel token.
    fn record_finish(
        &self,
        id: ExecutionId,
        to: ExecutionState,
        lock: Option<ProjectLockGuard>,
        mutate: impl FnOnce(&mut Execution),
    ) -> Option<Execution> {
        let result = self.store.finish(id, to, mutate, lock);
        self.active().remove(&id);
        match result {
            Ok(snapshot) => {
                tracing::info!(
                    execution = %id,
                    state = %snapshot.state,
                    exit_code = ?snapshot.exit_code,
                    "execution finished"
                );
                Some(snapshot)
            }
            Err(e) => {
                tracing::error!(execution = %id, error = %e, "failed to record terminal state");
                None
            }
        }
    }
}

/// Append text to the output log directly, bypassing the state check.
fn push_output(execution: &mut Execution, text: String) {
    execution.output_bytes += text.len();
    execution.output.push(text);
}

fn agent_env(config: &ExecutionConfig, request: &ExecutionRequest) -> BTreeMap<String, String> {
    let mut env = config.env.clone();
    env.insert("BEADWORK_PROJECT_ID".to_string(), request.project_id.clone());
    env.insert("BEADWORK_BEAD_ID".to_string(), request.bead_id.clone());
    env
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::test_support::{RecordingTracker, ScriptedRunner, Script, TERMINATED_EXIT};

    struct Harness {
        orchestrator: Orchestrator,
        runner: Arc<ScriptedRunner>,
        tracker: Arc<RecordingTracker>,
    }

    fn harness() -> Harness {
        let runner = Arc::new(ScriptedRunner::new());
        let tracker = Arc::new(RecordingTracker::new());
        let orchestrator = Orchestrator::new(
            ExecutionStore::default(),
            ProjectLocks::new(),
            runner.clone(),
            tracker.clone(),
        );
        Harness {
            orchestrator,
            runner,
            tracker,
        }
    }

    fn request(project: &str) -> ExecutionRequest {
        ExecutionRequest {
            project_id: project.to_string(),
            bead_id: "bd-1".to_string(),
            project_path: PathBuf::from(format!("/work/{}", project)),
        }
    }

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            command: vec!["agent".to_string(), "{bead_id}".to_string()],
            grace_period: Duration::from_secs(1),
            ..Default::default()
        }
    }

    async fn finished(orchestrator: &Orchestrator, id: ExecutionId) -> Execution {
        tokio::time::timeout(Duration::from_secs(10), orchestrator.wait(id))
            .await
            .expect("execution did not finish")
            .unwrap()
    }

    async fn wait_for_state(orchestrator: &Orchestrator, id: ExecutionId, state: ExecutionState) {
        for _ in 0..500 {
            if orchestrator.get_status(id).unwrap().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution never reached {}", state);
    }

    #[tokio::test]
    async fn test_clean_exit_without_gates_completes() {
        let h = harness();
        h.runner.on("agent", Script::exits(0).output(&["working\n"]));

        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        let execution = finished(&h.orchestrator, id).await;

        assert_eq!(execution.state, ExecutionState::Completed);
        assert_eq!(execution.exit_code, Some(0));
        assert_eq!(execution.quality_gate_result, Some(BTreeMap::new()));
        assert_eq!(execution.kind, ExecutionKind::Work);
        assert_eq!(execution.runner_handle.as_deref(), Some("scripted-0"));
        assert!(execution.started_at.is_some());
        assert!(execution.ended_at.is_some());
        assert!(!h.orchestrator.locks().is_held(&request("alpha").project_path));
    }

    #[tokio::test]
    async fn test_command_and_env_are_expanded() {
        let h = harness();
        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        let execution = finished(&h.orchestrator, id).await;

        assert_eq!(execution.command, vec!["agent", "bd-1"]);
        let spawned = &h.runner.spawned()[0];
        assert_eq!(spawned.argv, vec!["agent", "bd-1"]);
        assert_eq!(spawned.workdir, PathBuf::from("/work/alpha"));
        assert_eq!(spawned.env.get("BEADWORK_BEAD_ID").unwrap(), "bd-1");
        assert_eq!(spawned.env.get("BEADWORK_PROJECT_ID").unwrap(), "alpha");
    }

    #[tokio::test]
    async fn test_second_start_on_same_project_is_rejected() {
        let h = harness();
        h.runner.on("agent", Script::hangs());

        let first = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        match h.orchestrator.start(request("alpha"), config()).await {
            Err(ExecutionError::AlreadyRunning { project }) => {
                assert_eq!(project, PathBuf::from("/work/alpha"))
            }
            other => panic!("Expected AlreadyRunning, got {:?}", other),
        }
        assert_eq!(h.orchestrator.store().len(), 1, "rejection creates no record");

        // other projects are unaffected
        let other = h.orchestrator.start(request("beta"), config()).await.unwrap();

        h.orchestrator.cancel(first).await.unwrap();
        h.orchestrator.cancel(other).await.unwrap();
        assert!(h.orchestrator.start(request("alpha"), config()).await.is_ok());
    }

    #[tokio::test]
    async fn test_output_chunks_keep_arrival_order() {
        let h = harness();
        h.runner.on("agent", Script::exits(0).output(&["a", "b", "c"]));

        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        let execution = finished(&h.orchestrator, id).await;

        assert_eq!(execution.output, vec!["a", "b", "c"]);
        assert_eq!(execution.output_bytes, 3);
        assert!(execution.last_output_at.is_some());
    }

    #[tokio::test]
    async fn test_block_marker_stops_runner_and_discards_later_output() {
        let h = harness();
        h.runner.on(
            "agent",
            Script::hangs().output(&[
                "normal line\n",
                "BLOCKED: missing API key\n",
                "trailing line\n",
            ]),
        );

        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        let execution = finished(&h.orchestrator, id).await;

        assert_eq!(execution.state, ExecutionState::Blocked);
        assert_eq!(execution.blocked_reason.as_deref(), Some("missing API key"));
        assert_eq!(
            execution.output,
            vec!["normal line\n", "BLOCKED: missing API key\n"]
        );
        assert_eq!(execution.exit_code, Some(TERMINATED_EXIT));
        assert!(execution.quality_gate_result.is_none());
        assert_eq!(h.runner.terminated().len(), 1);
        assert!(!h.orchestrator.locks().is_held(&request("alpha").project_path));
    }

    #[tokio::test]
    async fn test_block_marker_inside_a_chunk() {
        let h = harness();
        h.runner.on(
            "agent",
            Script::hangs().output(&["normal line\nBLOCKED: missing API key\ntrailing line\n"]),
        );

        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        let execution = finished(&h.orchestrator, id).await;

        assert_eq!(execution.state, ExecutionState::Blocked);
        assert_eq!(
            execution.output,
            vec!["normal line\nBLOCKED: missing API key\n"]
        );
    }

    #[tokio::test]
    async fn test_block_marker_on_unterminated_last_line() {
        let h = harness();
        h.runner.on(
            "agent",
            Script::exits(1).output(&["work\n", "BLOCKED: need review"]),
        );

        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        let execution = finished(&h.orchestrator, id).await;

        assert_eq!(execution.state, ExecutionState::Blocked);
        assert_eq!(execution.blocked_reason.as_deref(), Some("need review"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let h = harness();
        h.runner.on("agent", Script::exits(2).output(&["crash\n"]));

        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        let execution = finished(&h.orchestrator, id).await;

        assert_eq!(execution.state, ExecutionState::Failed);
        assert_eq!(execution.exit_code, Some(2));
        assert!(execution.quality_gate_result.is_none());
        assert!(h.tracker.filed().is_empty());
    }

    #[tokio::test]
    async fn test_sigint_exit_counts_as_cancelled() {
        let h = harness();
        h.runner.on("agent", Script::exits(130));

        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        let execution = finished(&h.orchestrator, id).await;

        assert_eq!(execution.state, ExecutionState::Cancelled);
        assert_eq!(execution.exit_code, None);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_recorded_as_failed() {
        let h = harness();
        h.runner.on("agent", Script::spawn_failure());

        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        let execution = h.orchestrator.get_status(id).unwrap();

        assert_eq!(execution.state, ExecutionState::Failed);
        assert!(execution.output_text().contains("failed to start agent"));
        assert!(execution.started_at.is_none());
        assert!(!h.orchestrator.locks().is_held(&request("alpha").project_path));
    }

    #[tokio::test]
    async fn test_cancel_running_execution_is_idempotent() {
        let h = harness();
        h.runner.on("agent", Script::hangs().output(&["started\n"]));

        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        let first = h.orchestrator.cancel(id).await.unwrap();
        assert_eq!(first.state, ExecutionState::Cancelled);
        assert_eq!(first.exit_code, None);
        assert!(!h.orchestrator.locks().is_held(&request("alpha").project_path));

        let second = h.orchestrator.cancel(id).await.unwrap();
        assert_eq!(second.state, ExecutionState::Cancelled);
        assert_eq!(second.ended_at, first.ended_at);
        assert_eq!(h.runner.terminated().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_execution() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.cancel(ExecutionId::new()).await,
            Err(ExecutionError::NotFound { .. })
        ));
        assert!(matches!(
            h.orchestrator.get_status(ExecutionId::new()),
            Err(ExecutionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_quality_gates_is_rejected() {
        let h = harness();
        h.runner.on("agent", Script::exits(0));
        h.runner.on(
            "slow-tests",
            Script::exits(0).exit_after(Duration::from_millis(500)),
        );
        let mut config = config();
        config.gates = vec![QualityGate::new("tests", &["slow-tests"], true)];

        let id = h.orchestrator.start(request("alpha"), config).await.unwrap();
        wait_for_state(&h.orchestrator, id, ExecutionState::AwaitingQualityGate).await;

        match h.orchestrator.cancel(id).await {
            Err(ExecutionError::NotCancellable { state, .. }) => {
                assert_eq!(state, ExecutionState::AwaitingQualityGate)
            }
            other => panic!("Expected NotCancellable, got {:?}", other.map(|e| e.state)),
        }
        assert!(
            h.orchestrator.locks().is_held(&request("alpha").project_path),
            "lock stays held while gates run"
        );

        let execution = finished(&h.orchestrator, id).await;
        assert_eq!(execution.state, ExecutionState::Completed);
    }

    #[tokio::test]
    async fn test_gate_reduction() {
        let h = harness();
        h.runner.on("agent", Script::exits(0));
        h.runner.on("run-tests", Script::exits(1).output(&["1 test failed\n"]));
        h.runner.on("run-lint", Script::exits(1));
        h.runner.on("run-build", Script::exits(0));
        let mut config = config();
        config.gates = vec![
            QualityGate::new("tests", &["run-tests"], true),
            QualityGate::new("lint", &["run-lint"], false),
            QualityGate::new("build", &["run-build"], true),
        ];

        let id = h.orchestrator.start(request("alpha"), config).await.unwrap();
        let execution = finished(&h.orchestrator, id).await;

        assert_eq!(execution.state, ExecutionState::Failed);
        assert_eq!(execution.exit_code, Some(0));
        let results = execution.quality_gate_result.clone().unwrap();
        assert_eq!(results.get("tests"), Some(&false));
        assert_eq!(results.get("lint"), Some(&false));
        assert_eq!(results.get("build"), Some(&true));
        assert!(execution
            .output_text()
            .contains("==> quality gate tests (required): failed\n1 test failed\n"));

        let filed = h.tracker.filed();
        assert_eq!(filed.len(), 1);
        assert!(filed[0].title.contains("tests"));
        assert!(!h.orchestrator.locks().is_held(&request("alpha").project_path));
    }

    #[tokio::test]
    async fn test_optional_gate_failure_still_completes() {
        let h = harness();
        h.runner.on("agent", Script::exits(0));
        h.runner.on("run-lint", Script::exits(1));
        let mut config = config();
        config.gates = vec![
            QualityGate::new("tests", &["run-tests"], true),
            QualityGate::new("lint", &["run-lint"], false),
        ];

        let id = h.orchestrator.start(request("alpha"), config).await.unwrap();
        let execution = finished(&h.orchestrator, id).await;

        assert_eq!(execution.state, ExecutionState::Completed);
        assert_eq!(
            execution.quality_gate_result.unwrap().get("lint"),
            Some(&false)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_absolute_timeout_terminates_and_files_followup() {
        let h = harness();
        h.runner.on("agent", Script::hangs().output(&["thinking\n"]));
        let mut config = config();
        config.absolute_timeout = Duration::from_secs(60);

        let id = h.orchestrator.start(request("alpha"), config).await.unwrap();
        let execution = h.orchestrator.wait(id).await.unwrap();

        assert_eq!(execution.state, ExecutionState::TimedOut);
        assert_eq!(execution.exit_code, Some(TERMINATED_EXIT));
        assert_eq!(h.runner.terminated().len(), 1);
        assert!(!h.orchestrator.locks().is_held(&request("alpha").project_path));

        // the follow-up is filed right after the terminal transition
        tokio::time::sleep(Duration::from_millis(10)).await;
        let filed = h.tracker.filed();
        assert_eq!(filed.len(), 1);
        assert!(filed[0].title.contains("timed out"));
        assert!(filed[0].description.contains("thinking"));
        assert_eq!(filed[0].project_path, PathBuf::from("/work/alpha"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_silence_is_flagged_but_not_fatal() {
        let h = harness();
        h.runner.on(
            "agent",
            Script::exits(0).output_after(Duration::from_secs(30), "finally\n"),
        );
        let mut config = config();
        config.idle_threshold = Duration::from_secs(10);

        let id = h.orchestrator.start(request("alpha"), config).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        let snapshot = h.orchestrator.get_status(id).unwrap();
        assert_eq!(snapshot.state, ExecutionState::Running);
        assert!(snapshot.idle);

        let execution = h.orchestrator.wait(id).await.unwrap();
        assert_eq!(execution.state, ExecutionState::Completed);
        assert!(!execution.idle);
        assert_eq!(execution.output, vec!["finally\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_runner_still_reaches_cancelled() {
        let h = harness();
        h.runner.on("agent", Script::hangs().unresponsive());
        let mut config = config();
        config.grace_period = Duration::from_secs(10);

        let id = h.orchestrator.start(request("alpha"), config).await.unwrap();
        let execution = h.orchestrator.cancel(id).await.unwrap();

        assert_eq!(execution.state, ExecutionState::Cancelled);
        assert!(!h.orchestrator.locks().is_held(&request("alpha").project_path));
    }

    #[tokio::test]
    async fn test_lock_released_after_every_terminal_state() {
        let scripts = vec![
            (Script::exits(0), ExecutionState::Completed),
            (Script::exits(4), ExecutionState::Failed),
            (
                Script::hangs().output(&["BLOCKED: waiting\n"]),
                ExecutionState::Blocked,
            ),
            (Script::exits(130), ExecutionState::Cancelled),
            (Script::spawn_failure(), ExecutionState::Failed),
        ];
        let h = harness();
        for (script, expected) in scripts {
            h.runner.push(script);
            let mut config = config();
            config.command = vec!["queued-agent".to_string()];
            let id = h.orchestrator.start(request("alpha"), config).await.unwrap();
            let execution = finished(&h.orchestrator, id).await;
            assert_eq!(execution.state, expected);
            assert!(
                !h.orchestrator.locks().is_held(&request("alpha").project_path),
                "lock held after {}",
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_progress_reports_latest_execution() {
        let h = harness();
        assert_eq!(h.orchestrator.progress("alpha"), ProgressInfo::idle_project());

        h.runner.on("agent", Script::exits(0).output(&["one\n", "two\n"]));
        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        finished(&h.orchestrator, id).await;

        let progress = h.orchestrator.progress("alpha");
        assert!(!progress.running);
        assert_eq!(progress.execution_id, Some(id));
        assert_eq!(progress.recent, vec!["one", "two"]);
        assert_eq!(progress.bytes, 8);
    }

    #[tokio::test]
    async fn test_stream_output_follows_live_execution() {
        let h = harness();
        h.runner.on(
            "agent",
            Script::exits(0)
                .output(&["a\n"])
                .output_after(Duration::from_millis(50), "b\n")
                .output_after(Duration::from_millis(50), "c\n"),
        );

        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();
        let stream = h.orchestrator.stream_output(id, 0).unwrap();
        let chunks: Vec<String> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .unwrap();
        assert_eq!(chunks, vec!["a\n", "b\n", "c\n"]);

        let (tail, done) = h.orchestrator.output_since(id, 2).unwrap();
        assert_eq!(tail, vec!["c\n"]);
        assert!(done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_completes_while_output_is_held_open() {
        let h = harness();
        h.runner.on(
            "agent",
            Script::exits(0).output(&["done\n"]).holds_output_open(),
        );
        let mut config = config();
        config.absolute_timeout = Duration::from_secs(60);

        let started = tokio::time::Instant::now();
        let id = h.orchestrator.start(request("alpha"), config).await.unwrap();
        let execution = h.orchestrator.wait(id).await.unwrap();

        assert_eq!(execution.state, ExecutionState::Completed);
        assert_eq!(execution.exit_code, Some(0));
        assert_eq!(execution.output, vec!["done\n"]);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert!(h.runner.terminated().is_empty());
        assert!(h.tracker.filed().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_child_does_not_turn_clean_exit_into_timeout() {
        let orchestrator = Orchestrator::new(
            ExecutionStore::default(),
            ProjectLocks::new(),
            Arc::new(crate::runner::ProcessRunner::new()),
            Arc::new(RecordingTracker::new()),
        );
        let config = ExecutionConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "sleep 30 & echo done; exit 0".to_string(),
            ],
            absolute_timeout: Duration::from_secs(20),
            grace_period: Duration::from_secs(1),
            ..Default::default()
        };
        let mut request = request("alpha");
        request.project_path = std::env::temp_dir();

        let started = std::time::Instant::now();
        let id = orchestrator.start(request, config).await.unwrap();
        let execution = finished(&orchestrator, id).await;

        assert_eq!(execution.state, ExecutionState::Completed);
        assert_eq!(execution.exit_code, Some(0));
        assert_eq!(execution.output_text(), "done\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_monitor_panic_fails_execution_and_frees_lock() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("agent", Script::exits(0));
        runner.on("run-tests", Script::exits(1));
        let orchestrator = Orchestrator::new(
            ExecutionStore::default(),
            ProjectLocks::new(),
            runner.clone(),
            Arc::new(RecordingTracker::panicking()),
        );
        let mut gated = config();
        gated.gates = vec![QualityGate::new("tests", &["run-tests"], true)];

        let id = orchestrator.start(request("alpha"), gated).await.unwrap();
        let execution = finished(&orchestrator, id).await;

        assert_eq!(execution.state, ExecutionState::Failed);
        assert!(
            execution
                .output_text()
                .ends_with("internal error: tracker exploded\n")
        );
        assert!(!orchestrator.locks().is_held(&request("alpha").project_path));
        assert!(orchestrator.start(request("alpha"), config()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let h = harness();
        h.runner.on(
            "agent",
            Script::hangs().spawn_after(Duration::from_millis(200)),
        );

        let orchestrator = h.orchestrator.clone();
        let start = tokio::spawn(async move { orchestrator.start(request("alpha"), config()).await });

        let mut queued = None;
        for _ in 0..100 {
            if let Some(execution) = h.orchestrator.store().latest_for_project("alpha") {
                queued = Some(execution);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let queued = queued.expect("execution was never recorded");
        assert_eq!(queued.state, ExecutionState::Queued);

        let execution = h.orchestrator.cancel(queued.id).await.unwrap();
        assert_eq!(execution.state, ExecutionState::Cancelled);
        assert_eq!(execution.exit_code, None);
        assert_eq!(start.await.unwrap().unwrap(), queued.id);
        assert_eq!(h.runner.terminated().len(), 1);
        assert!(!h.orchestrator.locks().is_held(&request("alpha").project_path));
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_output_in_order() {
        let h = harness();
        let expected: Vec<String> = (0..20).map(|n| format!("{}\n", n)).collect();
        let mut script = Script::exits(0);
        for chunk in &expected {
            script = script.output_after(Duration::from_millis(5), chunk);
        }
        h.runner.on("agent", script);

        let id = h.orchestrator.start(request("alpha"), config()).await.unwrap();

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let orchestrator = h.orchestrator.clone();
                let expected = expected.clone();
                tokio::spawn(async move {
                    let mut seen = 0;
                    loop {
                        let snapshot = orchestrator.get_status(id).unwrap();
                        assert_eq!(snapshot.output[..], expected[..snapshot.output.len()]);

                        let (chunks, finished) = orchestrator.output_since(id, 0).unwrap();
                        assert!(chunks.len() >= seen, "output shrank");
                        assert_eq!(chunks[..], expected[..chunks.len()]);
                        seen = chunks.len();
                        if finished {
                            return seen;
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                })
            })
            .collect();

        for reader in readers {
            assert_eq!(reader.await.unwrap(), expected.len());
        }
        let execution = finished(&h.orchestrator, id).await;
        assert_eq!(execution.output, expected);
    }
}
