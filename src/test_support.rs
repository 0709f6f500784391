//! Test doubles for the runner and tracker seams.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::errors::{RunnerError, TrackerError};
use crate::runner::{CommandSpec, OUTPUT_CHANNEL_CAPACITY, RunExit, RunHandle, Runner};
use crate::tracker::{FollowUp, IssueTracker};

/// Exit code a scripted command reports after `terminate`.
pub const TERMINATED_EXIT: i32 = 143;

/// What a scripted command does once spawned.
#[derive(Debug, Clone, Default)]
pub struct Script {
    chunks: Vec<(Duration, String)>,
    /// `None` runs until terminated.
    exit: Option<i32>,
    exit_delay: Duration,
    spawn_error: bool,
    spawn_delay: Duration,
    ignore_terminate: bool,
    /// Output stays open after exit, as when a background child inherits it.
    hold_output: bool,
}

impl Script {
    pub fn exits(code: i32) -> Self {
        Self {
            exit: Some(code),
            ..Default::default()
        }
    }

    /// Never exits on its own.
    pub fn hangs() -> Self {
        Self::default()
    }

    pub fn spawn_failure() -> Self {
        Self {
            spawn_error: true,
            ..Default::default()
        }
    }

    pub fn output(mut self, chunks: &[&str]) -> Self {
        self.chunks
            .extend(chunks.iter().map(|c| (Duration::ZERO, c.to_string())));
        self
    }

    pub fn output_after(mut self, delay: Duration, chunk: &str) -> Self {
        self.chunks.push((delay, chunk.to_string()));
        self
    }

    pub fn exit_after(mut self, delay: Duration) -> Self {
        self.exit_delay = delay;
        self
    }

    pub fn unresponsive(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }

    /// `spawn` itself takes `delay` to return.
    pub fn spawn_after(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    pub fn holds_output_open(mut self) -> Self {
        self.hold_output = true;
        self
    }
}

/// Runner that plays back scripts instead of launching anything.
///
/// Scripts registered with [`ScriptedRunner::on`] are matched by program
/// name; otherwise queued scripts are used in order, then `exits(0)`.
#[derive(Default)]
pub struct ScriptedRunner {
    by_program: Mutex<HashMap<String, Script>>,
    queue: Mutex<VecDeque<Script>>,
    spawned: Mutex<Vec<CommandSpec>>,
    terminated: Mutex<Vec<String>>,
    live: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: Script) {
        self.queue.lock().unwrap().push_back(script);
    }

    pub fn on(&self, program: &str, script: Script) {
        self.by_program
            .lock()
            .unwrap()
            .insert(program.to_string(), script);
    }

    pub fn spawned(&self) -> Vec<CommandSpec> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn spawned_programs(&self) -> Vec<String> {
        self.spawned()
            .iter()
            .map(|s| s.argv.first().cloned().unwrap_or_default())
            .collect()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    fn next_script(&self, spec: &CommandSpec) -> Script {
        if let Some(program) = spec.argv.first()
            && let Some(script) = self.by_program.lock().unwrap().get(program)
        {
            return script.clone();
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::exits(0))
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn spawn(&self, spec: CommandSpec) -> Result<RunHandle, RunnerError> {
        let script = self.next_script(&spec);
        if !script.spawn_delay.is_zero() {
            tokio::time::sleep(script.spawn_delay).await;
        }
        if script.spawn_error {
            let program = spec.argv.first().cloned().unwrap_or_default();
            return Err(RunnerError::SpawnFailed {
                program,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        }

        let id = format!("scripted-{}", self.spawned.lock().unwrap().len());
        let timeout = spec.timeout;
        self.spawned.lock().unwrap().push(spec);

        let kill = CancellationToken::new();
        self.live.lock().unwrap().insert(id.clone(), kill.clone());

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let live = Arc::clone(&self.live);
        let handle_id = id.clone();

        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            let ignore_terminate = script.ignore_terminate;
            let kill = &kill;
            let killed = move || async move {
                if ignore_terminate {
                    std::future::pending::<()>().await
                } else {
                    kill.cancelled().await
                }
            };

            let mut result = None;
            for (delay, chunk) in &script.chunks {
                tokio::select! {
                    biased;
                    _ = killed() => {
                        result = Some((TERMINATED_EXIT, false));
                        break;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        result = Some((137, true));
                        break;
                    }
                    _ = tokio::time::sleep(*delay) => {}
                }
                let _ = output_tx.send(chunk.clone()).await;
            }
            if script.hold_output {
                tokio::spawn(async move {
                    let _output_tx = output_tx;
                    std::future::pending::<()>().await
                });
            } else {
                drop(output_tx);
            }

            let (exit_code, terminated_by_timeout) = match result {
                Some(result) => result,
                None => {
                    let natural = async {
                        match script.exit {
                            Some(code) => {
                                tokio::time::sleep(script.exit_delay).await;
                                code
                            }
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        biased;
                        _ = killed() => (TERMINATED_EXIT, false),
                        _ = tokio::time::sleep_until(deadline) => (137, true),
                        code = natural => (code, false),
                    }
                }
            };

            live.lock().unwrap().remove(&handle_id);
            let _ = exit_tx.send(RunExit {
                exit_code,
                terminated_by_timeout,
            });
        });

        Ok(RunHandle {
            id,
            output: output_rx,
            exit: exit_rx,
        })
    }

    async fn terminate(&self, handle_id: &str) -> Result<(), RunnerError> {
        self.terminated.lock().unwrap().push(handle_id.to_string());
        if let Some(kill) = self.live.lock().unwrap().get(handle_id) {
            kill.cancel();
        }
        Ok(())
    }

    async fn is_alive(&self, handle_id: &str) -> bool {
        self.live.lock().unwrap().contains_key(handle_id)
    }

    fn attach_command(&self, handle_id: &str) -> Option<String> {
        Some(format!("scripted-shell {}", handle_id))
    }
}

/// Tracker that remembers every follow-up it is asked to file.
#[derive(Default)]
pub struct RecordingTracker {
    filed: Mutex<Vec<FollowUp>>,
    fail: bool,
    panic: bool,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Panics on every follow-up, standing in for a bug in the monitor.
    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Default::default()
        }
    }

    pub fn filed(&self) -> Vec<FollowUp> {
        self.filed.lock().unwrap().clone()
    }
}

#[async_trait]
impl IssueTracker for RecordingTracker {
    async fn create_followup(&self, followup: &FollowUp) -> Result<(), TrackerError> {
        if self.panic {
            panic!("tracker exploded");
        }
        self.filed.lock().unwrap().push(followup.clone());
        if self.fail {
            return Err(TrackerError::CommandFailed {
                status: 1,
                stderr: "tracker unavailable".into(),
            });
        }
        Ok(())
    }
}
