use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{ExecutionConfig, Orchestrator, push_output};
use crate::execution::{ExecutionId, ExecutionRequest, ExecutionState, ProjectLockGuard};
use crate::gates::{GateContext, GateReport, QualityGateEvaluator, outcome_log};
use crate::runner::{RunExit, RunHandle, drain_output};
use crate::signals::BlockSignalScanner;
use crate::tracker::{FollowUp, file_followup};
use crate::util::tail_lines;

/// Exit status of a command interrupted with SIGINT.
pub const SIGINT_EXIT: i32 = 130;

/// Lines of output carried into a timeout follow-up.
const FOLLOWUP_TAIL_LINES: usize = 40;

/// How the supervising task decided to end an execution.
enum Outcome {
    Failed {
        exit_code: Option<i32>,
        diagnostic: Option<String>,
    },
    Gated {
        exit_code: i32,
        report: GateReport,
    },
    Blocked {
        reason: String,
        exit_code: Option<i32>,
    },
    TimedOut {
        exit_code: Option<i32>,
    },
    Cancelled,
}

enum Stop {
    Exited(Result<RunExit, oneshot::error::RecvError>),
    Interrupted(Interrupt),
}

/// Why the monitor loop stopped reading before the agent exited.
enum Interrupt {
    Cancelled,
    TimedOut,
    Blocked(String),
}

impl Orchestrator {
    pub(super) async fn supervise(
        self,
        id: ExecutionId,
        request: ExecutionRequest,
        config: ExecutionConfig,
        handle: RunHandle,
        cancel: CancellationToken,
        lock: ProjectLockGuard,
    ) {
        let handle_id = handle.id.clone();
        let driven = AssertUnwindSafe(self.drive(id, &request, &config, handle, &cancel))
            .catch_unwind()
            .await;
        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(execution = %id, panic = %message, "execution monitor panicked");
                if let Err(e) = self.runner.terminate(&handle_id).await {
                    tracing::warn!(execution = %id, error = %e, "failed to terminate runner");
                }
                Outcome::Failed {
                    exit_code: None,
                    diagnostic: Some(format!("internal error: {}\n", message)),
                }
            }
        };
        self.settle(id, &request, &config, outcome, lock).await;
    }

    async fn drive(
        &self,
        id: ExecutionId,
        request: &ExecutionRequest,
        config: &ExecutionConfig,
        mut handle: RunHandle,
        cancel: &CancellationToken,
    ) -> Outcome {
        let deadline = Instant::now() + config.absolute_timeout;
        let mut scanner = BlockSignalScanner::new(config.block_marker.clone());
        let mut idle_check = tokio::time::interval(idle_check_period(config.idle_threshold));
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_output = Instant::now();
        let mut idle = false;
        let mut output_open = true;

        let stop = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Stop::Interrupted(Interrupt::Cancelled),
                _ = tokio::time::sleep_until(deadline) => break Stop::Interrupted(Interrupt::TimedOut),
                chunk = handle.output.recv(), if output_open => match chunk {
                    Some(chunk) => {
                        last_output = Instant::now();
                        if idle {
                            idle = false;
                            self.store.set_idle(id, false);
                            tracing::info!(execution = %id, "output resumed");
                        }
                        if let Some(reason) = self.record_chunk(id, &mut scanner, &chunk) {
                            break Stop::Interrupted(Interrupt::Blocked(reason));
                        }
                    }
                    None => {
                        output_open = false;
                        if let Some(reason) = scanner.finish() {
                            break Stop::Interrupted(Interrupt::Blocked(reason));
                        }
                    }
                },
                exit = &mut handle.exit => break Stop::Exited(exit),
                _ = idle_check.tick() => {
                    if !idle && last_output.elapsed() >= config.idle_threshold {
                        idle = true;
                        self.store.set_idle(id, true);
                        tracing::warn!(
                            execution = %id,
                            silent_secs = last_output.elapsed().as_secs(),
                            "no output for longer than the idle threshold"
                        );
                    }
                }
            }
        };

        let interrupt = match stop {
            Stop::Interrupted(interrupt) => interrupt,
            Stop::Exited(exit) => {
                let exit_code = exit.as_ref().ok().map(|exit| exit.exit_code);
                if output_open {
                    // a descendant that inherited the pipe can hold it open
                    // after the agent itself is gone
                    for chunk in drain_output(&mut handle.output, config.grace_period).await {
                        if let Some(reason) = self.record_chunk(id, &mut scanner, &chunk) {
                            return Outcome::Blocked { reason, exit_code };
                        }
                    }
                }
                if let Some(reason) = scanner.finish() {
                    return Outcome::Blocked { reason, exit_code };
                }
                return self.on_exit(id, request, config, exit).await;
            }
        };

        match &interrupt {
            Interrupt::Cancelled => tracing::info!(execution = %id, "stopping runner: cancelled"),
            Interrupt::TimedOut => tracing::warn!(
                execution = %id,
                timeout_secs = config.absolute_timeout.as_secs(),
                "stopping runner: absolute timeout reached"
            ),
            Interrupt::Blocked(reason) => {
                tracing::info!(execution = %id, reason = %reason, "stopping runner: agent reported a block")
            }
        }
        let exit_code = self
            .stop_runner(id, &mut handle, config.grace_period)
            .await
            .map(|exit| exit.exit_code);

        match interrupt {
            Interrupt::Cancelled => Outcome::Cancelled,
            Interrupt::TimedOut => Outcome::TimedOut { exit_code },
            Interrupt::Blocked(reason) => Outcome::Blocked { reason, exit_code },
        }
    }

    /// Append the part of `chunk` before any block marker line. Returns the
    /// block reason when the chunk carried one.
    fn record_chunk(
        &self,
        id: ExecutionId,
        scanner: &mut BlockSignalScanner,
        chunk: &str,
    ) -> Option<String> {
        let signal = scanner.feed(chunk);
        let kept = match &signal {
            Some(signal) => &chunk[..signal.consumed],
            None => chunk,
        };
        if !kept.is_empty() {
            self.store.append_output(id, kept);
        }
        signal.map(|signal| signal.reason)
    }

    /// Terminate the runner and give it the grace period to exit. A runner
    /// that outlives the grace period is reported as leaked.
    async fn stop_runner(
        &self,
        id: ExecutionId,
        handle: &mut RunHandle,
        grace_period: Duration,
    ) -> Option<RunExit> {
        if let Err(e) = self.runner.terminate(&handle.id).await {
            tracing::warn!(execution = %id, handle = %handle.id, error = %e, "failed to terminate runner");
        }
        match tokio::time::timeout(grace_period, &mut handle.exit).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(_)) => None,
            Err(_) => {
                if self.runner.is_alive(&handle.id).await {
                    tracing::error!(
                        execution = %id,
                        handle = %handle.id,
                        grace_secs = grace_period.as_secs(),
                        "runner still alive after grace period; presumed leaked"
                    );
                }
                None
            }
        }
    }

    async fn on_exit(
        &self,
        id: ExecutionId,
        request: &ExecutionRequest,
        config: &ExecutionConfig,
        exit: Result<RunExit, oneshot::error::RecvError>,
    ) -> Outcome {
        let Ok(exit) = exit else {
            return Outcome::Failed {
                exit_code: None,
                diagnostic: Some("runner exited without reporting a status\n".to_string()),
            };
        };
        if exit.terminated_by_timeout {
            return Outcome::TimedOut {
                exit_code: Some(exit.exit_code),
            };
        }
        match exit.exit_code {
            0 => self.run_gates(id, request, config).await,
            SIGINT_EXIT => Outcome::Cancelled,
            code => Outcome::Failed {
                exit_code: Some(code),
                diagnostic: None,
            },
        }
    }

    async fn run_gates(
        &self,
        id: ExecutionId,
        request: &ExecutionRequest,
        config: &ExecutionConfig,
    ) -> Outcome {
        if let Err(e) = self
            .store
            .transition(id, ExecutionState::AwaitingQualityGate, |_| {})
        {
            return Outcome::Failed {
                exit_code: Some(0),
                diagnostic: Some(format!("internal error: {}\n", e)),
            };
        }
        tracing::info!(execution = %id, gates = config.gates.len(), "agent exited cleanly, evaluating quality gates");

        let evaluator = QualityGateEvaluator::new(self.runner.clone(), self.tracker.clone())
            .with_grace_period(config.grace_period)
            .with_short_circuit(config.short_circuit_gates)
            .with_followup_priority(config.followup_priority);
        let ctx = GateContext {
            project_id: request.project_id.clone(),
            bead_id: request.bead_id.clone(),
            project_path: request.project_path.clone(),
            env: config.env.clone(),
        };
        let report = evaluator.evaluate(&ctx, &config.gates).await;
        for outcome in &report.outcomes {
            self.store.append_output(id, &outcome_log(outcome));
        }
        Outcome::Gated {
            exit_code: 0,
            report,
        }
    }

    async fn settle(
        &self,
        id: ExecutionId,
        request: &ExecutionRequest,
        config: &ExecutionConfig,
        outcome: Outcome,
        lock: ProjectLockGuard,
    ) {
        let lock = Some(lock);
        match outcome {
            Outcome::Gated { exit_code, report } => {
                let state = if report.passed() {
                    ExecutionState::Completed
                } else {
                    ExecutionState::Failed
                };
                let results = report.results();
                self.record_finish(id, state, lock, move |execution| {
                    execution.exit_code = Some(exit_code);
                    execution.quality_gate_result = Some(results);
                });
            }
            Outcome::Failed {
                exit_code,
                diagnostic,
            } => {
                self.record_finish(id, ExecutionState::Failed, lock, move |execution| {
                    execution.exit_code = exit_code;
                    if let Some(diagnostic) = diagnostic {
                        push_output(execution, diagnostic);
                    }
                });
            }
            Outcome::Blocked { reason, exit_code } => {
                self.record_finish(id, ExecutionState::Blocked, lock, move |execution| {
                    execution.exit_code = exit_code;
                    execution.blocked_reason = Some(reason);
                });
            }
            Outcome::Cancelled => {
                self.record_finish(id, ExecutionState::Cancelled, lock, |execution| {
                    execution.exit_code = None;
                });
            }
            Outcome::TimedOut { exit_code } => {
                let snapshot =
                    self.record_finish(id, ExecutionState::TimedOut, lock, move |execution| {
                        execution.exit_code = exit_code;
                    });
                let tail = snapshot
                    .map(|s| tail_lines(&s.output_text(), FOLLOWUP_TAIL_LINES))
                    .unwrap_or_default();
                let followup = FollowUp {
                    project_id: request.project_id.clone(),
                    project_path: request.project_path.clone(),
                    title: format!("Execution for {} timed out", request.bead_id),
                    description: format!(
                        "Work on {} exceeded the {}s limit and was stopped (execution {}).\n\nOutput tail:\n{}",
                        request.bead_id,
                        config.absolute_timeout.as_secs(),
                        id,
                        tail
                    ),
                    priority: config.followup_priority,
                };
                file_followup(self.tracker.as_ref(), followup).await;
            }
        }
    }
}

fn idle_check_period(threshold: Duration) -> Duration {
    (threshold / 4).clamp(Duration::from_millis(100), Duration::from_secs(30))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
