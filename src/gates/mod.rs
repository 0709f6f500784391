//! Quality gates run after the agent exits cleanly.
//!
//! Gates run one at a time through the same runner as the agent, ordered
//! `tests`, `lint`, `build`, then any others in declared order. An
//! execution passes when every required gate passes; optional gates are
//! reported but never fail it. Each required failure files a follow-up.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::runner::{CommandSpec, Runner, drain_output};
use crate::tracker::{FollowUp, IssueTracker, file_followup};
use crate::util::tail_lines;

/// Lines of gate output kept in a failure description.
const FAILURE_TAIL_LINES: usize = 40;

fn default_gate_timeout_secs() -> u64 {
    600
}

/// A named check with a command, a required flag, and its own timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGate {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_gate_timeout_secs")]
    pub timeout_secs: u64,
}

impl QualityGate {
    pub fn new(name: &str, command: &[&str], required: bool) -> Self {
        Self {
            name: name.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            required,
            timeout_secs: default_gate_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("quality gate name must not be empty");
        }
        if self.command.is_empty() {
            bail!("quality gate '{}' has an empty command", self.name);
        }
        if self.timeout_secs == 0 {
            bail!("quality gate '{}' needs a positive timeout", self.name);
        }
        Ok(())
    }

    fn rank(&self) -> u8 {
        match self.name.as_str() {
            "tests" => 0,
            "lint" => 1,
            "build" => 2,
            _ => 3,
        }
    }
}

/// Gates in evaluation order. Stable, so unknown names keep declared order.
pub fn evaluation_order(gates: &[QualityGate]) -> Vec<&QualityGate> {
    let mut ordered: Vec<&QualityGate> = gates.iter().collect();
    ordered.sort_by_key(|g| g.rank());
    ordered
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub name: String,
    pub required: bool,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateReport {
    pub outcomes: Vec<GateOutcome>,
    /// Gates not run because an earlier required gate failed.
    pub skipped: Vec<String>,
}

impl GateReport {
    /// True when no required gate failed.
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed || !o.required)
    }

    /// Per-gate pass/fail for every gate that ran.
    pub fn results(&self) -> BTreeMap<String, bool> {
        self.outcomes
            .iter()
            .map(|o| (o.name.clone(), o.passed))
            .collect()
    }

    pub fn required_failures(&self) -> impl Iterator<Item = &GateOutcome> {
        self.outcomes.iter().filter(|o| o.required && !o.passed)
    }
}

/// Where the gates run.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub project_id: String,
    pub bead_id: String,
    pub project_path: PathBuf,
    pub env: BTreeMap<String, String>,
}

pub struct QualityGateEvaluator {
    runner: Arc<dyn Runner>,
    tracker: Arc<dyn IssueTracker>,
    grace_period: Duration,
    short_circuit: bool,
    followup_priority: u8,
}

impl QualityGateEvaluator {
    pub fn new(runner: Arc<dyn Runner>, tracker: Arc<dyn IssueTracker>) -> Self {
        Self {
            runner,
            tracker,
            grace_period: Duration::from_secs(10),
            short_circuit: false,
            followup_priority: 1,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_short_circuit(mut self, short_circuit: bool) -> Self {
        self.short_circuit = short_circuit;
        self
    }

    pub fn with_followup_priority(mut self, priority: u8) -> Self {
        self.followup_priority = priority;
        self
    }

    /// Run `gates` in order and reduce them to one report. Files a follow-up
    /// for each required gate that fails.
    pub async fn evaluate(&self, ctx: &GateContext, gates: &[QualityGate]) -> GateReport {
        let mut report = GateReport::default();
        let ordered = evaluation_order(gates);
        let mut remaining = ordered.iter();

        for gate in remaining.by_ref() {
            let outcome = self.run_gate(ctx, gate).await;
            tracing::info!(
                project = %ctx.project_id,
                bead = %ctx.bead_id,
                gate = %gate.name,
                required = gate.required,
                passed = outcome.passed,
                exit_code = ?outcome.exit_code,
                timed_out = outcome.timed_out,
                "quality gate finished"
            );
            let stop = self.short_circuit && outcome.required && !outcome.passed;
            report.outcomes.push(outcome);
            if stop {
                break;
            }
        }
        report.skipped = remaining.map(|g| g.name.clone()).collect();

        for failure in report.required_failures() {
            file_followup(self.tracker.as_ref(), self.followup_for(ctx, failure)).await;
        }
        report
    }

    async fn run_gate(&self, ctx: &GateContext, gate: &QualityGate) -> GateOutcome {
        let mut outcome = GateOutcome {
            name: gate.name.clone(),
            required: gate.required,
            passed: false,
            exit_code: None,
            timed_out: false,
            output: String::new(),
        };

        let spec = CommandSpec {
            argv: gate.command.clone(),
            workdir: ctx.project_path.clone(),
            env: ctx.env.clone(),
            timeout: gate.timeout() + self.grace_period,
            project_id: ctx.project_id.clone(),
        };
        let mut handle = match self.runner.spawn(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                outcome.output = format!("failed to start gate: {}\n", e);
                return outcome;
            }
        };

        let mut output = String::new();
        let grace_period = self.grace_period;
        let collect = async {
            let mut output_open = true;
            loop {
                tokio::select! {
                    biased;
                    chunk = handle.output.recv(), if output_open => match chunk {
                        Some(chunk) => output.push_str(&chunk),
                        None => output_open = false,
                    },
                    exit = &mut handle.exit => {
                        if output_open {
                            for chunk in drain_output(&mut handle.output, grace_period).await {
                                output.push_str(&chunk);
                            }
                        }
                        break exit;
                    }
                }
            }
        };
        let exit = tokio::time::timeout(gate.timeout(), collect).await;

        match exit {
            Ok(Ok(exit)) => {
                outcome.exit_code = Some(exit.exit_code);
                outcome.timed_out = exit.terminated_by_timeout;
                outcome.passed = exit.exit_code == 0 && !exit.terminated_by_timeout;
            }
            Ok(Err(_)) => {
                output.push_str("gate runner exited without a status\n");
            }
            Err(_) => {
                outcome.timed_out = true;
                output.push_str(&format!(
                    "gate timed out after {}s\n",
                    gate.timeout_secs
                ));
                if let Err(e) = self.runner.terminate(&handle.id).await {
                    tracing::warn!(gate = %gate.name, error = %e, "failed to terminate gate");
                }
                match tokio::time::timeout(self.grace_period, &mut handle.exit).await {
                    Ok(Ok(exit)) => outcome.exit_code = Some(exit.exit_code),
                    _ => {
                        if self.runner.is_alive(&handle.id).await {
                            tracing::error!(gate = %gate.name, handle = %handle.id, "gate still running after grace period; presumed leaked");
                        }
                    }
                }
            }
        }
        outcome.output = output;
        outcome
    }

    fn followup_for(&self, ctx: &GateContext, failure: &GateOutcome) -> FollowUp {
        let reason = if failure.timed_out {
            "timed out".to_string()
        } else {
            match failure.exit_code {
                Some(code) => format!("exited with {}", code),
                None => "did not run".to_string(),
            }
        };
        FollowUp {
            project_id: ctx.project_id.clone(),
            project_path: ctx.project_path.clone(),
            title: format!("Quality gate '{}' failed for {}", failure.name, ctx.bead_id),
            description: format!(
                "The required '{}' gate {} after work on {}.\n\nOutput tail:\n{}",
                failure.name,
                reason,
                ctx.bead_id,
                tail_lines(&failure.output, FAILURE_TAIL_LINES)
            ),
            priority: self.followup_priority,
        }
    }
}

/// Render one gate's outcome for the execution log.
pub fn outcome_log(outcome: &GateOutcome) -> String {
    let verdict = if outcome.passed { "passed" } else { "failed" };
    let kind = if outcome.required { "required" } else { "optional" };
    let mut text = format!("==> quality gate {} ({}): {}\n", outcome.name, kind, verdict);
    text.push_str(&outcome.output);
    if !outcome.output.is_empty() && !outcome.output.ends_with('\n') {
        text.push('\n');
    }
    text
}
