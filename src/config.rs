//! Service configuration.
//!
//! Settings come from a TOML file (default `beadwork.toml` in the working
//! directory, or `BEADWORK_CONFIG`), then environment overrides. Every field
//! has a default, so an empty or missing file is a valid configuration.
//!
//! ```toml
//! workspace_path = "/home/me/projects"
//!
//! [orchestrator]
//! absolute_timeout_secs = 21600
//! idle_threshold_secs = 300
//! grace_period_secs = 10
//! block_marker = "BLOCKED:"
//!
//! [agent]
//! command = ["claude", "--print", "Work on bead {bead_id}"]
//! review_command = ["claude", "--print", "/review-implementation"]
//!
//! [runner]
//! kind = "docker"
//!
//! [[gates]]
//! name = "tests"
//! command = ["cargo", "test"]
//! required = true
//! ```
//!
//! A project may override the gate list with `<project>/.beadwork/gates.toml`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::execution::DEFAULT_MAX_RETAINED;
use crate::gates::QualityGate;
use crate::signals::DEFAULT_BLOCK_MARKER;

pub const DEFAULT_CONFIG_FILE: &str = "beadwork.toml";
pub const PROJECT_CONFIG_DIR: &str = ".beadwork";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory whose children are projects, addressed by directory name.
    #[serde(default = "default_workspace_path")]
    pub workspace_path: PathBuf,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub gates: Vec<QualityGate>,
}

fn default_workspace_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("projects")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workspace_path: default_workspace_path(),
            orchestrator: OrchestratorSettings::default(),
            agent: AgentSettings::default(),
            runner: RunnerSettings::default(),
            sandbox: SandboxSettings::default(),
            tracker: TrackerSettings::default(),
            server: ServerSettings::default(),
            gates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub absolute_timeout_secs: u64,
    pub idle_threshold_secs: u64,
    pub grace_period_secs: u64,
    pub block_marker: String,
    /// Terminal records kept in memory before the oldest are evicted.
    pub max_retained: usize,
    pub followup_priority: u8,
    /// Stop evaluating gates after the first required failure.
    pub short_circuit_gates: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            absolute_timeout_secs: 6 * 60 * 60,
            idle_threshold_secs: 5 * 60,
            grace_period_secs: 10,
            block_marker: DEFAULT_BLOCK_MARKER.to_string(),
            max_retained: DEFAULT_MAX_RETAINED,
            followup_priority: 1,
            short_circuit_gates: false,
        }
    }
}

impl OrchestratorSettings {
    pub fn absolute_timeout(&self) -> Duration {
        Duration::from_secs(self.absolute_timeout_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// The agent command lines. `{project_id}` and `{bead_id}` are substituted
/// in every argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub command: Vec<String>,
    /// Run by the review action against the project's current branch.
    pub review_command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "You are implementing bead {bead_id} in project {project_id}. \
                 Review the task with `bd show {bead_id}`, implement it, and test it. \
                 If you cannot proceed, print a line starting with BLOCKED: followed by the reason."
                    .to_string(),
            ],
            review_command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "/review-implementation".to_string(),
            ],
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Process,
    Docker,
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

impl FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "docker" => Ok(Self::Docker),
            _ => Err(format!("Invalid runner kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunnerSettings {
    pub kind: RunnerKind,
}

/// Container limits for the docker runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub image: String,
    pub memory: String,
    pub cpus: f64,
    pub docker_socket: PathBuf,
    /// Extra host:container bind mounts, read-only.
    pub volumes: BTreeMap<String, String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "claude-dev-base:latest".to_string(),
            memory: "4g".to_string(),
            cpus: 2.0,
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            volumes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    #[default]
    Beads,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub kind: TrackerKind,
    /// The beads CLI binary.
    pub bd_cmd: String,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            kind: TrackerKind::Beads,
            bd_cmd: "bd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Requests per minute accepted by the work and review endpoints;
    /// 0 disables the limit.
    pub work_rate_limit_per_minute: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            work_rate_limit_per_minute: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProjectGatesToml {
    #[serde(default)]
    gates: Vec<QualityGate>,
}

impl Settings {
    /// Load from `path`, or from `BEADWORK_CONFIG`, or from `beadwork.toml`
    /// in the current directory. A missing default file yields defaults; a
    /// missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("BEADWORK_CONFIG").map(PathBuf::from));

        let mut settings = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                let path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML")
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(workspace) = std::env::var("BEADWORK_WORKSPACE") {
            self.workspace_path = PathBuf::from(workspace);
        }
        if let Ok(claude) = std::env::var("CLAUDE_CMD") {
            for command in [&mut self.agent.command, &mut self.agent.review_command] {
                if let Some(program) = command.first_mut() {
                    *program = claude.clone();
                }
            }
        }
        if let Ok(kind) = std::env::var("BEADWORK_RUNNER") {
            self.runner.kind = kind.parse().map_err(anyhow::Error::msg)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.command.is_empty() {
            anyhow::bail!("agent.command must not be empty");
        }
        if self.agent.review_command.is_empty() {
            anyhow::bail!("agent.review_command must not be empty");
        }
        if self.orchestrator.absolute_timeout_secs == 0 {
            anyhow::bail!("orchestrator.absolute_timeout_secs must be positive");
        }
        if self.orchestrator.block_marker.is_empty() {
            anyhow::bail!("orchestrator.block_marker must not be empty");
        }
        for gate in &self.gates {
            gate.validate()?;
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize settings")
    }

    /// Gates for one project: `<project>/.beadwork/gates.toml` when present,
    /// the global list otherwise.
    pub fn gates_for_project(&self, project_path: &Path) -> Result<Vec<QualityGate>> {
        let path = project_path.join(PROJECT_CONFIG_DIR).join("gates.toml");
        if !path.exists() {
            return Ok(self.gates.clone());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let parsed: ProjectGatesToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        for gate in &parsed.gates {
            gate.validate()?;
        }
        Ok(parsed.gates)
    }

    /// Resolve a project id to a directory under the workspace. Ids that
    /// would escape the workspace are rejected.
    pub fn project_path(&self, project_id: &str) -> Option<PathBuf> {
        if project_id.is_empty()
            || project_id == "."
            || project_id.contains('/')
            || project_id.contains('\\')
            || project_id.contains("..")
        {
            return None;
        }
        Some(self.workspace_path.join(project_id))
    }
}
