//! Push a project's current branch and open a pull request.
//!
//! Publishing takes the same project lock as an execution, so a push never
//! races an agent that is still writing to the working tree.

use std::path::Path;
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;

use crate::errors::PublishError;
use crate::execution::{ExecutionId, ProjectLocks};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PublishResult {
    pub branch: String,
    pub push_output: String,
    pub pr_output: String,
    pub pr_url: Option<String>,
}

#[derive(Clone)]
pub struct Publisher {
    locks: ProjectLocks,
    git: String,
    gh: String,
}

impl Publisher {
    pub fn new(locks: ProjectLocks) -> Self {
        Self::with_programs(locks, "git", "gh")
    }

    pub fn with_programs(locks: ProjectLocks, git: impl Into<String>, gh: impl Into<String>) -> Self {
        Self {
            locks,
            git: git.into(),
            gh: gh.into(),
        }
    }

    /// Push the checked-out branch to `origin` and open a PR for it.
    ///
    /// Rejected with `AlreadyRunning` while an execution holds the project.
    /// Without a title, `gh` fills title and body from the commits.
    pub async fn push_and_open_pr(
        &self,
        project_path: &Path,
        title: Option<&str>,
    ) -> Result<PublishResult, PublishError> {
        // released when dropped
        let _lock = self.locks.try_acquire(project_path, ExecutionId::new())?;

        let branch = self
            .run(&self.git, &["rev-parse", "--abbrev-ref", "HEAD"], project_path)
            .await?
            .trim()
            .to_string();
        tracing::info!(project = %project_path.display(), branch = %branch, "pushing branch");

        let push_output = self
            .run(&self.git, &["push", "-u", "origin", &branch], project_path)
            .await?;

        let mut pr_args = vec!["pr", "create"];
        if let Some(title) = title {
            pr_args.extend(["--title", title]);
        }
        pr_args.push("--fill");
        let pr_output = self.run(&self.gh, &pr_args, project_path).await?;
        let pr_url = pr_url(&pr_output);
        tracing::info!(project = %project_path.display(), branch = %branch, url = ?pr_url, "pull request opened");

        Ok(PublishResult {
            branch,
            push_output,
            pr_output,
            pr_url,
        })
    }

    /// Run a command and return its combined stdout and stderr.
    async fn run(&self, program: &str, args: &[&str], cwd: &Path) -> Result<String, PublishError> {
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| PublishError::Io {
                program: program.to_string(),
                source,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(PublishError::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                output: text.trim().to_string(),
            });
        }
        Ok(text)
    }
}

/// The last `https://` token in `gh` output is the new PR.
fn pr_url(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .rev()
        .find(|token| token.starts_with("https://"))
        .map(str::to_string)
}
