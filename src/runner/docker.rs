use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use super::{CommandSpec, OUTPUT_CHANNEL_CAPACITY, RunExit, RunHandle, Runner};
use crate::config::SandboxSettings;
use crate::errors::RunnerError;

/// Project directory inside the container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Runs each command in a fresh container, labelled `beadwork=true` and
/// `project=<id>`, removed once the command exits.
#[derive(Clone)]
pub struct DockerRunner {
    docker: Docker,
    sandbox: SandboxSettings,
    /// Seconds docker waits after SIGTERM before SIGKILL.
    stop_timeout_secs: i64,
    /// Container id -> terminate request sender.
    running: Arc<Mutex<HashMap<String, Option<oneshot::Sender<()>>>>>,
}

enum Finish {
    Exited(i32),
    Terminate,
    Timeout,
}

impl DockerRunner {
    /// `grace_period` is how long callers wait for a terminated container;
    /// docker gets half of it before escalating to SIGKILL.
    pub fn connect(sandbox: &SandboxSettings, grace_period: Duration) -> Result<Self> {
        let socket = sandbox.docker_socket.to_string_lossy();
        let docker = Docker::connect_with_socket(&socket, 120, API_DEFAULT_VERSION)
            .with_context(|| format!("Failed to connect to docker at {}", socket))?;
        Ok(Self {
            docker,
            sandbox: sandbox.clone(),
            stop_timeout_secs: stop_timeout_secs(grace_period),
            running: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl Runner for DockerRunner {
    async fn spawn(&self, spec: CommandSpec) -> Result<RunHandle, RunnerError> {
        if spec.argv.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        let name = container_name(&spec.project_id);
        let config = container_config(&self.sandbox, &spec);

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| RunnerError::Docker(format!("create {}: {}", name, e)))?;
        let id = created.id;

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            remove_container(&self.docker, &id).await;
            return Err(RunnerError::Docker(format!("start {}: {}", name, e)));
        }
        tracing::info!(container = %name, id = %id, image = %self.sandbox.image, "started container");

        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.running.lock().await.insert(id.clone(), Some(kill_tx));

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        {
            let docker = self.docker.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let mut logs = Box::pin(docker.logs(
                    &id,
                    Some(LogsOptions::<String> {
                        follow: true,
                        stdout: true,
                        stderr: true,
                        ..Default::default()
                    }),
                ));
                while let Some(item) = logs.next().await {
                    match item {
                        Ok(chunk) => {
                            if output_tx.send(chunk.to_string()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(id = %id, error = %e, "container log stream ended");
                            break;
                        }
                    }
                }
            });
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let docker = self.docker.clone();
        let running = Arc::clone(&self.running);
        let container_id = id.clone();
        let timeout = spec.timeout;
        let stop_timeout = self.stop_timeout_secs;
        tokio::spawn(async move {
            let finish = tokio::select! {
                code = wait_exit(&docker, &container_id) => Finish::Exited(code),
                Ok(()) = &mut kill_rx => Finish::Terminate,
                _ = tokio::time::sleep(timeout) => Finish::Timeout,
            };
            let terminated_by_timeout = matches!(finish, Finish::Timeout);
            let exit_code = match finish {
                Finish::Exited(code) => code,
                Finish::Terminate | Finish::Timeout => {
                    if terminated_by_timeout {
                        tracing::warn!(id = %container_id, "container exceeded its timeout, stopping");
                    }
                    if let Err(e) = docker
                        .stop_container(
                            &container_id,
                            Some(StopContainerOptions { t: stop_timeout }),
                        )
                        .await
                    {
                        tracing::warn!(id = %container_id, error = %e, "failed to stop container");
                    }
                    wait_exit(&docker, &container_id).await
                }
            };
            remove_container(&docker, &container_id).await;
            running.lock().await.remove(&container_id);
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
        let mut running = self.running.lock().await;
        if let Some(kill) = running.get_mut(handle_id).and_then(Option::take) {
            let _ = kill.send(());
        }
        Ok(())
    }

    fn attach_command(&self, handle_id: &str) -> Option<String> {
        Some(attach_command(handle_id))
    }

    async fn is_alive(&self, handle_id: &str) -> bool {
        match self
            .docker
            .inspect_container(handle_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info.state.and_then(|s| s.running).unwrap_or(false),
            Err(_) => false,
        }
    }
}

async fn wait_exit(docker: &Docker, id: &str) -> i32 {
    let mut wait = Box::pin(docker.wait_container(id, None::<WaitContainerOptions<String>>));
    match wait.next().await {
        Some(Ok(response)) => response.status_code as i32,
        // bollard reports non-zero exits as an error carrying the code
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code as i32,
        Some(Err(e)) => {
            tracing::error!(id = %id, error = %e, "failed to wait for container");
            -1
        }
        None => -1,
    }
}

async fn remove_container(docker: &Docker, id: &str) {
    if let Err(e) = docker
        .remove_container(
            id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
    {
        tracing::warn!(id = %id, error = %e, "failed to remove container");
    }
}

fn stop_timeout_secs(grace_period: Duration) -> i64 {
    i64::try_from(grace_period.as_secs() / 2).unwrap_or(i64::MAX)
}

/// Shell into a live container, addressed by its short id.
fn attach_command(container_id: &str) -> String {
    let short = container_id.get(..12).unwrap_or(container_id);
    format!("docker exec -it {} bash", short)
}

fn container_name(project_id: &str) -> String {
    let safe: String = project_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("beadwork-{}-{}", safe, &suffix[..8])
}

fn container_config(sandbox: &SandboxSettings, spec: &CommandSpec) -> Config<String> {
    let mut binds = vec![format!(
        "{}:{}:rw",
        spec.workdir.display(),
        CONTAINER_WORKDIR
    )];
    binds.extend(
        sandbox
            .volumes
            .iter()
            .map(|(host, container)| format!("{}:{}:ro", host, container)),
    );

    let labels = HashMap::from([
        ("beadwork".to_string(), "true".to_string()),
        ("project".to_string(), spec.project_id.clone()),
    ]);

    Config {
        image: Some(sandbox.image.clone()),
        cmd: Some(spec.argv.clone()),
        env: Some(
            spec.env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
        ),
        working_dir: Some(CONTAINER_WORKDIR.to_string()),
        labels: Some(labels),
        host_config: Some(HostConfig {
            binds: Some(binds),
            memory: parse_memory(&sandbox.memory),
            nano_cpus: Some((sandbox.cpus * 1e9) as i64),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Parse docker-style sizes: `512m`, `4g`, `1024k`, or plain bytes.
fn parse_memory(value: &str) -> Option<i64> {
    let value = value.trim().to_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value.as_str(), 1),
    };
    digits.parse::<i64>().ok()?.checked_mul(multiplier)
}
