use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use super::{CommandSpec, OUTPUT_CHANNEL_CAPACITY, RunExit, RunHandle, Runner};
use crate::errors::RunnerError;

struct ProcessEntry {
    /// Taken by the first `terminate`.
    kill: Option<oneshot::Sender<()>>,
}

/// Runs commands as local child processes. Stdout and stderr are forwarded
/// line by line onto one output channel.
#[derive(Clone, Default)]
pub struct ProcessRunner {
    running: Arc<Mutex<HashMap<String, ProcessEntry>>>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    Terminate,
    Timeout,
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn spawn(&self, spec: CommandSpec) -> Result<RunHandle, RunnerError> {
        let (program, args) = spec.argv.split_first().ok_or(RunnerError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&spec.workdir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::SpawnFailed {
                program: program.clone(),
                source,
            })?;

        let id = format!("process-{}", Uuid::new_v4());
        tracing::debug!(handle = %id, pid = ?child.id(), program = %program, "spawned process");

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, output_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, output_tx));
        }

        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.running
            .lock()
            .await
            .insert(id.clone(), ProcessEntry { kill: Some(kill_tx) });

        let (exit_tx, exit_rx) = oneshot::channel();
        let running = Arc::clone(&self.running);
        let handle_id = id.clone();
        let timeout = spec.timeout;
        tokio::spawn(async move {
            let stop = tokio::select! {
                status = child.wait() => Stop::Exited(status),
                Ok(()) = &mut kill_rx => Stop::Terminate,
                _ = tokio::time::sleep(timeout) => Stop::Timeout,
            };
            let terminated_by_timeout = matches!(stop, Stop::Timeout);
            let status = match stop {
                Stop::Exited(status) => status,
                Stop::Terminate | Stop::Timeout => {
                    if terminated_by_timeout {
                        tracing::warn!(handle = %handle_id, "process exceeded its timeout, killing");
                    }
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(handle = %handle_id, error = %e, "failed to kill process");
                    }
                    child.wait().await
                }
            };
            let exit_code = match status {
                Ok(status) => exit_code(&status),
                Err(e) => {
                    tracing::error!(handle = %handle_id, error = %e, "failed to wait for process");
                    -1
                }
            };
            running.lock().await.remove(&handle_id);
            tracing::debug!(handle = %handle_id, exit_code, "process exited");
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
        if let Some(kill) = running.get_mut(handle_id).and_then(|entry| entry.kill.take()) {
            let _ = kill.send(());
        }
        Ok(())
    }

    async fn is_alive(&self, handle_id: &str) -> bool {
        self.running.lock().await.contains_key(handle_id)
    }
}

/// Forward raw lines (newline included) until EOF or the receiver goes away.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

/// Exit code, or 128 + signal number for signal deaths.
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
