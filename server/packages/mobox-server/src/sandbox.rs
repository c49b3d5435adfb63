use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mobox_error::MoboxError;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

const STDERR_TAIL_BYTES: usize = 4096;
const PUMP_CHUNK_BYTES: usize = 8192;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("agent command is empty")]
    EmptyCommand,
    #[error("failed to prepare workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to capture agent {0}")]
    MissingPipe(&'static str),
}

impl SandboxError {
    pub fn into_mobox(self, agent: &str) -> MoboxError {
        MoboxError::SandboxFailed {
            agent: agent.to_string(),
            exit_code: None,
            stderr: Some(self.to_string()),
        }
    }
}

/// Everything needed to run one agent turn.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub session_id: String,
    pub agent_id: String,
    pub agent_dir: PathBuf,
    pub command: Vec<String>,
    pub prompt: String,
    /// JSON list of prior `{role, content}` messages, if the session has any.
    pub history: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exited,
    Terminated,
    TimedOut,
    IdleTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub stderr: String,
    pub reason: ExitReason,
}

impl ExitReport {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            stderr: String::new(),
            reason: ExitReason::Exited,
        }
    }

    /// Message used when the agent stops without reporting a terminal event.
    pub fn failure_message(&self) -> Option<String> {
        match self.reason {
            ExitReason::TimedOut => Some("Agent timed out".to_string()),
            ExitReason::IdleTimeout => Some("Agent stopped producing output".to_string()),
            ExitReason::Terminated => None,
            ExitReason::Exited => match self.code {
                Some(0) => None,
                Some(code) => Some(format!(
                    "Agent exited with code {code}: {}",
                    self.stderr.trim()
                )),
                None => Some(format!("Agent was killed: {}", self.stderr.trim())),
            },
        }
    }
}

/// Stop and exit handles for a running agent, split from its stdout so the
/// reader can be borrowed independently.
#[derive(Debug)]
pub struct ProcessControl {
    kill: mpsc::Sender<ExitReason>,
    exit: Option<oneshot::Receiver<ExitReport>>,
}

impl ProcessControl {
    pub fn new(kill: mpsc::Sender<ExitReason>, exit: oneshot::Receiver<ExitReport>) -> Self {
        Self {
            kill,
            exit: Some(exit),
        }
    }

    /// Asks the sandbox to stop the agent. No-op once it has exited.
    pub fn terminate(&self) {
        let _ = self.kill.try_send(ExitReason::Terminated);
    }

    /// Waits up to `timeout` for the exit report. Only the first call can
    /// observe it.
    pub async fn wait(&mut self, timeout: Duration) -> Option<ExitReport> {
        let exit = self.exit.take()?;
        match tokio::time::timeout(timeout, exit).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for agent exit"
                );
                None
            }
        }
    }
}

pub struct SandboxProcess {
    pub stdout: BoxedReader,
    pub control: ProcessControl,
}

impl std::fmt::Debug for SandboxProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxProcess")
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<SandboxProcess, SandboxError>;
}

/// Runs the agent command as a local child process.
#[derive(Debug, Clone, Default)]
pub struct SubprocessSandbox;

impl SubprocessSandbox {
    pub fn new() -> Self {
        Self
    }

    async fn prepare_workspace(request: &LaunchRequest) -> Result<PathBuf, SandboxError> {
        let workspace = workspace_dir(&request.agent_dir, &request.session_id);
        let wrap = |source| SandboxError::Workspace {
            path: workspace.clone(),
            source,
        };
        tokio::fs::create_dir_all(&workspace).await.map_err(wrap)?;
        tokio::fs::write(workspace.join("prompt.txt"), &request.prompt)
            .await
            .map_err(wrap)?;
        if let Some(history) = &request.history {
            tokio::fs::write(workspace.join("history.txt"), history)
                .await
                .map_err(wrap)?;
        }
        Ok(workspace)
    }
}

#[async_trait]
impl Sandbox for SubprocessSandbox {
    async fn launch(&self, request: LaunchRequest) -> Result<SandboxProcess, SandboxError> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or(SandboxError::EmptyCommand)?;
        let workspace = Self::prepare_workspace(&request).await?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&request.agent_dir)
            .env("AGENT_WORKSPACE", &workspace)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            session_id = %request.session_id,
            agent_id = %request.agent_id,
            program = %program,
            args = ?args,
            workspace = %workspace.display(),
            "spawning agent process"
        );
        let spawned_at = Instant::now();
        let mut child = command.spawn().map_err(|source| {
            tracing::error!(program = %program, error = %source, "failed to spawn agent process");
            SandboxError::Spawn {
                command: request.command.join(" "),
                source,
            }
        })?;
        tracing::info!(
            pid = child.id().unwrap_or(0),
            elapsed_ms = spawned_at.elapsed().as_millis() as u64,
            "agent process spawned"
        );

        let stdout = child.stdout.take().ok_or(SandboxError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SandboxError::MissingPipe("stderr"))?;

        let (kill_tx, mut kill_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (reader, writer) = tokio::io::duplex(PUMP_CHUNK_BYTES * 4);

        spawn_stdout_pump(stdout, writer, request.idle_timeout, kill_tx.clone());
        let stderr_task = tokio::spawn(drain_stderr(stderr));

        let total_timeout = request.timeout;
        tokio::spawn(async move {
            let (status, reason) = tokio::select! {
                status = child.wait() => (status.ok(), ExitReason::Exited),
                Some(reason) = kill_rx.recv() => {
                    let _ = child.kill().await;
                    (child.wait().await.ok(), reason)
                }
                _ = tokio::time::sleep(total_timeout) => {
                    tracing::warn!(timeout_secs = total_timeout.as_secs(), "agent exceeded timeout");
                    let _ = child.kill().await;
                    (child.wait().await.ok(), ExitReason::TimedOut)
                }
            };
            let stderr = stderr_task.await.unwrap_or_default();
            let code = status.and_then(|status| status.code());
            tracing::info!(
                code = ?code,
                reason = ?reason,
                age_ms = spawned_at.elapsed().as_millis() as u64,
                "agent process exited"
            );
            let _ = exit_tx.send(ExitReport {
                code,
                stderr,
                reason,
            });
        });

        Ok(SandboxProcess {
            stdout: Box::pin(reader),
            control: ProcessControl::new(kill_tx, exit_rx),
        })
    }
}

fn spawn_stdout_pump(
    mut stdout: ChildStdout,
    mut writer: tokio::io::DuplexStream,
    idle_timeout: Duration,
    kill: mpsc::Sender<ExitReason>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_CHUNK_BYTES];
        loop {
            let read = match tokio::time::timeout(idle_timeout, stdout.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(read)) => read,
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "agent stdout read failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        idle_secs = idle_timeout.as_secs(),
                        "agent idle timeout, terminating"
                    );
                    let _ = kill.try_send(ExitReason::IdleTimeout);
                    break;
                }
            };
            if writer.write_all(&buf[..read]).await.is_err() {
                // Reader side is gone; keep draining so the child never blocks.
                tracing::debug!("agent stdout consumer dropped");
                while let Ok(n) = stdout.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
}

async fn drain_stderr<R>(stderr: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut line_count: u64 = 0;
    let mut tail = String::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(error = %err, "agent stderr: read failed");
                break;
            }
        }
        line_count += 1;
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        tracing::debug!(line_number = line_count, "agent stderr: {}", line);
        tail.push_str(line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_BYTES * 2 {
            let mut cut = tail.len() - STDERR_TAIL_BYTES;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }
    tracing::debug!(total_lines = line_count, "agent stderr: stream ended");
    tail
}

/// Replays a fixed byte script as agent stdout. Used by tests and the
/// `replay` command.
#[derive(Debug, Clone)]
pub struct ScriptedSandbox {
    script: Vec<u8>,
    exit: ExitReport,
    launches: Arc<Mutex<Vec<LaunchRequest>>>,
}

impl ScriptedSandbox {
    pub fn new(script: impl Into<Vec<u8>>) -> Self {
        Self {
            script: script.into(),
            exit: ExitReport::success(),
            launches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut script = String::new();
        for line in lines {
            script.push_str(line.as_ref());
            script.push('\n');
        }
        Self::new(script)
    }

    pub fn with_exit(mut self, code: i32, stderr: impl Into<String>) -> Self {
        self.exit = ExitReport {
            code: Some(code),
            stderr: stderr.into(),
            reason: ExitReason::Exited,
        };
        self
    }

    /// Requests seen so far, oldest first.
    pub fn launches(&self) -> Vec<LaunchRequest> {
        match self.launches.lock() {
            Ok(launches) => launches.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn launch(&self, request: LaunchRequest) -> Result<SandboxProcess, SandboxError> {
        if request.command.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }
        match self.launches.lock() {
            Ok(mut launches) => launches.push(request),
            Err(poisoned) => poisoned.into_inner().push(request),
        }
        let (kill_tx, _kill_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = oneshot::channel();
        let _ = exit_tx.send(self.exit.clone());
        Ok(SandboxProcess {
            stdout: Box::pin(std::io::Cursor::new(self.script.clone())),
            control: ProcessControl::new(kill_tx, exit_rx),
        })
    }
}

/// Workspace directory a launch for `session_id` writes into.
pub fn workspace_dir(agent_dir: &Path, session_id: &str) -> PathBuf {
    agent_dir.join("workspace").join(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_includes_stderr() {
        let report = ExitReport {
            code: Some(2),
            stderr: "boom\n".to_string(),
            reason: ExitReason::Exited,
        };
        assert_eq!(
            report.failure_message().as_deref(),
            Some("Agent exited with code 2: boom")
        );
        assert_eq!(ExitReport::success().failure_message(), None);
    }

    #[tokio::test]
    async fn scripted_sandbox_replays_bytes_and_exit() {
        let sandbox = ScriptedSandbox::from_lines([r#"{"type":"done"}"#]).with_exit(1, "bad");
        let mut process = sandbox
            .launch(LaunchRequest {
                session_id: "s".to_string(),
                agent_id: "a".to_string(),
                agent_dir: PathBuf::from("."),
                command: vec!["run".to_string()],
                prompt: "hi".to_string(),
                history: None,
                env: HashMap::new(),
                timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(5),
            })
            .await
            .expect("launch");
        let mut out = String::new();
        process
            .stdout
            .read_to_string(&mut out)
            .await
            .expect("read");
        assert_eq!(out, "{\"type\":\"done\"}\n");
        let report = process
            .control
            .wait(Duration::from_secs(1))
            .await
            .expect("report");
        assert_eq!(report.code, Some(1));
        assert_eq!(sandbox.launches().len(), 1);
    }

    #[tokio::test]
    async fn stderr_drain_survives_invalid_utf8() {
        let stderr: &[u8] = b"\xff\xfe broken\nlater one\nlater two\n";
        let tail = drain_stderr(stderr).await;
        assert_eq!(tail, "\u{fffd}\u{fffd} broken\nlater one\nlater two\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn agent_keeps_running_after_invalid_stderr() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("printf '\\377\\n' >&2; sleep 0.2; echo later1 >&2; echo later2 >&2")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn sh");
        let stderr = child.stderr.take().expect("stderr");
        let drain = tokio::spawn(drain_stderr(stderr));

        let status = child.wait().await.expect("wait");
        assert_eq!(status.code(), Some(0));
        let tail = drain.await.expect("drain task");
        assert!(tail.contains("later1\nlater2\n"), "tail was {tail:?}");
    }
}
