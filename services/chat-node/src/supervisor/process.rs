//! Launcher that runs each room in its own `chat-room` process.
//!
//! The control channel is the child's stdio: node messages are written to
//! its stdin, worker messages are read from its stdout, one JSON frame per
//! line. The child's stderr is inherited so worker logs land next to ours.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chatfleet_control::{decode_line, encode_line, NodeMessage, WorkerMessage};
use chatfleet_id::WorkerId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{ExitCause, LaunchedWorker, SpawnError, WorkerLauncher, WorkerSignal, WorkerSpec};

/// Environment variable carrying the room name.
pub const ROOM_NAME_ENV: &str = "CHATFLEET_ROOM_NAME";
/// Environment variable carrying the requested port.
pub const ROOM_PORT_ENV: &str = "CHATFLEET_ROOM_PORT";
/// Environment variable carrying the worker id, for log correlation.
pub const WORKER_ID_ENV: &str = "CHATFLEET_WORKER_ID";

/// How long to wait for an exit status after the control channel closes
/// before reporting a bare disconnect.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Launches room workers as child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    env: Vec<(String, String)>,
}

impl ProcessLauncher {
    /// Launcher running the worker binary at `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            env: Vec::new(),
        }
    }

    /// Pass an extra environment variable to every worker.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchedWorker, SpawnError> {
        let mut cmd = Command::new(&self.program);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ROOM_NAME_ENV, &spec.room_name)
            .env(ROOM_PORT_ENV, spec.requested_port.to_string())
            .env(WORKER_ID_ENV, spec.worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SpawnError::Launch(format!("{}: {e}", self.program.display())))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Launch("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Launch("worker stdout not captured".to_string()))?;

        let (control_tx, control_rx) = mpsc::channel(8);
        let (signal_tx, signal_rx) = mpsc::channel(16);

        tokio::spawn(write_control(spec.worker_id, stdin, control_rx));
        tokio::spawn(watch_process(spec.worker_id, child, stdout, signal_tx));

        Ok(LaunchedWorker {
            pid,
            control: control_tx,
            signals: signal_rx,
        })
    }
}

/// Write control messages to the worker's stdin.
///
/// Dropping the last control sender closes stdin, which the worker treats
/// as its node going away.
async fn write_control(
    worker_id: WorkerId,
    mut stdin: ChildStdin,
    mut control: mpsc::Receiver<NodeMessage>,
) {
    while let Some(message) = control.recv().await {
        let line = match encode_line(message) {
            Ok(line) => line,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Failed to encode control message");
                continue;
            }
        };

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            warn!(worker_id = %worker_id, error = %e, "Worker control channel closed");
            break;
        }
    }
}

/// Read worker frames until stdout closes, then wait for the exit status.
async fn watch_process(
    worker_id: WorkerId,
    mut child: Child,
    stdout: ChildStdout,
    signals: mpsc::Sender<WorkerSignal>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_line::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Port { port }) => {
                    let _ = signals.send(WorkerSignal::Port(port)).await;
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Ignoring malformed worker frame");
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Failed to read worker stdout");
                break;
            }
        }
    }
    debug!(worker_id = %worker_id, "Worker stdout closed");

    let status = match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            let _ = signals.send(WorkerSignal::Disconnected).await;
            child.wait().await
        }
    };

    let cause = match status {
        Ok(status) => classify_exit(status),
        Err(e) => {
            error!(worker_id = %worker_id, error = %e, "Failed to wait for worker");
            ExitCause::Disconnected
        }
    };
    let _ = signals.send(WorkerSignal::Exited(cause)).await;
}

/// Classify an exit status.
pub fn classify_exit(status: ExitStatus) -> ExitCause {
    if let Some(code) = status.code() {
        return if code == 0 {
            ExitCause::Clean
        } else {
            ExitCause::Crashed { code }
        };
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitCause::Signaled { signal };
        }
    }

    ExitCause::Crashed { code: -1 }
}
