//! Room worker supervision.
//!
//! The supervisor owns every worker's process handle and control channel.
//! Callers only ever hold a `WorkerId`. For each worker it:
//! - launches the process through a `WorkerLauncher`
//! - forwards the worker's port report
//! - reports termination exactly once, whether it surfaced as an exit or as
//!   a control-channel disconnect
//!
//! Workers are never restarted; a terminated room has to be created again.

mod mock;
mod process;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chatfleet_control::NodeMessage;
use chatfleet_id::WorkerId;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

pub use mock::MockLauncher;
pub use process::{classify_exit, ProcessLauncher, ROOM_NAME_ENV, ROOM_PORT_ENV, WORKER_ID_ENV};

/// Startup parameters handed to a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub worker_id: WorkerId,
    pub room_name: String,
    pub requested_port: u16,
}

/// How a worker went away. Used for logging only; cleanup is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// Exit code 0.
    Clean,
    /// Nonzero exit code.
    Crashed { code: i32 },
    /// Killed by a signal.
    Signaled { signal: i32 },
    /// Control channel closed before an exit status was observed.
    Disconnected,
}

impl ExitCause {
    /// Whether this counts as a crash for observability.
    pub fn is_failure(&self) -> bool {
        matches!(self, ExitCause::Crashed { .. } | ExitCause::Signaled { .. })
    }
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCause::Clean => write!(f, "clean exit"),
            ExitCause::Crashed { code } => write!(f, "exit code {code}"),
            ExitCause::Signaled { signal } => write!(f, "signal {signal}"),
            ExitCause::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Raw lifecycle signal produced by a launcher for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// The worker reported the port it bound.
    Port(u16),
    /// The control channel closed.
    Disconnected,
    /// The process exited.
    Exited(ExitCause),
}

/// Lifecycle event delivered to the supervisor's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker is listening on `port`.
    PortReported { worker_id: WorkerId, port: u16 },
    /// The worker is gone. Sent at most once per worker.
    Terminated { worker_id: WorkerId, cause: ExitCause },
}

/// A launched worker, as handed back by a launcher.
pub struct LaunchedWorker {
    /// OS process id, when there is one.
    pub pid: Option<u32>,
    /// Node-to-worker control messages.
    pub control: mpsc::Sender<NodeMessage>,
    /// Worker lifecycle signals. Closes once the worker is fully gone.
    pub signals: mpsc::Receiver<WorkerSignal>,
}

/// Errors launching a worker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("worker {0} already exists")]
    Duplicate(WorkerId),
}

/// Starts worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch a worker for `spec`.
    async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchedWorker, SpawnError>;
}

/// Supervisor-owned handle to one worker.
struct WorkerHandle {
    room_name: String,
    pid: Option<u32>,
    control: mpsc::Sender<NodeMessage>,
}

/// Owns worker handles and turns launcher signals into `WorkerEvent`s.
pub struct WorkerSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    workers: Arc<Mutex<HashMap<WorkerId, WorkerHandle>>>,
    events: mpsc::Sender<WorkerEvent>,
}

impl WorkerSupervisor {
    /// Create a supervisor that reports lifecycle events on `events`.
    pub fn new(launcher: Arc<dyn WorkerLauncher>, events: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            launcher,
            workers: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Launch a worker and start monitoring it.
    ///
    /// The handle is registered before monitoring begins, so a worker that
    /// dies immediately is still reported.
    pub async fn spawn(
        &self,
        worker_id: WorkerId,
        room_name: &str,
        requested_port: u16,
    ) -> Result<WorkerId, SpawnError> {
        if self.workers.lock().await.contains_key(&worker_id) {
            return Err(SpawnError::Duplicate(worker_id));
        }

        let spec = WorkerSpec {
            worker_id,
            room_name: room_name.to_string(),
            requested_port,
        };
        let launched = self.launcher.launch(&spec).await?;

        info!(
            worker_id = %worker_id,
            room = %room_name,
            requested_port,
            pid = ?launched.pid,
            "Worker launched"
        );

        self.workers.lock().await.insert(
            worker_id,
            WorkerHandle {
                room_name: spec.room_name,
                pid: launched.pid,
                control: launched.control,
            },
        );

        tokio::spawn(monitor_worker(
            worker_id,
            launched.signals,
            Arc::clone(&self.workers),
            self.events.clone(),
        ));

        Ok(worker_id)
    }

    /// Send a control message without waiting for the worker to act on it.
    ///
    /// Returns false when the worker is unknown or its channel is gone.
    pub async fn send(&self, worker_id: WorkerId, message: NodeMessage) -> bool {
        let workers = self.workers.lock().await;
        let Some(handle) = workers.get(&worker_id) else {
            debug!(worker_id = %worker_id, "Control message for unknown worker");
            return false;
        };

        match handle.control.try_send(message) {
            Ok(()) => {
                debug!(
                    worker_id = %worker_id,
                    room = %handle.room_name,
                    pid = ?handle.pid,
                    message = ?message,
                    "Control message sent"
                );
                true
            }
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Failed to send control message");
                false
            }
        }
    }

    /// Number of workers not yet reported as terminated.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }
}

/// Forward one worker's signals until its signal channel closes.
async fn monitor_worker(
    worker_id: WorkerId,
    mut signals: mpsc::Receiver<WorkerSignal>,
    workers: Arc<Mutex<HashMap<WorkerId, WorkerHandle>>>,
    events: mpsc::Sender<WorkerEvent>,
) {
    while let Some(signal) = signals.recv().await {
        let event = match signal {
            WorkerSignal::Port(port) => {
                debug!(worker_id = %worker_id, port, "Worker reported port");
                WorkerEvent::PortReported { worker_id, port }
            }
            WorkerSignal::Disconnected => {
                info!(worker_id = %worker_id, "Worker disconnected");
                match terminate(worker_id, ExitCause::Disconnected, &workers).await {
                    Some(event) => event,
                    None => continue,
                }
            }
            WorkerSignal::Exited(cause) => {
                log_exit(worker_id, cause);
                match terminate(worker_id, cause, &workers).await {
                    Some(event) => event,
                    None => continue,
                }
            }
        };

        if events.send(event).await.is_err() {
            warn!(worker_id = %worker_id, "Worker event receiver dropped");
            return;
        }
    }

    // Signal channel closed without a terminal signal: treat as disconnect.
    if let Some(event) = terminate(worker_id, ExitCause::Disconnected, &workers).await {
        let _ = events.send(event).await;
    }
}

/// Remove the handle, yielding the termination event only the first time.
async fn terminate(
    worker_id: WorkerId,
    cause: ExitCause,
    workers: &Mutex<HashMap<WorkerId, WorkerHandle>>,
) -> Option<WorkerEvent> {
    let removed = workers.lock().await.remove(&worker_id);
    match removed {
        Some(handle) => {
            debug!(
                worker_id = %worker_id,
                room = %handle.room_name,
                cause = %cause,
                "Worker bookkeeping released"
            );
            Some(WorkerEvent::Terminated { worker_id, cause })
        }
        None => {
            debug!(worker_id = %worker_id, cause = %cause, "Worker already terminated");
            None
        }
    }
}

fn log_exit(worker_id: WorkerId, cause: ExitCause) {
    match cause {
        ExitCause::Clean => info!(worker_id = %worker_id, "Worker shut down successfully"),
        ExitCause::Crashed { code } => {
            error!(worker_id = %worker_id, code, "Worker exited with error code")
        }
        ExitCause::Signaled { signal } => {
            error!(worker_id = %worker_id, signal, "Worker was killed by signal")
        }
        ExitCause::Disconnected => info!(worker_id = %worker_id, "Worker disconnected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::Receiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for worker event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_spawn_reports_port() {
        let launcher = Arc::new(MockLauncher::new());
        let (tx, mut rx) = mpsc::channel(16);
        let supervisor = WorkerSupervisor::new(launcher.clone(), tx);

        let id = WorkerId::new();
        supervisor.spawn(id, "lobby", 34000).await.unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            WorkerEvent::PortReported {
                worker_id: id,
                port: 34000
            }
        );
        assert_eq!(supervisor.worker_count().await, 1);
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_leads_to_single_termination() {
        let launcher = Arc::new(MockLauncher::new());
        let (tx, mut rx) = mpsc::channel(16);
        let supervisor = WorkerSupervisor::new(launcher.clone(), tx);

        let id = WorkerId::new();
        supervisor.spawn(id, "lobby", 34000).await.unwrap();
        next_event(&mut rx).await;

        assert!(supervisor.send(id, NodeMessage::Shutdown).await);
        assert_eq!(
            next_event(&mut rx).await,
            WorkerEvent::Terminated {
                worker_id: id,
                cause: ExitCause::Clean
            }
        );

        // The mock follows the exit with a disconnect; it must not surface.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
        assert_eq!(supervisor.worker_count().await, 0);
        assert!(!supervisor.send(id, NodeMessage::Shutdown).await);
    }

    #[tokio::test]
    async fn test_crash_is_reported_once() {
        let launcher = Arc::new(MockLauncher::new());
        let (tx, mut rx) = mpsc::channel(16);
        let supervisor = WorkerSupervisor::new(launcher.clone(), tx);

        let id = WorkerId::new();
        supervisor.spawn(id, "lobby", 34000).await.unwrap();
        next_event(&mut rx).await;

        launcher.disconnect("lobby");
        launcher.exit("lobby", ExitCause::Crashed { code: 3 });

        assert_eq!(
            next_event(&mut rx).await,
            WorkerEvent::Terminated {
                worker_id: id,
                cause: ExitCause::Disconnected
            }
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_launch_failure_registers_nothing() {
        let launcher = Arc::new(MockLauncher::failing());
        let (tx, _rx) = mpsc::channel(16);
        let supervisor = WorkerSupervisor::new(launcher, tx);

        let result = supervisor.spawn(WorkerId::new(), "lobby", 34000).await;
        assert!(matches!(result, Err(SpawnError::Launch(_))));
        assert_eq!(supervisor.worker_count().await, 0);
    }

    #[test]
    fn test_exit_cause_classification() {
        assert!(!ExitCause::Clean.is_failure());
        assert!(!ExitCause::Disconnected.is_failure());
        assert!(ExitCause::Crashed { code: 1 }.is_failure());
        assert!(ExitCause::Signaled { signal: 9 }.is_failure());
        assert_eq!(ExitCause::Crashed { code: 2 }.to_string(), "exit code 2");
    }
}
