//! In-process launcher for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chatfleet_control::NodeMessage;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ExitCause, LaunchedWorker, SpawnError, WorkerLauncher, WorkerSignal, WorkerSpec};

/// Launcher that simulates workers without starting processes.
///
/// By default a simulated worker reports its requested port right away and
/// exits cleanly when told to shut down, like a real room worker. Tests can
/// inject exits, disconnects and port reports by room name.
pub struct MockLauncher {
    launches: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    fail_launches: bool,
    auto_report: bool,
    signals: Mutex<HashMap<String, mpsc::Sender<WorkerSignal>>>,
}

impl MockLauncher {
    /// Launcher whose workers behave like healthy room workers.
    pub fn new() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            fail_launches: false,
            auto_report: true,
            signals: Mutex::new(HashMap::new()),
        }
    }

    /// Launcher that fails every launch.
    pub fn failing() -> Self {
        Self {
            fail_launches: true,
            ..Self::new()
        }
    }

    /// Launcher whose workers never report a port on their own.
    pub fn silent() -> Self {
        Self {
            auto_report: false,
            ..Self::new()
        }
    }

    /// Successful launches so far.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Shutdown messages received by simulated workers so far.
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Simulate a port report from the worker of `room`.
    pub fn report_port(&self, room: &str, port: u16) -> bool {
        self.signal(room, WorkerSignal::Port(port))
    }

    /// Simulate the worker of `room` exiting.
    pub fn exit(&self, room: &str, cause: ExitCause) -> bool {
        self.signal(room, WorkerSignal::Exited(cause))
    }

    /// Simulate the control channel of `room` closing.
    pub fn disconnect(&self, room: &str) -> bool {
        self.signal(room, WorkerSignal::Disconnected)
    }

    fn signal(&self, room: &str, signal: WorkerSignal) -> bool {
        let signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        signals
            .get(room)
            .is_some_and(|tx| tx.try_send(signal).is_ok())
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchedWorker, SpawnError> {
        if self.fail_launches {
            return Err(SpawnError::Launch(
                "mock launcher configured to fail".to_string(),
            ));
        }

        info!(
            worker_id = %spec.worker_id,
            room = %spec.room_name,
            port = spec.requested_port,
            "[MOCK] Launching worker"
        );

        let (control_tx, mut control_rx) = mpsc::channel::<NodeMessage>(8);
        let (signal_tx, signal_rx) = mpsc::channel(16);

        if self.auto_report {
            let _ = signal_tx.try_send(WorkerSignal::Port(spec.requested_port));
        }

        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(spec.room_name.clone(), signal_tx.clone());

        let shutdowns = Arc::clone(&self.shutdowns);
        let worker_id = spec.worker_id;
        tokio::spawn(async move {
            while let Some(message) = control_rx.recv().await {
                match message {
                    NodeMessage::Shutdown => {
                        debug!(worker_id = %worker_id, "[MOCK] Worker shutting down");
                        shutdowns.fetch_add(1, Ordering::SeqCst);
                        let _ = signal_tx.send(WorkerSignal::Exited(ExitCause::Clean)).await;
                        let _ = signal_tx.send(WorkerSignal::Disconnected).await;
                        break;
                    }
                }
            }
        });

        self.launches.fetch_add(1, Ordering::SeqCst);

        Ok(LaunchedWorker {
            pid: None,
            control: control_tx,
            signals: signal_rx,
        })
    }
}
