//! Room worker process.
//!
//! Protocol with the node, over the worker's stdio:
//! 1. Worker binds its listener on the requested port
//! 2. Worker sends a `port` frame with the port it actually bound
//! 3. Worker serves until the node sends `shutdown` or closes stdin
//! 4. Worker stops accepting, drains open connections and exits 0
//!
//! ## State Machine
//!
//! ```text
//! Starting -> Listening -> ShuttingDown -> Terminated
//! ```

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    http::header::{
        ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE,
    },
    response::IntoResponse,
    Router,
};
use chatfleet_control::{decode_line, encode_line, NodeMessage, WorkerMessage};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::supervisor::{ROOM_NAME_ENV, ROOM_PORT_ENV, WORKER_ID_ENV};

/// Startup parameters read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomWorkerConfig {
    pub name: String,
    /// Requested port; 0 lets the OS choose.
    pub port: u16,
    pub worker_id: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerConfigError {
    #[error("Cannot create chatroom with empty name or port.")]
    Missing,

    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

impl RoomWorkerConfig {
    pub fn from_env() -> Result<Self, WorkerConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, WorkerConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let name = lookup(ROOM_NAME_ENV).unwrap_or_default();
        let port = lookup(ROOM_PORT_ENV).unwrap_or_default();
        if name.is_empty() || port.is_empty() {
            return Err(WorkerConfigError::Missing);
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| WorkerConfigError::InvalidPort(port.clone()))?;

        Ok(Self {
            name,
            port,
            worker_id: lookup(WORKER_ID_ENV),
        })
    }
}

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Listening,
    ShuttingDown,
    Terminated,
}

/// Why the worker stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The node sent `shutdown`.
    Requested,
    /// The control channel closed.
    NodeGone,
}

/// One room's worker.
pub struct RoomWorker {
    config: RoomWorkerConfig,
    state: Arc<watch::Sender<WorkerState>>,
}

impl RoomWorker {
    pub fn new(config: RoomWorkerConfig) -> Self {
        let (state, _) = watch::channel(WorkerState::Starting);
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Serve the room until told to stop.
    pub async fn run<R, W>(self, control_in: R, mut control_out: W) -> Result<StopReason>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.port))
            .await
            .with_context(|| format!("failed to bind port {}", self.config.port))?;
        let port = listener.local_addr()?.port();

        send_message(&mut control_out, WorkerMessage::Port { port }).await?;
        self.transition(WorkerState::Listening);
        info!(room = %self.config.name, port, "Room listening");

        let (reason_tx, reason_rx) = watch::channel(None);
        tokio::spawn(async move {
            let reason = wait_for_stop(control_in).await;
            reason_tx.send_replace(Some(reason));
        });

        let shutdown_signal = {
            let mut reason_rx = reason_rx.clone();
            let state = Arc::clone(&self.state);
            let room = self.config.name.clone();
            async move {
                let _ = reason_rx.wait_for(Option::is_some).await;
                state.send_replace(WorkerState::ShuttingDown);
                info!(room = %room, "Room shutting down");
            }
        };

        axum::serve(listener, room_router(self.config.name.clone()))
            .with_graceful_shutdown(shutdown_signal)
            .await
            .context("room server failed")?;

        let reason = (*reason_rx.borrow()).unwrap_or(StopReason::NodeGone);
        self.transition(WorkerState::Terminated);
        info!(room = %self.config.name, reason = ?reason, "Room closed");
        Ok(reason)
    }

    fn transition(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        debug!(room = %self.config.name, from = ?previous, to = ?next, "Worker state changed");
    }
}

/// Router answering every request with the room name.
pub fn room_router(name: String) -> Router {
    Router::new()
        .fallback(move || {
            let name = name.clone();
            async move {
                (
                    [
                        (CONTENT_TYPE, "text/plain; charset=utf-8"),
                        (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                        (ACCESS_CONTROL_ALLOW_HEADERS, "X-Requested-With"),
                    ],
                    name,
                )
                    .into_response()
            }
        })
        .layer(TraceLayer::new_for_http())
}

/// Write one control frame.
async fn send_message<W: AsyncWrite + Unpin>(out: &mut W, message: WorkerMessage) -> Result<()> {
    let line = encode_line(message)?;
    out.write_all(line.as_bytes())
        .await
        .context("failed to write control frame")?;
    out.flush().await.context("failed to flush control frame")?;
    Ok(())
}

/// Read control frames until a shutdown request or end of input.
async fn wait_for_stop<R: AsyncRead + Unpin>(control_in: R) -> StopReason {
    let mut lines = BufReader::new(control_in).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_line::<NodeMessage>(&line) {
                Ok(NodeMessage::Shutdown) => return StopReason::Requested,
                Err(e) => warn!(error = %e, "Ignoring malformed control frame"),
            },
            Ok(None) => return StopReason::NodeGone,
            Err(e) => {
                warn!(error = %e, "Control channel read failed");
                return StopReason::NodeGone;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn lookup(vars: &[(&str, &str)]) -> Result<RoomWorkerConfig, WorkerConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RoomWorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_config_requires_name_and_port() {
        assert_eq!(lookup(&[]), Err(WorkerConfigError::Missing));
        assert_eq!(
            lookup(&[(ROOM_NAME_ENV, ""), (ROOM_PORT_ENV, "34000")]),
            Err(WorkerConfigError::Missing)
        );
        assert_eq!(
            lookup(&[(ROOM_NAME_ENV, "lobby"), (ROOM_PORT_ENV, "nope")]),
            Err(WorkerConfigError::InvalidPort("nope".to_string()))
        );
    }

    #[test]
    fn test_config_from_env_vars() {
        let config = lookup(&[(ROOM_NAME_ENV, "lobby"), (ROOM_PORT_ENV, "34000")]).unwrap();
        assert_eq!(config.name, "lobby");
        assert_eq!(config.port, 34000);
        assert_eq!(config.worker_id, None);
    }

    #[tokio::test]
    async fn test_reports_port_serves_name_and_stops_on_shutdown() {
        let (node_side, worker_side) = tokio::io::duplex(1024);
        let (worker_in, worker_out) = tokio::io::split(worker_side);
        let (node_in, mut node_out) = tokio::io::split(node_side);

        let worker = RoomWorker::new(RoomWorkerConfig {
            name: "lobby".to_string(),
            port: 0,
            worker_id: None,
        });
        let states = worker.subscribe();
        let task = tokio::spawn(worker.run(worker_in, worker_out));

        let mut frames = BufReader::new(node_in).lines();
        let line = frames.next_line().await.unwrap().unwrap();
        let WorkerMessage::Port { port } = decode_line::<WorkerMessage>(&line).unwrap();
        assert_ne!(port, 0);
        assert_eq!(*states.borrow(), WorkerState::Listening);

        let body = reqwest::get(format!("http://127.0.0.1:{port}/anything"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "lobby");

        node_out
            .write_all(encode_line(NodeMessage::Shutdown).unwrap().as_bytes())
            .await
            .unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Requested);
        assert_eq!(*states.borrow(), WorkerState::Terminated);
    }

    #[tokio::test]
    async fn test_closed_control_channel_stops_worker() {
        let (node_side, worker_side) = tokio::io::duplex(1024);
        let (worker_in, worker_out) = tokio::io::split(worker_side);

        let worker = RoomWorker::new(RoomWorkerConfig {
            name: "lobby".to_string(),
            port: 0,
            worker_id: None,
        });
        let task = tokio::spawn(worker.run(worker_in, worker_out));
        drop(node_side);

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        // With the node gone the port report may fail before serving starts.
        if let Ok(reason) = result {
            assert_eq!(reason, StopReason::NodeGone);
        }
    }
}
