//! Capacity-aware room scheduler.
//!
//! Maps room names to worker ports. All room and capacity state lives in a
//! single actor; callers talk to it through the cloneable `Scheduler` handle.
//! Worker processes are realized through the `WorkerSupervisor`, whose
//! lifecycle events flow back into the actor's mailbox.
//!
//! Invariants kept by the actor:
//! - at most one allocation is in flight at a time
//! - `used_slots <= total_slots`
//! - active room names and ports are unique
//! - each worker termination releases its slot exactly once

mod actor;
mod ports;

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use chatfleet_id::WorkerId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

pub use actor::{SchedulerActor, SchedulerMessage};
pub use ports::{
    find_free_port, MockPortCheck, PortCheck, TcpPortCheck, DEFAULT_PORT_RANGE,
};

use crate::actor::{mailbox, spawn_actor, ActorHandle};
use crate::resources;
use crate::supervisor::{ExitCause, SpawnError, WorkerLauncher, WorkerSupervisor};

const MAILBOX_SIZE: usize = 256;
const EVENT_BUFFER: usize = 256;

// =============================================================================
// Data Model
// =============================================================================

/// Lifecycle of a room as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    /// Worker launched, port not yet confirmed.
    Pending,
    /// Worker reported the port it is listening on.
    Active,
    /// Shutdown requested, waiting for the worker to exit.
    ShuttingDown,
}

/// A named room served by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Room {
    pub name: String,
    pub port: u16,
    pub worker_id: WorkerId,
    pub state: RoomState,
}

/// Fixed room capacity of this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityPool {
    pub total_slots: usize,
    pub used_slots: usize,
    pub accepting_connections: bool,
}

impl CapacityPool {
    /// Whether a new room may be allocated.
    pub fn has_capacity(&self) -> bool {
        self.accepting_connections && self.used_slots < self.total_slots
    }

    /// Slots still free.
    pub fn remaining(&self) -> usize {
        self.total_slots.saturating_sub(self.used_slots)
    }
}

/// Scheduler tuning, fixed at startup.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub total_slots: usize,
    pub port_range: RangeInclusive<u16>,
}

impl SchedulerConfig {
    pub fn new(total_slots: usize, port_range: RangeInclusive<u16>) -> Self {
        Self {
            total_slots,
            port_range,
        }
    }

    /// One slot per host CPU, keeping one CPU for the node itself.
    pub fn from_host(port_range: RangeInclusive<u16>) -> Self {
        Self::new(resources::cpu_count().saturating_sub(1), port_range)
    }
}

// =============================================================================
// Results and Errors
// =============================================================================

/// Successful `create_room` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomAllocation {
    /// The room already existed.
    Existing(u16),
    /// A worker was launched for the room.
    Created(u16),
}

impl RoomAllocation {
    pub fn port(&self) -> u16 {
        match self {
            RoomAllocation::Existing(port) | RoomAllocation::Created(port) => *port,
        }
    }

    /// Client-facing message for `name`.
    pub fn message(&self, name: &str) -> String {
        match self {
            RoomAllocation::Existing(_) => format!("{name} already exists"),
            RoomAllocation::Created(_) => "Room created".to_string(),
        }
    }
}

/// `close_room` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Shutdown sent; the room goes away once its worker exits.
    ShuttingDown,
    /// No such room.
    AlreadyGone,
}

impl CloseOutcome {
    /// HTTP status reported to callers.
    pub fn status(&self) -> u16 {
        match self {
            CloseOutcome::ShuttingDown => 202,
            CloseOutcome::AlreadyGone => 200,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CloseOutcome::ShuttingDown => "Shutting down",
            CloseOutcome::AlreadyGone => "Either shutdown already or doesn't exist",
        }
    }
}

/// Why a room could not be allocated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Another allocation holds the single-flight guard. Retry later.
    #[error("another room is being allocated")]
    AllocationBusy,

    /// Not accepting rooms, or every slot is used.
    #[error("no more rooms can be created")]
    CapacityExhausted,

    /// Port scan found nothing. No slot was taken.
    #[error("no free port in {start}-{end}")]
    PortAllocationFailure { start: u16, end: u16 },

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// The worker died before its allocation completed. No slot was taken.
    #[error("worker for room {name} exited during startup: {cause}")]
    WorkerCrash { name: String, cause: ExitCause },

    /// The scheduler actor is not running.
    #[error("scheduler unavailable")]
    Unavailable,
}

impl SchedulerError {
    /// Legacy port code for outcomes that callers see as a port number.
    ///
    /// `-1` means retry later, `0` means no capacity.
    pub fn port_code(&self) -> Option<i32> {
        match self {
            SchedulerError::AllocationBusy => Some(-1),
            SchedulerError::CapacityExhausted => Some(0),
            _ => None,
        }
    }

    /// Client-facing message.
    pub fn message(&self) -> String {
        match self {
            SchedulerError::AllocationBusy => "Cannot create a room at this time".to_string(),
            SchedulerError::CapacityExhausted => "No more rooms can be created".to_string(),
            other => other.to_string(),
        }
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub pool: CapacityPool,
    /// Rooms sorted by name.
    pub rooms: Vec<Room>,
    pub allocating: bool,
    /// When the node last started accepting rooms.
    pub started_at: Option<DateTime<Utc>>,
}

impl SchedulerSnapshot {
    pub fn room_names(&self) -> Vec<&str> {
        self.rooms.iter().map(|room| room.name.as_str()).collect()
    }

    pub fn room_count(&self) -> usize {
        self.pool.used_slots
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to the scheduler actor.
#[derive(Clone)]
pub struct Scheduler {
    handle: ActorHandle<SchedulerMessage>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("actor_id", &self.handle.actor_id())
            .finish()
    }
}

impl Scheduler {
    /// Start the scheduler actor and its worker supervisor.
    ///
    /// The actor runs until `shutdown` flips to true.
    pub fn start(
        config: SchedulerConfig,
        launcher: Arc<dyn WorkerLauncher>,
        checker: Arc<dyn PortCheck>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);
        let supervisor = Arc::new(WorkerSupervisor::new(launcher, events_tx));

        let (handle, mailbox) = mailbox("scheduler", MAILBOX_SIZE);
        let actor = SchedulerActor::new(config, supervisor, checker, handle.clone());
        spawn_actor(actor, mailbox, shutdown);

        let forward = handle.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if forward.send(SchedulerMessage::Worker(event)).await.is_err() {
                    debug!("Scheduler stopped, dropping worker events");
                    break;
                }
            }
        });

        Self { handle }
    }

    /// Create `name`, or return its port if it already exists.
    pub async fn create_room(&self, name: &str) -> Result<RoomAllocation, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            SchedulerMessage::CreateRoom {
                name: name.to_string(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Ask the worker of `name` to shut down without waiting for it.
    pub async fn close_room(&self, name: &str) -> Result<CloseOutcome, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            SchedulerMessage::CloseRoom {
                name: name.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.request(SchedulerMessage::Snapshot { reply }, rx).await
    }

    /// Open or close the node for new rooms. Opening stamps the uptime.
    pub async fn set_accepting(&self, accepting: bool) -> Result<(), SchedulerError> {
        self.handle
            .send(SchedulerMessage::SetAccepting { accepting })
            .await
            .map_err(|_| SchedulerError::Unavailable)
    }

    /// Stop accepting rooms and ask every worker to shut down.
    ///
    /// Returns the number of rooms signalled.
    pub async fn shutdown_workers(&self) -> Result<usize, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.request(SchedulerMessage::ShutdownAll { reply }, rx)
            .await
    }

    async fn request<T>(
        &self,
        msg: SchedulerMessage,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, SchedulerError> {
        self.handle
            .send(msg)
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        rx.await.map_err(|_| SchedulerError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_capacity() {
        let mut pool = CapacityPool {
            total_slots: 2,
            used_slots: 0,
            accepting_connections: false,
        };
        assert!(!pool.has_capacity());

        pool.accepting_connections = true;
        assert!(pool.has_capacity());

        pool.used_slots = 2;
        assert!(!pool.has_capacity());
        assert_eq!(pool.remaining(), 0);
    }

    #[test]
    fn test_allocation_messages() {
        assert_eq!(RoomAllocation::Existing(34000).message("a"), "a already exists");
        assert_eq!(RoomAllocation::Created(34001).message("b"), "Room created");
        assert_eq!(RoomAllocation::Created(34001).port(), 34001);
    }

    #[test]
    fn test_error_port_codes() {
        assert_eq!(SchedulerError::AllocationBusy.port_code(), Some(-1));
        assert_eq!(SchedulerError::CapacityExhausted.port_code(), Some(0));
        assert_eq!(
            SchedulerError::PortAllocationFailure {
                start: 34000,
                end: 34050
            }
            .port_code(),
            None
        );
        assert_eq!(
            SchedulerError::AllocationBusy.message(),
            "Cannot create a room at this time"
        );
    }

    #[test]
    fn test_close_outcome_status() {
        assert_eq!(CloseOutcome::ShuttingDown.status(), 202);
        assert_eq!(CloseOutcome::AlreadyGone.status(), 200);
    }
}
