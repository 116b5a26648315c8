//! Scheduler actor - sole owner of room and capacity state.
//!
//! ## Allocation
//!
//! ```text
//! CreateRoom --(existing name)--------------> Existing(port)
//!            --(allocation in flight)--------> AllocationBusy
//!            --(not accepting / pool full)---> CapacityExhausted
//!            --(otherwise)-------------------> in flight: port scan + spawn task
//!                                              |
//! AllocationFinished <-------------------------+
//!            --(scan or launch failed)-------> error, no slot taken
//!            --(worker already gone)---------> WorkerCrash, no slot taken
//!            --(ok)--------------------------> room recorded, slot taken
//! ```
//!
//! The port scan and launch run off the actor so it keeps answering while an
//! allocation is in flight; the in-flight slot is the single-flight guard.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chatfleet_control::NodeMessage;
use chatfleet_id::WorkerId;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::ports::{find_free_port, PortCheck};
use super::{
    CapacityPool, CloseOutcome, Room, RoomAllocation, RoomState, SchedulerConfig, SchedulerError,
    SchedulerSnapshot,
};
use crate::actor::{Actor, ActorContext, ActorError, ActorHandle};
use crate::supervisor::{ExitCause, WorkerEvent, WorkerSupervisor};

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by the scheduler actor.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// Create a room, or return the existing one.
    CreateRoom {
        name: String,
        reply: oneshot::Sender<Result<RoomAllocation, SchedulerError>>,
    },

    /// Ask a room's worker to shut down.
    CloseRoom {
        name: String,
        reply: oneshot::Sender<CloseOutcome>,
    },

    /// Read-only view of rooms and capacity.
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },

    /// Open or close the node for new rooms.
    SetAccepting { accepting: bool },

    /// Stop accepting and ask every worker to shut down.
    ShutdownAll { reply: oneshot::Sender<usize> },

    /// Outcome of the in-flight port scan and launch.
    AllocationFinished {
        worker_id: WorkerId,
        result: Result<u16, SchedulerError>,
    },

    /// Lifecycle event from the worker supervisor.
    Worker(WorkerEvent),
}

/// The allocation currently holding the single-flight guard.
struct PendingAllocation {
    worker_id: WorkerId,
    name: String,
    reply: oneshot::Sender<Result<RoomAllocation, SchedulerError>>,
    reported_port: Option<u16>,
    early_exit: Option<ExitCause>,
}

// =============================================================================
// Actor
// =============================================================================

pub struct SchedulerActor {
    config: SchedulerConfig,
    supervisor: Arc<WorkerSupervisor>,
    checker: Arc<dyn PortCheck>,
    self_handle: ActorHandle<SchedulerMessage>,

    rooms: HashMap<String, Room>,
    workers: HashMap<WorkerId, String>,
    pool: CapacityPool,
    in_flight: Option<PendingAllocation>,
    started_at: Option<DateTime<Utc>>,
}

impl SchedulerActor {
    pub fn new(
        config: SchedulerConfig,
        supervisor: Arc<WorkerSupervisor>,
        checker: Arc<dyn PortCheck>,
        self_handle: ActorHandle<SchedulerMessage>,
    ) -> Self {
        let pool = CapacityPool {
            total_slots: config.total_slots,
            used_slots: 0,
            accepting_connections: false,
        };
        Self {
            config,
            supervisor,
            checker,
            self_handle,
            rooms: HashMap::new(),
            workers: HashMap::new(),
            pool,
            in_flight: None,
            started_at: None,
        }
    }

    fn create_room(
        &mut self,
        name: String,
        reply: oneshot::Sender<Result<RoomAllocation, SchedulerError>>,
    ) {
        if let Some(room) = self.rooms.get(&name) {
            debug!(room = %name, port = room.port, "Room already exists");
            let _ = reply.send(Ok(RoomAllocation::Existing(room.port)));
            return;
        }

        if self.in_flight.is_some() {
            debug!(room = %name, "Allocation in flight, rejecting");
            let _ = reply.send(Err(SchedulerError::AllocationBusy));
            return;
        }

        if !self.pool.has_capacity() {
            debug!(
                room = %name,
                used_slots = self.pool.used_slots,
                total_slots = self.pool.total_slots,
                accepting = self.pool.accepting_connections,
                "No capacity for new room"
            );
            let _ = reply.send(Err(SchedulerError::CapacityExhausted));
            return;
        }

        let worker_id = WorkerId::new();
        let reserved: HashSet<u16> = self.rooms.values().map(|room| room.port).collect();
        info!(room = %name, worker_id = %worker_id, "Allocating room");

        tokio::spawn(allocate(
            worker_id,
            name.clone(),
            self.config.port_range.clone(),
            reserved,
            Arc::clone(&self.checker),
            Arc::clone(&self.supervisor),
            self.self_handle.clone(),
        ));

        self.in_flight = Some(PendingAllocation {
            worker_id,
            name,
            reply,
            reported_port: None,
            early_exit: None,
        });
    }

    fn finish_allocation(&mut self, worker_id: WorkerId, result: Result<u16, SchedulerError>) {
        let Some(pending) = self.in_flight.take_if(|p| p.worker_id == worker_id) else {
            warn!(worker_id = %worker_id, "Allocation result for unknown worker");
            return;
        };

        let outcome = match (result, pending.early_exit) {
            (Err(e), _) => {
                warn!(room = %pending.name, error = %e, "Room allocation failed");
                Err(e)
            }
            (Ok(_), Some(cause)) => {
                warn!(room = %pending.name, cause = %cause, "Worker exited during startup");
                Err(SchedulerError::WorkerCrash {
                    name: pending.name,
                    cause,
                })
            }
            (Ok(requested), None) => {
                let (port, state) = match pending.reported_port {
                    Some(port) => (port, RoomState::Active),
                    None => (requested, RoomState::Pending),
                };
                self.rooms.insert(
                    pending.name.clone(),
                    Room {
                        name: pending.name.clone(),
                        port,
                        worker_id,
                        state,
                    },
                );
                self.workers.insert(worker_id, pending.name.clone());
                self.pool.used_slots += 1;

                info!(
                    room = %pending.name,
                    worker_id = %worker_id,
                    port,
                    used_slots = self.pool.used_slots,
                    total_slots = self.pool.total_slots,
                    "Room created"
                );
                Ok(RoomAllocation::Created(port))
            }
        };

        let _ = pending.reply.send(outcome);
    }

    fn close_room(&mut self, name: &str) -> CloseOutcome {
        let Some(room) = self.rooms.get_mut(name) else {
            debug!(room = %name, "Close requested for absent room");
            return CloseOutcome::AlreadyGone;
        };

        room.state = RoomState::ShuttingDown;
        let worker_id = room.worker_id;
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            supervisor.send(worker_id, NodeMessage::Shutdown).await;
        });

        info!(room = %name, worker_id = %worker_id, "Room shutting down");
        CloseOutcome::ShuttingDown
    }

    fn shutdown_all(&mut self) -> usize {
        self.pool.accepting_connections = false;

        let worker_ids: Vec<WorkerId> = self
            .rooms
            .values_mut()
            .map(|room| {
                room.state = RoomState::ShuttingDown;
                room.worker_id
            })
            .collect();
        let count = worker_ids.len();

        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            for worker_id in worker_ids {
                supervisor.send(worker_id, NodeMessage::Shutdown).await;
            }
        });

        info!(rooms = count, "Shutting down all rooms");
        count
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::PortReported { worker_id, port } => {
                if let Some(pending) = self.in_flight.as_mut().filter(|p| p.worker_id == worker_id)
                {
                    pending.reported_port = Some(port);
                    return;
                }

                let Some(room) = self
                    .workers
                    .get(&worker_id)
                    .and_then(|name| self.rooms.get_mut(name))
                else {
                    debug!(worker_id = %worker_id, port, "Port report for unknown worker");
                    return;
                };

                if room.port != port {
                    info!(room = %room.name, requested = room.port, actual = port, "Worker bound a different port");
                }
                room.port = port;
                if room.state == RoomState::Pending {
                    room.state = RoomState::Active;
                }
            }
            WorkerEvent::Terminated { worker_id, cause } => {
                if let Some(pending) = self.in_flight.as_mut().filter(|p| p.worker_id == worker_id)
                {
                    pending.early_exit = Some(cause);
                    return;
                }

                let Some(name) = self.workers.remove(&worker_id) else {
                    debug!(worker_id = %worker_id, "Termination for unknown worker");
                    return;
                };
                self.rooms.remove(&name);
                self.pool.used_slots = self.pool.used_slots.saturating_sub(1);

                if cause.is_failure() {
                    warn!(
                        room = %name,
                        worker_id = %worker_id,
                        cause = %cause,
                        used_slots = self.pool.used_slots,
                        "Room worker crashed, room removed"
                    );
                } else {
                    info!(
                        room = %name,
                        worker_id = %worker_id,
                        cause = %cause,
                        used_slots = self.pool.used_slots,
                        "Room removed"
                    );
                }
            }
        }
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let mut rooms: Vec<Room> = self.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        SchedulerSnapshot {
            pool: self.pool.clone(),
            rooms,
            allocating: self.in_flight.is_some(),
            started_at: self.started_at,
        }
    }
}

#[async_trait]
impl Actor for SchedulerActor {
    type Message = SchedulerMessage;

    fn name(&self) -> &str {
        "scheduler"
    }

    async fn handle(
        &mut self,
        msg: SchedulerMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            SchedulerMessage::CreateRoom { name, reply } => self.create_room(name, reply),
            SchedulerMessage::CloseRoom { name, reply } => {
                let _ = reply.send(self.close_room(&name));
            }
            SchedulerMessage::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SchedulerMessage::SetAccepting { accepting } => {
                self.pool.accepting_connections = accepting;
                if accepting {
                    self.started_at = Some(Utc::now());
                }
                info!(accepting, "Accepting connections changed");
            }
            SchedulerMessage::ShutdownAll { reply } => {
                let _ = reply.send(self.shutdown_all());
            }
            SchedulerMessage::AllocationFinished { worker_id, result } => {
                self.finish_allocation(worker_id, result)
            }
            SchedulerMessage::Worker(event) => self.handle_worker_event(event),
        }
        Ok(true)
    }

    async fn on_start(&mut self, ctx: &mut ActorContext) -> Result<(), ActorError> {
        info!(
            actor_id = %ctx.actor_id,
            total_slots = self.pool.total_slots,
            port_range_start = *self.config.port_range.start(),
            port_range_end = *self.config.port_range.end(),
            "Scheduler started"
        );
        Ok(())
    }

    async fn on_stop(&mut self, ctx: &mut ActorContext) {
        info!(
            actor_id = %ctx.actor_id,
            rooms = self.rooms.len(),
            used_slots = self.pool.used_slots,
            "Scheduler stopped"
        );
    }
}

/// Scan for a port and launch the worker, then report back to the actor.
async fn allocate(
    worker_id: WorkerId,
    name: String,
    port_range: std::ops::RangeInclusive<u16>,
    reserved: HashSet<u16>,
    checker: Arc<dyn PortCheck>,
    supervisor: Arc<WorkerSupervisor>,
    scheduler: ActorHandle<SchedulerMessage>,
) {
    let (start, end) = (*port_range.start(), *port_range.end());

    let result = match find_free_port(checker.as_ref(), port_range, &reserved).await {
        None => Err(SchedulerError::PortAllocationFailure { start, end }),
        Some(port) => supervisor
            .spawn(worker_id, &name, port)
            .await
            .map(|_| port)
            .map_err(SchedulerError::from),
    };

    if scheduler
        .send(SchedulerMessage::AllocationFinished { worker_id, result })
        .await
        .is_err()
    {
        warn!(room = %name, worker_id = %worker_id, "Scheduler gone before allocation finished");
    }
}
