//! Heartbeat loop registering this node with every load balancer.
//!
//! The node registers once at startup and then on every interval tick,
//! reporting:
//! - its advertised address
//! - its room capacity
//! - the current room count
//! - its version
//!
//! Peers are contacted concurrently through the circuit breaker. A failing
//! peer never affects the others, and failures are only logged: the next
//! tick is the retry.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::Url;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{LoadBalancerClient, Registration, RegistrationFailure};
use crate::scheduler::Scheduler;

/// Outcome of one peer registration.
#[derive(Debug)]
pub struct PeerOutcome {
    pub peer: Url,
    pub result: Result<String, RegistrationFailure>,
}

/// Periodically registers with the configured load balancers.
pub struct Registrar {
    client: Arc<LoadBalancerClient>,
    peers: Vec<Url>,
    scheduler: Scheduler,
    address: String,
    version: String,
}

impl Registrar {
    pub fn new(
        client: Arc<LoadBalancerClient>,
        peers: Vec<Url>,
        scheduler: Scheduler,
        address: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            client,
            peers,
            scheduler,
            address: address.into(),
            version: version.into(),
        }
    }

    /// Run one registration pass against every peer.
    pub async fn register_once(&self) -> Vec<PeerOutcome> {
        let snapshot = match self.scheduler.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Cannot read scheduler state, skipping registration");
                return Vec::new();
            }
        };

        let registration = Registration {
            address: self.address.clone(),
            cpus: snapshot.pool.total_slots,
            rooms: snapshot.room_count(),
            version: self.version.clone(),
        };

        let calls = self.peers.iter().map(|peer| {
            let registration = &registration;
            async move {
                PeerOutcome {
                    peer: peer.clone(),
                    result: self.client.register(peer, registration).await,
                }
            }
        });
        let outcomes = join_all(calls).await;

        for outcome in &outcomes {
            match &outcome.result {
                Ok(body) => debug!(peer = %outcome.peer, body = %body, "Registered with load balancer"),
                Err(failure) => log_failure(&outcome.peer, failure),
            }
        }

        outcomes
    }

    /// Run the loop on its own task.
    pub fn spawn(self, interval: Duration) -> RegistrarHandle {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(interval, stop_rx));
        RegistrarHandle { stop, task }
    }

    /// Register immediately, then on every `interval` until shutdown.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            peers = self.peers.len(),
            interval_secs = interval.as_secs(),
            "Starting registration loop"
        );

        let mut interval_timer = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    let outcomes = self.register_once().await;
                    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
                    debug!(peers = outcomes.len(), failed, "Registration pass complete");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Registration loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Running registration loop with its own stop signal.
///
/// Stopping it leaves the scheduler untouched, so the node can go quiet
/// towards the load balancers before it starts closing rooms.
pub struct RegistrarHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RegistrarHandle {
    /// Stop the loop, letting an in-flight pass finish.
    ///
    /// Returns false if the loop did not stop within `timeout`.
    pub async fn stop(self, timeout: Duration) -> bool {
        let _ = self.stop.send(true);
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Registration loop panicked");
                true
            }
            Err(_) => false,
        }
    }
}

fn log_failure(peer: &Url, failure: &RegistrationFailure) {
    let category = failure.category();
    match failure {
        RegistrationFailure::CircuitOpen => {
            debug!(peer = %peer, category, "Load balancer skipped, circuit open")
        }
        RegistrationFailure::Remote { status } => {
            warn!(peer = %peer, category, status, "Load balancer rejected registration")
        }
        RegistrationFailure::Unreachable(reason) => {
            warn!(peer = %peer, category, reason = %reason, "Load balancer unreachable")
        }
        RegistrationFailure::Timeout(after) => {
            warn!(peer = %peer, category, timeout_ms = after.as_millis() as u64, "Load balancer timed out")
        }
        RegistrationFailure::Other(reason) => {
            error!(peer = %peer, category, reason = %reason, "Registration failed")
        }
    }
}
