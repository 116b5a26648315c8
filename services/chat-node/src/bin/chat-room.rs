//! chatfleet room worker
//!
//! Started by a chat node with the room name and port in its environment.
//! Talks to the node over stdin/stdout; logs go to stderr.

use chatfleet_node::worker::{RoomWorker, RoomWorkerConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    chatfleet_node::init_tracing("info", true);

    let config = match RoomWorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid worker configuration");
            std::process::exit(1);
        }
    };

    info!(
        room = %config.name,
        requested_port = config.port,
        worker_id = config.worker_id.as_deref().unwrap_or("unknown"),
        pid = std::process::id(),
        "Starting room worker"
    );

    let worker = RoomWorker::new(config);
    match worker.run(tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(reason) => {
            info!(reason = ?reason, "Room worker exiting");
            // A blocked stdin read must not hold the runtime open.
            std::process::exit(0);
        }
        Err(e) => {
            error!(error = %e, "Room worker failed");
            std::process::exit(1);
        }
    }
}
