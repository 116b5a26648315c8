//! chatfleet chat node.
//!
//! A node hosts chat rooms, each served by its own `chat-room` worker
//! process on its own port, and advertises its remaining capacity to a set of
//! load balancers.
//!
//! ## Architecture
//!
//! - **Scheduler**: single actor owning room and capacity state
//! - **Supervisor**: launches workers and turns their lifecycle into events
//! - **Breaker**: per-endpoint circuit breaker for outbound calls
//! - **Registrar**: heartbeat loop registering with every load balancer
//! - **API**: public and admin HTTP listeners

pub mod actor;
pub mod api;
pub mod breaker;
pub mod client;
pub mod config;
pub mod registrar;
pub mod resources;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod worker;

/// Application name reported by the API and advertised to load balancers.
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Node version advertised to load balancers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize JSON logging, honoring `RUST_LOG` before `default_level`.
///
/// `to_stderr` keeps stdout free for the worker control channel.
pub fn init_tracing(default_level: &str, to_stderr: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);

    if to_stderr {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}
