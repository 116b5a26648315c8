//! chatfleet chat node
//!
//! Accepts requests to create chat rooms, runs each room in its own worker
//! process, and advertises remaining capacity to the load balancers.
//!
//! ## Startup
//!
//! 1. Admin listener, then public listener
//! 2. Start accepting rooms
//! 3. Register with load balancers, then on every heartbeat interval
//!
//! ## Shutdown (SIGTERM / Ctrl-C)
//!
//! Stop accepting rooms, stop the heartbeat, ask every worker to shut down
//! and drain both listeners.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use chatfleet_node::api;
use chatfleet_node::breaker::BreakerConfig;
use chatfleet_node::client::LoadBalancerClient;
use chatfleet_node::config::Config;
use chatfleet_node::registrar::Registrar;
use chatfleet_node::scheduler::{Scheduler, SchedulerConfig, TcpPortCheck};
use chatfleet_node::state::NodeContext;
use chatfleet_node::supervisor::ProcessLauncher;
use chatfleet_node::{APP_NAME, VERSION};

/// How long to wait for workers to exit after asking them to.
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest an in-flight registration pass may delay shutdown.
const REGISTRAR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    let level = config.as_ref().map_or("info", |c| c.log_level.as_str());
    chatfleet_node::init_tracing(level, false);

    let config = config.inspect_err(|e| error!(error = %e, "Failed to load configuration"))?;
    info!(
        node_id = %config.node_id,
        environment = %config.environment,
        port = config.port,
        admin_port = config.admin_port,
        host = %config.host,
        loadbalancers = config.loadbalancers.len(),
        worker_bin = %config.worker_bin.display(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_config = SchedulerConfig::from_host(config.port_range.clone());
    info!(
        app = APP_NAME,
        version = VERSION,
        total_slots = scheduler_config.total_slots,
        "Starting chat node"
    );

    let launcher = ProcessLauncher::new(&config.worker_bin)
        .with_env("CHATFLEET_ENV", config.environment.to_string());
    let scheduler = Scheduler::start(
        scheduler_config,
        Arc::new(launcher),
        Arc::new(TcpPortCheck),
        shutdown_rx.clone(),
    );
    let ctx = NodeContext::new(scheduler.clone(), APP_NAME, VERSION);

    let admin_listener = TcpListener::bind(("0.0.0.0", config.admin_port))
        .await
        .with_context(|| format!("failed to bind admin port {}", config.admin_port))?;
    info!(port = config.admin_port, "Admin listening for connections");
    let admin_handle = serve(
        "admin",
        admin_listener,
        api::create_admin_router(ctx.clone(), &config.admin_key),
        shutdown_rx.clone(),
    );

    let public_listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!(port = config.port, "Listening for connections");
    let public_handle = serve(
        "public",
        public_listener,
        api::create_public_router(ctx.clone(), &config.key),
        shutdown_rx.clone(),
    );

    scheduler.set_accepting(true).await?;

    let client = LoadBalancerClient::new(
        config.loadbalancer_key.clone(),
        config.environment.is_production(),
        BreakerConfig::default(),
    )?;
    let registrar = Registrar::new(
        Arc::new(client),
        config.loadbalancers.clone(),
        scheduler.clone(),
        config.advertised_address(),
        VERSION,
    );
    let registrar = registrar.spawn(Duration::from_secs(config.heartbeat_interval_secs));

    shutdown_signal().await;

    if let Err(e) = scheduler.set_accepting(false).await {
        warn!(error = %e, "Could not stop accepting rooms");
    }
    if !registrar.stop(REGISTRAR_STOP_TIMEOUT).await {
        warn!("Registration loop did not shut down in time");
    }

    match scheduler.shutdown_workers().await {
        Ok(count) => {
            info!(rooms = count, "Waiting for rooms to close...");
            drain_rooms(&scheduler).await;
        }
        Err(e) => warn!(error = %e, "Could not shut down rooms"),
    }

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = Duration::from_secs(10);
    for (name, handle) in [("admin", admin_handle), ("public", public_handle)] {
        match tokio::time::timeout(shutdown_timeout, handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(server = name, error = %e, "Server error"),
            Ok(Err(e)) => error!(server = name, error = %e, "Server task panicked"),
            Err(_) => warn!(server = name, "Server did not shut down in time"),
        }
    }

    info!("Chat node shutdown complete");
    Ok(())
}

/// Serve `app` until the shutdown flag flips.
fn serve(
    name: &'static str,
    listener: TcpListener,
    app: axum::Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                info!(server = name, "HTTP server shutting down");
            })
            .await
    })
}

/// Wait until no rooms remain or the drain timeout passes.
async fn drain_rooms(scheduler: &Scheduler) {
    let drained = tokio::time::timeout(WORKER_DRAIN_TIMEOUT, async {
        loop {
            match scheduler.snapshot().await {
                Ok(snapshot) if snapshot.rooms.is_empty() => break,
                Ok(_) => tokio::time::sleep(Duration::from_millis(100)).await,
                Err(_) => break,
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!("Rooms still open after drain timeout");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
