//! Tests running the real `chat-room` worker binary.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use chatfleet_control::NodeMessage;
use chatfleet_id::WorkerId;
use chatfleet_node::scheduler::{
    RoomAllocation, RoomState, Scheduler, SchedulerConfig, TcpPortCheck,
};
use chatfleet_node::supervisor::{
    ExitCause, LaunchedWorker, ProcessLauncher, WorkerLauncher, WorkerSignal, WorkerSpec,
};
use tokio::sync::watch;

const WORKER_BIN: &str = env!("CARGO_BIN_EXE_chat-room");

fn spec(room_name: &str, requested_port: u16) -> WorkerSpec {
    WorkerSpec {
        worker_id: WorkerId::new(),
        room_name: room_name.to_string(),
        requested_port,
    }
}

async fn next_signal(worker: &mut LaunchedWorker) -> WorkerSignal {
    tokio::time::timeout(Duration::from_secs(10), worker.signals.recv())
        .await
        .expect("no signal from worker")
        .expect("signal channel closed")
}

#[tokio::test]
async fn test_worker_reports_port_serves_and_exits_cleanly() {
    let launcher = ProcessLauncher::new(WORKER_BIN);
    let mut worker = launcher.launch(&spec("lobby", 0)).await.unwrap();
    assert!(worker.pid.is_some());

    let WorkerSignal::Port(port) = next_signal(&mut worker).await else {
        panic!("expected a port report first");
    };
    assert_ne!(port, 0);

    let response = reqwest::get(format!("http://127.0.0.1:{port}/anything"))
        .await
        .unwrap();
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.text().await.unwrap(), "lobby");

    worker.control.send(NodeMessage::Shutdown).await.unwrap();
    assert_eq!(
        next_signal(&mut worker).await,
        WorkerSignal::Exited(ExitCause::Clean)
    );
}

#[tokio::test]
async fn test_worker_exits_when_node_goes_away() {
    let launcher = ProcessLauncher::new(WORKER_BIN);
    let LaunchedWorker {
        control,
        mut signals,
        ..
    } = launcher.launch(&spec("lobby", 0)).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(10), signals.recv())
        .await
        .unwrap();
    assert!(matches!(first, Some(WorkerSignal::Port(_))));

    // Closing the control channel closes the worker's stdin.
    drop(control);
    let last = tokio::time::timeout(Duration::from_secs(10), signals.recv())
        .await
        .unwrap();
    assert_eq!(last, Some(WorkerSignal::Exited(ExitCause::Clean)));
}

#[tokio::test]
async fn test_worker_without_room_name_fails() {
    let launcher = ProcessLauncher::new(WORKER_BIN);
    let mut worker = launcher.launch(&spec("", 0)).await.unwrap();

    assert_eq!(
        next_signal(&mut worker).await,
        WorkerSignal::Exited(ExitCause::Crashed { code: 1 })
    );
}

#[tokio::test]
async fn test_scheduler_runs_real_workers() {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::start(
        SchedulerConfig::new(2, 47100..=47199),
        Arc::new(ProcessLauncher::new(WORKER_BIN)),
        Arc::new(TcpPortCheck),
        shutdown_rx,
    );
    scheduler.set_accepting(true).await.unwrap();

    let allocation = scheduler.create_room("lobby").await.unwrap();
    let RoomAllocation::Created(port) = allocation else {
        panic!("expected a new room, got {allocation:?}");
    };

    // The room turns active once the worker reports the port it bound.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = scheduler.snapshot().await.unwrap();
            if snapshot.rooms.iter().any(|r| r.state == RoomState::Active) {
                assert_eq!(snapshot.rooms[0].port, port);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("room never became active");

    let body = reqwest::get(format!("http://127.0.0.1:{port}/"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "lobby");

    assert_eq!(scheduler.shutdown_workers().await.unwrap(), 1);
    tokio::time::timeout(Duration::from_secs(10), async {
        while scheduler.snapshot().await.unwrap().room_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("worker did not exit");

    shutdown.send(true).unwrap();
}
