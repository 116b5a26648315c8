//! HTTP API tests against the public and admin routers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use chatfleet_node::api::{create_admin_router, create_public_router};
use chatfleet_node::scheduler::{MockPortCheck, PortCheck, Scheduler, SchedulerConfig};
use chatfleet_node::state::NodeContext;
use chatfleet_node::supervisor::MockLauncher;
use serde_json::Value;
use tokio::sync::watch;
use tower::ServiceExt;

const KEY: &str = "public-key";
const ADMIN_KEY: &str = "admin-key";

struct TestNode {
    public: Router,
    admin: Router,
    scheduler: Scheduler,
    _shutdown: watch::Sender<bool>,
}

async fn node_with(
    total_slots: usize,
    checker: Arc<dyn PortCheck>,
    range: std::ops::RangeInclusive<u16>,
) -> TestNode {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::start(
        SchedulerConfig::new(total_slots, range),
        Arc::new(MockLauncher::new()),
        checker,
        shutdown_rx,
    );
    scheduler.set_accepting(true).await.unwrap();

    let ctx = NodeContext::new(scheduler.clone(), "chatfleet-node", "0.1.0");
    TestNode {
        public: create_public_router(ctx.clone(), KEY),
        admin: create_admin_router(ctx, ADMIN_KEY),
        scheduler,
        _shutdown: shutdown,
    }
}

async fn node(total_slots: usize) -> TestNode {
    node_with(total_slots, Arc::new(MockPortCheck::new()), 34000..=34050).await
}

async fn send(router: &Router, method: Method, uri: &str, key: Option<&str>) -> Response {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        request = request.header("X-API-Key", key);
    }
    router
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_public_info_needs_no_key() {
    let node = node(3).await;

    for uri in ["/api/v1", "/api/v1/"] {
        let response = send(&node.public, Method::GET, uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-whom"));
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
            "X-Requested-With"
        );

        let body = json(response).await;
        assert_eq!(body["data"]["app"], "chatfleet-node");
        assert_eq!(body["data"]["version"], "0.1.0");
    }
}

#[tokio::test]
async fn test_create_room_requires_key() {
    let node = node(3).await;

    for key in [None, Some("wrong"), Some("")] {
        let response = send(&node.public, Method::POST, "/api/v1/room/lobby", key).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(response).await["message"], "Unauthorized");
    }

    assert_eq!(node.scheduler.snapshot().await.unwrap().room_count(), 0);
}

#[tokio::test]
async fn test_empty_configured_key_locks_the_route() {
    let (_shutdown, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::start(
        SchedulerConfig::new(3, 34000..=34050),
        Arc::new(MockLauncher::new()),
        Arc::new(MockPortCheck::new()),
        shutdown_rx,
    );
    let router = create_public_router(NodeContext::new(scheduler, "chatfleet-node", "0.1.0"), "");

    let response = send(&router, Method::POST, "/api/v1/room/lobby", Some("")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_room_then_existing() {
    let node = node(3).await;

    let response = send(&node.public, Method::POST, "/api/v1/room/lobby", Some(KEY)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let created = json(response).await;
    assert_eq!(created["data"]["message"], "Room created");
    let port = created["data"]["port"].as_i64().unwrap();
    assert!((34000..=34050).contains(&port));

    let response = send(&node.public, Method::POST, "/api/v1/room/lobby", Some(KEY)).await;
    let again = json(response).await;
    assert_eq!(again["data"]["port"].as_i64(), Some(port));
    assert_eq!(again["data"]["message"], "lobby already exists");
}

#[tokio::test]
async fn test_create_room_without_capacity_reports_port_zero() {
    let node = node(0).await;

    let response = send(&node.public, Method::POST, "/api/v1/room/lobby", Some(KEY)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["data"]["port"], 0);
    assert_eq!(body["data"]["message"], "No more rooms can be created");
}

#[tokio::test]
async fn test_port_exhaustion_is_a_problem_response() {
    let checker = Arc::new(MockPortCheck::with_busy([34000, 34001]));
    let node = node_with(3, checker, 34000..=34001).await;

    let response = send(&node.public, Method::POST, "/api/v1/room/lobby", Some(KEY)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/problem+json"
    );

    let problem = json(response).await;
    assert_eq!(problem["code"], "port_allocation_failed");
    assert_eq!(problem["status"], 503);
    assert_eq!(problem["retryable"], true);

    let snapshot = node.scheduler.snapshot().await.unwrap();
    assert_eq!(snapshot.pool.used_slots, 0);
}

#[tokio::test]
async fn test_admin_routes_require_admin_key() {
    let node = node(3).await;

    for uri in ["/api/v1/", "/api/v1/load"] {
        let response = send(&node.admin, Method::GET, uri, Some(KEY)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let response = send(
        &node.admin,
        Method::DELETE,
        "/api/v1/room/lobby/shutdown",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&node.admin, Method::GET, "/api/v1/", Some(ADMIN_KEY)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["data"]["app"], "Admin chatfleet-node");
}

#[tokio::test]
async fn test_admin_load_reports_rooms_and_capacity() {
    let node = node(3).await;
    node.scheduler.create_room("beta").await.unwrap();
    node.scheduler.create_room("alpha").await.unwrap();

    let response = send(&node.admin, Method::GET, "/api/v1/load", Some(ADMIN_KEY)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    let load = &body["data"];

    assert_eq!(load["cpus"], 3);
    assert_eq!(load["capacity"], 1);
    assert_eq!(load["rooms"], "alpha,beta");
    assert_eq!(load["acceptingConnections"], true);
    assert_eq!(load["loadAvg"].as_array().unwrap().len(), 3);
    assert!(load["totalMemory"].is_u64());
    assert!(load["freeMemory"].is_u64());
    assert!(load["percentage"].as_u64().unwrap() <= 100);
    assert!(load["osUpTime"].is_number());
    assert!(load["upTime"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn test_admin_shutdown_room() {
    let node = node(3).await;
    node.scheduler.create_room("lobby").await.unwrap();

    let response = send(
        &node.admin,
        Method::DELETE,
        "/api/v1/room/lobby/shutdown",
        Some(ADMIN_KEY),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json(response).await;
    assert_eq!(body["data"]["name"], "lobby");
    assert_eq!(body["data"]["message"], "Shutting down");

    tokio::time::timeout(Duration::from_secs(5), async {
        while node.scheduler.snapshot().await.unwrap().room_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room was not removed");

    let response = send(
        &node.admin,
        Method::DELETE,
        "/api/v1/room/lobby/shutdown",
        Some(ADMIN_KEY),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(
        body["data"]["message"],
        "Either shutdown already or doesn't exist"
    );
}

#[tokio::test]
async fn test_cors_preflight() {
    let node = node(3).await;

    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/v1/room/lobby")
        .header(header::ORIGIN, "http://chat.example")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-requested-with")
        .body(Body::empty())
        .unwrap();
    let response = node.public.clone().oneshot(request).await.unwrap();

    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}
