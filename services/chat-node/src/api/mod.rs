//! HTTP API handlers and routing.
//!
//! The node serves two listeners:
//! - public: app info and room creation (room creation needs the API key)
//! - admin: app info, load telemetry and room shutdown, all behind the
//!   admin key

pub mod admin;
pub mod auth;
pub mod error;
pub mod rooms;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

use self::auth::{require_api_key, ApiKey};
use crate::resources;
use crate::state::NodeContext;

/// `{data: ...}` response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// Router for the public listener.
pub fn create_public_router(ctx: NodeContext, key: &str) -> Router {
    let key = ApiKey::new(key);

    let keyed = Router::new()
        .route("/api/v1/room/{name}", post(rooms::create_room))
        .route_layer(middleware::from_fn_with_state(key, require_api_key));

    Router::new()
        .route("/api/v1", get(rooms::info))
        .route("/api/v1/", get(rooms::info))
        .merge(keyed)
        .layer(TraceLayer::new_for_http())
        .layer(common_headers())
        .layer(allow_headers())
        .layer(cors())
        .with_state(ctx)
}

/// Router for the admin listener.
pub fn create_admin_router(ctx: NodeContext, admin_key: &str) -> Router {
    let key = ApiKey::new(admin_key);

    Router::new()
        .route("/api/v1", get(admin::info))
        .route("/api/v1/", get(admin::info))
        .route("/api/v1/load", get(admin::load))
        .route("/api/v1/room/{name}/shutdown", delete(admin::close_room))
        .route_layer(middleware::from_fn_with_state(key, require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(common_headers())
        .layer(allow_headers())
        .layer(cors())
        .with_state(ctx)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([HeaderName::from_static("x-requested-with")])
        .allow_origin(Any)
}

/// Advertise the allowed request header on every response, not only on
/// preflights.
fn allow_headers() -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::if_not_present(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("X-Requested-With"),
    )
}

/// Identifies which host answered.
fn common_headers() -> SetResponseHeaderLayer<HeaderValue> {
    let whom = HeaderValue::from_str(&resources::hostname())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    SetResponseHeaderLayer::overriding(HeaderName::from_static("x-whom"), whom)
}
