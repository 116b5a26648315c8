//! Public room endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ApiError;
use super::Envelope;
use crate::state::NodeContext;

/// Application name and version.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppInfo {
    pub app: String,
    pub version: String,
}

/// Room creation result.
///
/// `port` is the room's port, `-1` when another allocation is in flight and
/// `0` when the node has no capacity left.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRoomResponse {
    pub port: i32,
    pub message: String,
}

/// GET /api/v1/
pub async fn info(State(ctx): State<NodeContext>) -> Json<Envelope<AppInfo>> {
    Json(Envelope::new(AppInfo {
        app: ctx.app_name().to_string(),
        version: ctx.version().to_string(),
    }))
}

/// POST /api/v1/room/{name}
pub async fn create_room(
    State(ctx): State<NodeContext>,
    Path(name): Path<String>,
) -> Result<Json<Envelope<CreateRoomResponse>>, ApiError> {
    let response = match ctx.scheduler().create_room(&name).await {
        Ok(allocation) => CreateRoomResponse {
            port: i32::from(allocation.port()),
            message: allocation.message(&name),
        },
        Err(e) => match e.port_code() {
            Some(port) => CreateRoomResponse {
                port,
                message: e.message(),
            },
            None => return Err(e.into()),
        },
    };

    info!(room = %name, port = response.port, message = %response.message, "Create room");
    Ok(Json(Envelope::new(response)))
}
