//! Admin endpoints. Every route here sits behind the admin key.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ApiError;
use super::rooms::AppInfo;
use super::Envelope;
use crate::resources::HostLoad;
use crate::state::NodeContext;

/// Node load report.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResponse {
    pub load_avg: [f64; 3],
    pub total_memory: u64,
    pub free_memory: u64,
    /// Used memory percentage, rounded down.
    pub percentage: u64,
    /// Room capacity.
    pub cpus: usize,
    /// Comma-separated room names.
    pub rooms: String,
    /// Slots still free.
    pub capacity: usize,
    pub os_up_time: f64,
    /// When the node started accepting rooms.
    pub up_time: Option<String>,
    pub accepting_connections: bool,
}

/// Room shutdown result.
#[derive(Debug, Serialize, Deserialize)]
pub struct CloseRoomResponse {
    pub name: String,
    pub message: String,
}

/// GET /api/v1/
pub async fn info(State(ctx): State<NodeContext>) -> Json<Envelope<AppInfo>> {
    Json(Envelope::new(AppInfo {
        app: format!("Admin {}", ctx.app_name()),
        version: ctx.version().to_string(),
    }))
}

/// GET /api/v1/load
pub async fn load(State(ctx): State<NodeContext>) -> Result<Json<Envelope<LoadResponse>>, ApiError> {
    let snapshot = ctx.scheduler().snapshot().await?;
    let host = HostLoad::measure();

    Ok(Json(Envelope::new(LoadResponse {
        load_avg: host.load_avg,
        total_memory: host.total_memory_bytes,
        free_memory: host.free_memory_bytes,
        percentage: host.used_memory_percentage(),
        cpus: snapshot.pool.total_slots,
        rooms: snapshot.room_names().join(","),
        capacity: snapshot.pool.remaining(),
        os_up_time: host.uptime_secs,
        up_time: snapshot
            .started_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        accepting_connections: snapshot.pool.accepting_connections,
    })))
}

/// DELETE /api/v1/room/{name}/shutdown
///
/// 202 when a shutdown was sent, 200 when the room is already gone.
pub async fn close_room(
    State(ctx): State<NodeContext>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<Envelope<CloseRoomResponse>>), ApiError> {
    let outcome = ctx.scheduler().close_room(&name).await?;
    info!(room = %name, status = outcome.status(), "Close room");

    let status = StatusCode::from_u16(outcome.status()).unwrap_or(StatusCode::OK);
    Ok((
        status,
        Json(Envelope::new(CloseRoomResponse {
            name,
            message: outcome.message().to_string(),
        })),
    ))
}
