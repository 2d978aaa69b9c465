use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use super::{AppError, AppState};
use crate::model::{Device, Position};

/// A live device session as returned by the API.
#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub device_id: i64,
    pub unique_id: String,
    pub protocol: String,
    pub remote_addr: String,
}

/// GET /api/devices — list all devices.
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Device>>, AppError> {
    let devices = state.devices.list_devices().await?;
    Ok(Json(devices))
}

/// GET /api/devices/:id — get a single device.
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Device>, AppError> {
    let device = state
        .devices
        .device_by_id(id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(device))
}

/// GET /api/devices/:id/session — the device's live session, 404 when the
/// device is not connected.
pub async fn session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<SessionInfo>, AppError> {
    let session = state.manager.lookup_by_device(id).ok_or(AppError::NotFound)?;
    Ok(Json(SessionInfo {
        device_id: session.device_id,
        unique_id: session.unique_id.clone(),
        protocol: session.protocol.clone(),
        remote_addr: session.endpoint.remote_addr().to_string(),
    }))
}

/// GET /api/devices/:id/position — most recent stored position.
pub async fn position(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Position>, AppError> {
    let position = state
        .positions
        .latest_position(id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(position))
}
