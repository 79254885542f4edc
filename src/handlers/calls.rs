//! Call endpoints: transport playback callbacks and call inspection.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::coordinator::SharedCallState;
use crate::core::session::CallInfo;
use crate::core::transport::PlaybackEventKind;
use crate::errors::app_error::{AppError, AppResult};
use crate::state::AppState;

/// Body of a transport playback callback.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackEventRequest {
    pub event: PlaybackEventKind,
    pub unit_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaybackEventResponse {
    /// Whether the call runs in this process.
    pub hosted: bool,
    /// Whether this callback released a playback slot.
    pub released: bool,
    pub playback_count: Option<i64>,
}

/// `POST /calls/{call_id}/playback`
///
/// Any worker may receive the callback. Shared playback state is updated
/// either way, and the hosting session is notified when it lives here.
pub async fn playback_event(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    Json(body): Json<PlaybackEventRequest>,
) -> AppResult<Json<PlaybackEventResponse>> {
    if body.unit_id.trim().is_empty() {
        return Err(AppError::BadRequest("unit_id cannot be empty".to_string()));
    }

    let registry = &state.core_state.registry;
    let change = registry
        .playback_event(&call_id, body.event, &body.unit_id)
        .await?;

    Ok(Json(PlaybackEventResponse {
        hosted: registry.contains(&call_id),
        released: change.is_some_and(|c| c.changed),
        playback_count: change.map(|c| c.count),
    }))
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStateResponse {
    /// Present when the call runs in this process.
    pub session: Option<CallInfo>,
    pub shared: SharedCallState,
}

/// `GET /calls/{call_id}/state`
pub async fn call_state(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> AppResult<Json<CallStateResponse>> {
    let core = &state.core_state;
    let shared = core.coordinator().snapshot(&call_id).await?;
    Ok(Json(CallStateResponse {
        session: core.registry.get(&call_id).map(|s| s.info()),
        shared,
    }))
}

/// `GET /calls`
pub async fn list_calls(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CallInfo>>, StatusCode> {
    Ok(Json(state.core_state.registry.list()))
}
