use axum::{extract::State, response::Json};
use std::sync::Arc;

use crate::core::coordinator::{StateOp, StateReply, apply_op};
use crate::errors::app_error::{AppError, AppResult};
use crate::state::AppState;

/// `POST /state`
///
/// Executes one store operation for a worker using
/// [`RemoteStateStore`](crate::core::coordinator::RemoteStateStore). Only
/// available on the process that owns the shared store.
pub async fn execute_state_op(
    State(state): State<Arc<AppState>>,
    Json(op): Json<StateOp>,
) -> AppResult<Json<StateReply>> {
    let store = state.core_state.state_service.as_ref().ok_or_else(|| {
        AppError::NotFound("this process does not serve shared call state".to_string())
    })?;
    tracing::debug!(?op, "State operation");
    Ok(Json(apply_op(store.as_ref(), op).await?))
}
