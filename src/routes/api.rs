use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{api, calls};
use crate::state::AppState;

/// Health check plus the call endpoints transports and operators use.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(api::health_check))
        .route("/calls", get(calls::list_calls))
        .route("/calls/{call_id}/state", get(calls::call_state))
        .route("/calls/{call_id}/playback", post(calls::playback_event))
        .layer(TraceLayer::new_for_http())
}
