use axum::{Router, routing::post};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::state;
use crate::state::AppState;

/// The shared-state endpoint. Merge behind the auth middleware.
pub fn create_state_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/state", post(state::execute_state_op))
        .layer(TraceLayer::new_for_http())
}
