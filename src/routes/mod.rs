pub mod api;
pub mod state;

use axum::{Router, middleware};
use std::sync::Arc;

use crate::middleware::auth_middleware;
use crate::state::AppState;

/// The full HTTP surface: public call routes plus the protected state route.
pub fn create_app(app_state: Arc<AppState>) -> Router {
    let protected_routes = state::create_state_router().layer(middleware::from_fn_with_state(
        app_state.clone(),
        auth_middleware,
    ));

    api::create_api_router()
        .merge(protected_routes)
        .with_state(app_state)
}
