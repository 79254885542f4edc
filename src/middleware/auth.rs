use crate::auth::api_secret_matches;
use crate::errors::auth_error::AuthError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Bearer-token middleware for the state endpoint.
///
/// Requests pass untouched while no state API secret is configured. Once a
/// secret is set, the `Authorization: Bearer {secret}` header must match it;
/// the comparison runs in constant time.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(secret) = state.config.state_api_secret.as_deref() else {
        if state.config.auth_required {
            return Err(AuthError::SecretNotConfigured);
        }
        tracing::debug!("Authentication disabled");
        return Ok(next.run(request).await);
    };

    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let token = request
        .headers()
        .get("authorization")
        .ok_or(AuthError::MissingBearer)?
        .to_str()
        .map_err(|_| AuthError::MalformedBearer)?
        .strip_prefix("Bearer ")
        .ok_or(AuthError::MalformedBearer)?;

    if !api_secret_matches(token, secret) {
        tracing::warn!(method = %method, path = %path, "API secret authentication failed");
        return Err(AuthError::SecretMismatch);
    }

    tracing::debug!(method = %method, path = %path, "API secret authentication successful");
    Ok(next.run(request).await)
}
