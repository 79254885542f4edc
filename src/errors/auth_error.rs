use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Machine-readable `error` values in rejection bodies.
pub mod error_codes {
    pub const MISSING_BEARER: &str = "missing_bearer";
    pub const MALFORMED_BEARER: &str = "malformed_bearer";
    pub const SECRET_MISMATCH: &str = "secret_mismatch";
    pub const SECRET_NOT_CONFIGURED: &str = "secret_not_configured";
}

/// Why a request to the shared-state endpoint was refused.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("State endpoint requires an Authorization header")]
    MissingBearer,

    /// Present, but not `Bearer {secret}`.
    #[error("Authorization header is not a bearer token")]
    MalformedBearer,

    #[error("Bearer token does not match the state API secret")]
    SecretMismatch,

    /// Auth is required but the worker has no secret to check against.
    #[error("State endpoint requires auth but no state API secret is configured")]
    SecretNotConfigured,
}

impl AuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::MissingBearer => error_codes::MISSING_BEARER,
            AuthError::MalformedBearer => error_codes::MALFORMED_BEARER,
            AuthError::SecretMismatch => error_codes::SECRET_MISMATCH,
            AuthError::SecretNotConfigured => error_codes::SECRET_NOT_CONFIGURED,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::SecretNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match &self {
            AuthError::SecretNotConfigured => tracing::error!(error = %self, "State auth misconfigured"),
            AuthError::SecretMismatch => tracing::warn!(error = %self, "State request rejected"),
            _ => tracing::debug!(error = %self, "State request rejected"),
        }

        let body = Json(json!({
            "error": self.error_code(),
            "message": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
