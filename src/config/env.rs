use std::env;
use std::path::PathBuf;
use std::time::Duration;

use super::ServerConfig;
use super::utils::{parse_bool, parse_duration_ms};
use crate::core::session::CallConfig;

/// Read `name` as a duration in milliseconds, rejecting malformed values.
pub(super) fn duration_var(name: &str) -> Result<Option<u64>, Box<dyn std::error::Error>> {
    match env::var(name) {
        Ok(raw) => parse_duration_ms(&raw)
            .map(Some)
            .ok_or_else(|| format!("Invalid duration in {name}: '{raw}'").into()),
        Err(_) => Ok(None),
    }
}

/// Engine defaults with the handful of environment overrides operators
/// reach for most often.
pub(super) fn engine_from_env() -> Result<CallConfig, Box<dyn std::error::Error>> {
    let mut engine = CallConfig::default();
    if let Some(ms) = duration_var("DEAD_AIR_SILENCE_THRESHOLD")? {
        engine.dead_air.silence_threshold_ms = ms;
    }
    if let Some(ms) = duration_var("DEAD_AIR_HOLD_THRESHOLD")? {
        engine.dead_air.hold_threshold_ms = ms;
    }
    if let Ok(raw) = env::var("DEAD_AIR_MAX_CHECK_INS") {
        engine.dead_air.max_check_ins = raw
            .parse()
            .map_err(|e| format!("Invalid DEAD_AIR_MAX_CHECK_INS: {e}"))?;
    }
    if let Some(ms) = duration_var("SEMANTIC_TIMEOUT")? {
        engine.transition.semantic_timeout_ms = ms;
    }
    if let Some(enabled) = env::var("TRANSITION_CACHE_ENABLED")
        .ok()
        .and_then(|v| parse_bool(&v))
    {
        engine.transition.cache_enabled = enabled;
    }
    Ok(engine)
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// Reads configuration from environment variables, with sensible defaults.
    /// Also loads from .env file if present using dotenvy.
    ///
    /// # Errors
    /// Returns an error if a variable is malformed or validation fails.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3001".to_string())
            .parse::<u16>()
            .map_err(|e| format!("Invalid port number: {e}"))?;

        let cache_path = env::var("CACHE_PATH").ok().map(PathBuf::from);
        let cache_ttl_seconds = env::var("CACHE_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .or(Some(30 * 24 * 60 * 60)); // 30 days

        let graphs_path = env::var("GRAPHS_PATH").ok().map(PathBuf::from);

        let state_store_url = env::var("STATE_STORE_URL").ok();
        let state_ttl = duration_var("STATE_TTL")?
            .map(Duration::from_millis)
            .unwrap_or(super::DEFAULT_STATE_TTL);
        let state_api_secret = env::var("STATE_API_SECRET").ok();

        let auth_required = env::var("AUTH_REQUIRED")
            .ok()
            .and_then(|v| parse_bool(&v))
            .unwrap_or(false);

        let config = ServerConfig {
            host,
            port,
            cache_path,
            cache_ttl_seconds,
            graphs_path,
            state_store_url,
            state_ttl,
            state_api_secret,
            auth_required,
            engine: engine_from_env()?,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleanup_env_vars() {
        unsafe {
            env::remove_var("HOST");
            env::remove_var("PORT");
            env::remove_var("STATE_STORE_URL");
            env::remove_var("STATE_TTL");
            env::remove_var("STATE_API_SECRET");
            env::remove_var("AUTH_REQUIRED");
            env::remove_var("DEAD_AIR_SILENCE_THRESHOLD");
            env::remove_var("DEAD_AIR_MAX_CHECK_INS");
            env::remove_var("SEMANTIC_TIMEOUT");
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = ServerConfig::from_env().expect("Should load config");
        assert_eq!(config.port, 3001);
        assert!(!config.auth_required);
        assert!(!config.uses_remote_state());
        assert_eq!(config.state_ttl, super::super::DEFAULT_STATE_TTL);
        assert_eq!(config.engine, CallConfig::default());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_state_and_engine_overrides() {
        cleanup_env_vars();
        unsafe {
            env::set_var("STATE_STORE_URL", "http://coordinator:3001");
            env::set_var("STATE_TTL", "90s");
            env::set_var("DEAD_AIR_SILENCE_THRESHOLD", "5s");
            env::set_var("DEAD_AIR_MAX_CHECK_INS", "4");
            env::set_var("SEMANTIC_TIMEOUT", "1500ms");
        }

        let config = ServerConfig::from_env().expect("Should load config");
        assert_eq!(
            config.state_store_url.as_deref(),
            Some("http://coordinator:3001")
        );
        assert_eq!(config.state_ttl, Duration::from_secs(90));
        assert_eq!(config.engine.dead_air.silence_threshold_ms, 5000);
        assert_eq!(config.engine.dead_air.max_check_ins, 4);
        assert_eq!(config.engine.transition.semantic_timeout_ms, 1500);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_duration() {
        cleanup_env_vars();
        unsafe {
            env::set_var("STATE_TTL", "forever");
        }

        let err = ServerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("STATE_TTL"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_auth_requires_secret() {
        cleanup_env_vars();
        unsafe {
            env::set_var("AUTH_REQUIRED", "true");
        }
        assert!(ServerConfig::from_env().is_err());

        unsafe {
            env::set_var("STATE_API_SECRET", "my-secret");
        }
        let config = ServerConfig::from_env().expect("Should load config");
        assert!(config.auth_required);
        assert_eq!(config.state_api_secret.as_deref(), Some("my-secret"));

        cleanup_env_vars();
    }
}
