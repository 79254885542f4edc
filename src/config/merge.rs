use std::env;
use std::path::PathBuf;
use std::time::Duration;

use super::ServerConfig;
use super::env::{duration_var, engine_from_env};
use super::utils::{parse_bool, parse_duration_ms};
use super::yaml::YamlConfig;

/// Merge YAML configuration with environment variables
///
/// Priority order (highest to lowest):
/// 1. YAML configuration values
/// 2. Environment variables
/// 3. Default values
///
/// The `engine` section is taken whole: when the file has one, its unset
/// fields fall back to built-in defaults rather than to the environment.
pub fn merge_config(
    yaml_config: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let yaml = yaml_config.unwrap_or_default();

    // YAML > ENV > Default
    macro_rules! get_value {
        ($env_var:expr, $yaml_value:expr, $default:expr) => {
            $yaml_value
                .or_else(|| env::var($env_var).ok())
                .unwrap_or_else(|| $default.to_string())
        };
    }

    // YAML > ENV
    macro_rules! get_optional {
        ($env_var:expr, $yaml_value:expr) => {
            $yaml_value.or_else(|| env::var($env_var).ok())
        };
    }

    let host = get_value!(
        "HOST",
        yaml.server.as_ref().and_then(|s| s.host.clone()),
        "0.0.0.0"
    );

    let port = if let Some(yaml_port) = yaml.server.as_ref().and_then(|s| s.port) {
        yaml_port
    } else if let Ok(port_str) = env::var("PORT") {
        port_str
            .parse::<u16>()
            .map_err(|e| format!("Invalid PORT environment variable: {e}"))?
    } else {
        3001
    };

    let cache_path = get_optional!(
        "CACHE_PATH",
        yaml.cache.as_ref().and_then(|c| c.path.clone())
    )
    .map(PathBuf::from);

    let cache_ttl_seconds = yaml
        .cache
        .as_ref()
        .and_then(|c| c.ttl_seconds)
        .or_else(|| {
            env::var("CACHE_TTL_SECONDS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
        })
        .or(Some(30 * 24 * 60 * 60));

    let graphs_path = get_optional!(
        "GRAPHS_PATH",
        yaml.graphs.as_ref().and_then(|g| g.path.clone())
    )
    .map(PathBuf::from);

    let state = yaml.state.as_ref();
    let state_store_url = get_optional!("STATE_STORE_URL", state.and_then(|s| s.url.clone()));
    let state_api_secret = get_optional!(
        "STATE_API_SECRET",
        state.and_then(|s| s.api_secret.clone())
    );
    let state_ttl = match state.and_then(|s| s.ttl.as_deref()) {
        Some(raw) => Some(
            parse_duration_ms(raw).ok_or_else(|| format!("Invalid state.ttl: '{raw}'"))?,
        ),
        None => duration_var("STATE_TTL")?,
    }
    .map(Duration::from_millis)
    .unwrap_or(super::DEFAULT_STATE_TTL);

    let auth_required = yaml
        .auth
        .as_ref()
        .and_then(|a| a.required)
        .or_else(|| env::var("AUTH_REQUIRED").ok().and_then(|v| parse_bool(&v)))
        .unwrap_or(false);

    let engine = match yaml.engine {
        Some(engine) => engine,
        None => engine_from_env()?,
    };

    Ok(ServerConfig {
        host,
        port,
        cache_path,
        cache_ttl_seconds,
        graphs_path,
        state_store_url,
        state_ttl,
        state_api_secret,
        auth_required,
        engine,
    })
}
