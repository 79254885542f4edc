use serde::Deserialize;
use std::path::Path;

use crate::core::session::CallConfig;

/// Complete YAML configuration structure
///
/// Every field is optional; environment variables fill whatever the file
/// leaves out.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///
/// cache:
///   path: "/var/cache/callwright"
///   ttl_seconds: 2592000
///
/// graphs:
///   path: "/etc/callwright/graphs"
///
/// state:
///   url: "http://coordinator:3001"   # omit for the in-process store
///   ttl: "1h"
///   api_secret: "shared-secret"
///
/// auth:
///   required: true
///
/// engine:
///   dead_air:
///     silence_threshold_ms: 8000
///     max_check_ins: 2
///   transition:
///     semantic_timeout_ms: 3000
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub cache: Option<CacheYaml>,
    pub graphs: Option<GraphsYaml>,
    pub state: Option<StateYaml>,
    pub auth: Option<AuthYaml>,
    /// Engine defaults; unset fields keep their built-in values.
    pub engine: Option<CallConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CacheYaml {
    pub path: Option<String>,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GraphsYaml {
    pub path: Option<String>,
}

/// Shared call-state store settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StateYaml {
    pub url: Option<String>,
    /// Duration string such as "90s" or "1h".
    pub ttl: Option<String>,
    pub api_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthYaml {
    pub required: Option<bool>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 8080

cache:
  path: "/tmp/cache"
  ttl_seconds: 3600

graphs:
  path: "/etc/graphs"

state:
  url: "http://coordinator:3001"
  ttl: "30m"
  api_secret: "state-secret"

auth:
  required: true

engine:
  max_webhook_hops: 2
  dead_air:
    max_check_ins: 3
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(
            config.server.as_ref().unwrap().host,
            Some("127.0.0.1".to_string())
        );
        assert_eq!(config.server.as_ref().unwrap().port, Some(8080));
        assert_eq!(
            config.graphs.as_ref().unwrap().path,
            Some("/etc/graphs".to_string())
        );
        let state = config.state.as_ref().unwrap();
        assert_eq!(state.url.as_deref(), Some("http://coordinator:3001"));
        assert_eq!(state.ttl.as_deref(), Some("30m"));
        assert_eq!(config.auth.as_ref().unwrap().required, Some(true));

        let engine = config.engine.as_ref().unwrap();
        assert_eq!(engine.max_webhook_hops, 2);
        assert_eq!(engine.dead_air.max_check_ins, 3);
        assert_eq!(engine.dead_air.silence_threshold_ms, 8000);
    }

    #[test]
    fn test_yaml_config_empty() {
        let config: YamlConfig = serde_yaml::from_str("").unwrap();

        assert!(config.server.is_none());
        assert!(config.cache.is_none());
        assert!(config.state.is_none());
        assert!(config.engine.is_none());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "server:\n  host: \"localhost\"\n  port: 3000\n").unwrap();

        let config = YamlConfig::from_file(&config_path).unwrap();

        assert_eq!(
            config.server.as_ref().unwrap().host,
            Some("localhost".to_string())
        );
        assert_eq!(config.server.as_ref().unwrap().port, Some(3000));
    }

    #[test]
    fn test_from_file_not_found() {
        let path = PathBuf::from("/nonexistent/config.yaml");
        let result = YamlConfig::from_file(&path);

        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");
        fs::write(&config_path, "invalid: yaml: content:").unwrap();

        let result = YamlConfig::from_file(&config_path);

        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }
}
