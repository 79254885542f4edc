//! Server configuration from YAML files and environment variables.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//! - `utils`: Helpers for parsing booleans and durations
//!
//! # Example
//! ```rust,no_run
//! use callwright::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file; environment variables fill the gaps
//! let config = ServerConfig::from_file(&PathBuf::from("config.yaml"))?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::session::CallConfig;

mod env;
mod merge;
mod utils;
mod validation;
mod yaml;

pub use utils::{parse_bool, parse_duration_ms};

/// Default lifetime of shared call-state keys.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(3600);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // Cache configuration (filesystem or memory)
    pub cache_path: Option<PathBuf>, // if None, use in-memory cache
    pub cache_ttl_seconds: Option<u64>,

    /// Directory of conversation graph files loaded at startup.
    pub graphs_path: Option<PathBuf>,

    // Shared call state
    /// Coordinator serving `POST /state`. `None` keeps state in process.
    pub state_store_url: Option<String>,
    pub state_ttl: Duration,
    /// Bearer secret for the state endpoint, used as client and server.
    pub state_api_secret: Option<String>,

    pub auth_required: bool,

    /// Engine defaults applied to every call.
    pub engine: CallConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            cache_path: None,
            cache_ttl_seconds: Some(30 * 24 * 60 * 60),
            graphs_path: None,
            state_store_url: None,
            state_ttl: DEFAULT_STATE_TTL,
            state_api_secret: None,
            auth_required: false,
            engine: CallConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file merged with environment variables
    ///
    /// Values present in the file win; environment variables fill whatever
    /// the file leaves out, then defaults apply. The merged configuration is
    /// validated before it is returned.
    ///
    /// A `.env` file is not read here: the YAML file is the source of truth
    /// and only real environment variables complement it.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        config.validate()?;
        Ok(config)
    }

    /// Run every validation rule against this configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        validation::validate_auth_required(self.auth_required, &self.state_api_secret)?;
        validation::validate_state_store_url(&self.state_store_url)?;
        validation::validate_engine(&self.engine)?;
        Ok(())
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether shared call state lives on a remote coordinator.
    pub fn uses_remote_state(&self) -> bool {
        self.state_store_url.is_some()
    }
}
