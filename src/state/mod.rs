use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::CoreState;
use crate::core::cache::CacheStore;
use crate::core::state::CoreInitError;
use crate::utils::req_manager::ReqManager;

/// Application state that can be shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    /// Engine resources: cache, graphs, call registry, shared-state store
    pub core_state: Arc<CoreState>,
}

impl AppState {
    pub async fn new(config: ServerConfig) -> Result<Arc<Self>, CoreInitError> {
        let core_state = CoreState::new(&config).await?;
        Ok(Self::with_core(config, core_state))
    }

    /// Wrap an already built core, e.g. one prepared by a test.
    pub fn with_core(config: ServerConfig, core_state: Arc<CoreState>) -> Arc<Self> {
        Arc::new(Self { config, core_state })
    }

    /// Get a handle to the application's cache store
    pub fn cache(&self) -> Arc<CacheStore> {
        self.core_state.cache.clone()
    }

    /// The pooled HTTP client for webhooks and synthesis
    pub fn requests(&self) -> Arc<ReqManager> {
        self.core_state.requests.clone()
    }
}
