use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::config::ServerConfig;
use crate::core::cache::{CacheConfig, CacheError, CacheStore};
use crate::core::coordinator::{
    MemoryStateStore, RemoteStateStore, StateCoordinator, StateStore,
};
use crate::core::graph::{GraphError, GraphStore};
use crate::core::session::{CallConfig, SessionRegistry};
use crate::utils::req_manager::{ReqManager, ReqManagerConfig, ReqManagerError};

#[derive(Debug, Error)]
pub enum CoreInitError {
    #[error("Cache initialization failed: {0}")]
    Cache(#[from] CacheError),

    #[error("HTTP pool initialization failed: {0}")]
    Requests(#[from] ReqManagerError),

    #[error("Graph loading failed: {0}")]
    Graphs(#[from] GraphError),
}

/// Resources owned by the engine and shared by every call in this process.
#[derive(Clone)]
pub struct CoreState {
    /// Transition decisions and synthesized audio.
    pub cache: Arc<CacheStore>,
    pub graphs: Arc<GraphStore>,
    /// Pool for webhooks and synthesis.
    pub requests: Arc<ReqManager>,
    pub registry: SessionRegistry,
    /// The store this process serves on `POST /state`. `None` when shared
    /// state lives on a remote coordinator.
    pub state_service: Option<Arc<dyn StateStore>>,
    pub engine: Arc<CallConfig>,
}

impl CoreState {
    pub async fn new(config: &ServerConfig) -> Result<Arc<Self>, CoreInitError> {
        let cache_cfg = match &config.cache_path {
            Some(path) => CacheConfig::Filesystem {
                path: path.clone(),
                ttl_seconds: config.cache_ttl_seconds,
            },
            None => CacheConfig::Memory {
                max_entries: 100_000,
                ttl_seconds: config.cache_ttl_seconds,
            },
        };
        let cache = Arc::new(CacheStore::from_config(cache_cfg).await?);

        let graphs = Arc::new(GraphStore::new());
        if let Some(dir) = &config.graphs_path {
            let loaded = graphs.load_dir(dir)?;
            info!(graphs = loaded, path = %dir.display(), "Loaded conversation graphs");
        }

        let requests = Arc::new(ReqManager::with_config(ReqManagerConfig::default())?);

        let (store, state_service): (Arc<dyn StateStore>, Option<Arc<dyn StateStore>>) =
            match &config.state_store_url {
                Some(url) => {
                    let pool = Arc::new(ReqManager::with_config(ReqManagerConfig::low_latency())?);
                    info!(url = %url, "Using remote call-state coordinator");
                    let remote = RemoteStateStore::new(url, config.state_api_secret.clone(), pool);
                    (Arc::new(remote), None)
                }
                None => {
                    let local = Arc::new(MemoryStateStore::new());
                    local.spawn_sweeper(Duration::from_secs(30));
                    info!("Serving call state from this process");
                    let shared: Arc<dyn StateStore> = local;
                    (Arc::clone(&shared), Some(shared))
                }
            };
        let coordinator = StateCoordinator::new(store, config.state_ttl);

        Ok(Arc::new(Self {
            cache,
            graphs,
            requests,
            registry: SessionRegistry::new(coordinator),
            state_service,
            engine: Arc::new(config.engine.clone()),
        }))
    }

    pub fn coordinator(&self) -> &StateCoordinator {
        self.registry.coordinator()
    }
}
