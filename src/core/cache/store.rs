//! Keyed byte cache shared by the transition evaluator and the HTTP
//! synthesizer.
//!
//! Keys are namespaced (`transition`, `audio`, ...) and hashed with xxh3 before
//! they reach a backend, so callers can use long natural keys such as
//! `graph:node:normalized utterance` without worrying about backend limits.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_128;

use super::filesystem::FilesystemCacheBackend;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Storage behind a [`CacheStore`]. Keys arrive already hashed.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CacheResult<()>;

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    async fn clear(&self) -> CacheResult<()>;

    fn backend_type(&self) -> &'static str;
}

/// Hit/miss counters, readable while the cache is in use.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

/// Point-in-time copy of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

impl CacheMetrics {
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct MemoryEntry {
    data: Bytes,
    ttl: Option<Duration>,
}

struct PerEntryTtl;

impl Expiry<String, MemoryEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process backend on top of moka, bounded by entry count.
pub struct MemoryCacheBackend {
    cache: MokaCache<String, MemoryEntry>,
    default_ttl: Option<Duration>,
}

impl MemoryCacheBackend {
    pub fn new(max_entries: u64, default_ttl: Option<Duration>) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache, default_ttl }
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CacheResult<()> {
        let entry = MemoryEntry {
            data: value,
            ttl: ttl.or(self.default_ttl),
        };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        Ok(self.cache.get(key).await.map(|entry| entry.data))
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Backend selection, as it appears in the server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheConfig {
    Memory {
        max_entries: u64,
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },
    Filesystem {
        path: PathBuf,
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory {
            max_entries: 100_000,
            ttl_seconds: Some(24 * 60 * 60),
        }
    }
}

/// Namespaced, hashed, metered cache.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    metrics: CacheMetrics,
}

impl CacheStore {
    pub async fn from_config(config: CacheConfig) -> CacheResult<Self> {
        let backend: Arc<dyn CacheBackend> = match config {
            CacheConfig::Memory {
                max_entries,
                ttl_seconds,
            } => {
                if max_entries == 0 {
                    return Err(CacheError::InvalidConfig(
                        "max_entries must be greater than zero".to_string(),
                    ));
                }
                Arc::new(MemoryCacheBackend::new(
                    max_entries,
                    ttl_seconds.map(Duration::from_secs),
                ))
            }
            CacheConfig::Filesystem { path, ttl_seconds } => Arc::new(
                FilesystemCacheBackend::new(path, ttl_seconds.map(Duration::from_secs)).await?,
            ),
        };
        Ok(Self::with_backend(backend))
    }

    pub fn with_backend(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            metrics: CacheMetrics::default(),
        }
    }

    /// Small in-memory store for tests and single-process setups.
    pub fn in_memory(max_entries: u64) -> Self {
        Self::with_backend(Arc::new(MemoryCacheBackend::new(max_entries, None)))
    }

    fn hashed_key(namespace: &str, key: &str) -> String {
        format!("{namespace}:{:032x}", xxh3_128(key.as_bytes()))
    }

    pub async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let value = value.into();
        debug!(namespace, key, size = value.len(), "Cache write");
        self.backend
            .set(&Self::hashed_key(namespace, key), value, ttl)
            .await?;
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn get(&self, namespace: &str, key: &str) -> CacheResult<Option<Bytes>> {
        let found = self.backend.get(&Self::hashed_key(namespace, key)).await?;
        if found.is_some() {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    /// Serialize `value` as JSON and store it.
    pub async fn put_json<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let encoded = serde_json::to_vec(value)?;
        self.put(namespace, key, encoded, ttl).await
    }

    /// Fetch and decode a JSON value. Entries that no longer decode are
    /// dropped and reported as misses.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> CacheResult<Option<T>> {
        let Some(raw) = self.get(namespace, key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(namespace, key, error = %e, "Discarding undecodable cache entry");
                self.delete(namespace, key).await?;
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> CacheResult<()> {
        self.backend.delete(&Self::hashed_key(namespace, key)).await
    }

    pub async fn clear(&self) -> CacheResult<()> {
        warn!(backend = self.backend.backend_type(), "Clearing cache");
        self.backend.clear().await
    }

    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot()
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }
}
