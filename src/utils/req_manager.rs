//! Pooled HTTP client shared by the webhook executor, the HTTP synthesizer and
//! the remote state store.
//!
//! One long-lived `reqwest::Client` keeps connections warm; a semaphore caps
//! the number of requests in flight so a burst of calls cannot open an
//! unbounded number of sockets against a single upstream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error)]
pub enum ReqManagerError {
    #[error("Invalid request pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Request pool is closed")]
    Closed,
}

#[derive(Debug, Default)]
pub struct RequestMetrics {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    active_requests: AtomicUsize,
    peak_concurrent: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub active_requests: usize,
    pub peak_concurrent: usize,
}

impl RequestMetrics {
    pub fn snapshot(&self) -> RequestStats {
        RequestStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            peak_concurrent: self.peak_concurrent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqManagerConfig {
    pub max_concurrent_requests: usize,
    pub pool_max_idle_per_host: usize,
    pub tcp_keepalive: Duration,
    pub connect_timeout: Duration,
    /// Upper bound for any single request. Callers apply tighter, per-use
    /// timeouts on top of this.
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for ReqManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 32,
            pool_max_idle_per_host: 64,
            tcp_keepalive: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(60),
            user_agent: concat!("callwright/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ReqManagerConfig {
    /// Tight timeouts for latency-sensitive upstreams such as the shared state
    /// service.
    pub fn low_latency() -> Self {
        Self {
            max_concurrent_requests: 64,
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }
}

pub struct ReqManager {
    client: Client,
    semaphore: Arc<Semaphore>,
    metrics: Arc<RequestMetrics>,
}

/// A slot in the pool. The slot is returned when the guard drops.
pub struct ClientGuard {
    client: Client,
    metrics: Arc<RequestMetrics>,
    _permit: OwnedSemaphorePermit,
}

impl ClientGuard {
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Count one request against the pool, failed or not.
    pub fn record<T, E>(&self, result: &Result<T, E>) {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.metrics.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ReqManager {
    pub fn new(max_concurrent_requests: usize) -> Result<Self, ReqManagerError> {
        Self::with_config(ReqManagerConfig {
            max_concurrent_requests,
            ..ReqManagerConfig::default()
        })
    }

    pub fn with_config(config: ReqManagerConfig) -> Result<Self, ReqManagerError> {
        if config.max_concurrent_requests == 0 || config.max_concurrent_requests > 1000 {
            return Err(ReqManagerError::InvalidConfig(format!(
                "max_concurrent_requests must be within 1..=1000, got {}",
                config.max_concurrent_requests
            )));
        }

        let client = Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .tcp_keepalive(config.tcp_keepalive)
            .tcp_nodelay(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            metrics: Arc::new(RequestMetrics::default()),
        })
    }

    /// Wait for a free slot in the pool.
    pub async fn acquire(&self) -> Result<ClientGuard, ReqManagerError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ReqManagerError::Closed)?;

        let active = self.metrics.active_requests.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics
            .peak_concurrent
            .fetch_max(active, Ordering::Relaxed);

        Ok(ClientGuard {
            client: self.client.clone(),
            metrics: Arc::clone(&self.metrics),
            _permit: permit,
        })
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn stats(&self) -> RequestStats {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_invalid_pool_size() {
        assert!(matches!(
            ReqManager::new(0),
            Err(ReqManagerError::InvalidConfig(_))
        ));
        assert!(matches!(
            ReqManager::new(1001),
            Err(ReqManagerError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_guard_returns_slot_on_drop() {
        let manager = ReqManager::new(2).unwrap();
        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();
        assert_eq!(manager.available_slots(), 0);
        assert_eq!(manager.stats().active_requests, 2);
        assert_eq!(manager.stats().peak_concurrent, 2);

        drop(first);
        assert_eq!(manager.available_slots(), 1);
        drop(second);
        assert_eq!(manager.stats().active_requests, 0);
    }

    #[tokio::test]
    async fn test_record_counts_failures() {
        let manager = ReqManager::new(1).unwrap();
        let guard = manager.acquire().await.unwrap();
        guard.record::<(), &str>(&Ok(()));
        guard.record::<(), &str>(&Err("boom"));

        let stats = manager.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.failed_requests, 1);
    }
}
