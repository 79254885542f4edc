//! Cache for transition decisions and synthesized audio.

mod filesystem;
pub mod store;

pub use filesystem::FilesystemCacheBackend;
pub use store::{
    CacheBackend, CacheConfig, CacheError, CacheMetrics, CacheResult, CacheStats, CacheStore,
    MemoryCacheBackend,
};
