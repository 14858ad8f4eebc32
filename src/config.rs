use serde::{Deserialize, Serialize};

use crate::core::EvictionPolicy;

/// Cache engine configuration
///
/// The effective configuration is persisted in the settings table of the
/// metadata index, so independent processes opening the same directory
/// agree on policy. `CacheEngine::open` uses whatever the directory already
/// carries; `CacheEngine::open_with` writes these values over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum total payload size in bytes before eviction kicks in
    pub size_limit: u64,
    /// Ordering rule used to pick eviction victims
    pub eviction_policy: EvictionPolicy,
    /// Maximum expired rows removed per set/delete (intended range 2-10)
    pub cull_limit: usize,
    /// Byte size below which values are stored inline in the index
    pub inline_threshold: usize,
    /// Toggle hit/miss counters
    pub statistics: bool,
    /// Update access statistics on every read, not only policy-relevant ones
    pub track_all_reads: bool,
    /// SQLite busy handler timeout in milliseconds
    pub busy_timeout_ms: u64,
    /// SQLite page-cache size in pages
    pub sqlite_cache_pages: u64,
    /// SQLite mmap window in bytes
    pub sqlite_mmap_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_limit: 1 << 30, // 1gb
            eviction_policy: EvictionPolicy::LeastRecentlyStored,
            cull_limit: 10,
            inline_threshold: 1 << 10, // 1kb
            statistics: false,
            track_all_reads: false,
            busy_timeout_ms: 60_000,
            sqlite_cache_pages: 1 << 13,
            sqlite_mmap_size: 1 << 27, // 128mb
        }
    }
}
