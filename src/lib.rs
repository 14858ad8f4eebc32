//! Disk-resident cache engine.
//!
//! All entry metadata lives in a single SQLite index inside the cache
//! directory; values are stored inline for small payloads and as
//! atomically-renamed blob files past a size threshold. Expired entries
//! are removed in small bounded batches amortized across writes, capacity
//! pressure is resolved by one of three eviction policies, and a per-key
//! stampede barrier keeps concurrent misses from recomputing the same
//! value. Any number of handles, across threads and processes, may share
//! one cache directory.

pub mod config;
pub mod core;

pub use config::CacheConfig;
pub use core::{
    Acquired, CacheEngine, CacheError, CacheKey, CacheStats, CacheValue, EvictionPolicy,
    LeaderGuard, Result, StampedeBarrier,
};
