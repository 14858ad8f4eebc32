use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use tracing::{debug, info, warn};

use super::blobs::BlobStore;
use super::check;
use super::error::{CacheError, Result};
use super::index::{self, MetadataIndex, NewEntry};
use super::stampede::{Acquired, StampedeBarrier};
use super::types::{CacheKey, CacheStats, CacheValue, unix_now};
use crate::config::CacheConfig;

/// Handle to an open disk cache.
///
/// Owns the metadata index connection, the blob store root, and the
/// process-local stampede barrier. The handle is cheap to clone and safe
/// to share across threads; any number of handles in any number of
/// processes may target the same directory.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    index: MetadataIndex,
    blobs: BlobStore,
    barrier: StampedeBarrier,
    config: CacheConfig,
}

impl CacheEngine {
    /// Open the cache at `dir`, creating it if needed, with whatever
    /// configuration the directory already carries (or defaults).
    pub fn open(dir: impl AsRef<Path>) -> Result<CacheEngine> {
        Self::open_inner(dir.as_ref(), None)
    }

    /// Open the cache at `dir`, persisting `config` as its configuration
    pub fn open_with(dir: impl AsRef<Path>, config: CacheConfig) -> Result<CacheEngine> {
        Self::open_inner(dir.as_ref(), Some(config))
    }

    fn open_inner(dir: &Path, overrides: Option<CacheConfig>) -> Result<CacheEngine> {
        fs::create_dir_all(dir)?;
        let (index, config) = MetadataIndex::open(dir, overrides.as_ref())?;
        info!(
            directory = %dir.display(),
            policy = config.eviction_policy.as_str(),
            size_limit = config.size_limit,
            "opened cache"
        );

        Ok(CacheEngine {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                blobs: BlobStore::new(dir),
                barrier: StampedeBarrier::new(),
                index,
                config,
            }),
        })
    }

    /// Effective configuration, as persisted in the settings table
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Directory holding the index and blob files
    pub fn directory(&self) -> &Path {
        &self.inner.dir
    }

    /// Store `value` under `key`, atomically replacing any prior entry.
    ///
    /// A `ttl` of zero (or any already-elapsed expiry) leaves the entry
    /// immediately observably absent; its row stays behind for the culler.
    /// The write also culls a bounded number of expired entries and, when
    /// the size limit is exceeded, evicts entries in policy order.
    pub fn set(
        &self,
        key: impl Into<CacheKey>,
        value: impl Into<CacheValue>,
        ttl: Option<Duration>,
        tag: Option<&str>,
    ) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let config = &self.inner.config;

        let now = unix_now();
        let expire_time = ttl.map(|t| now + t.as_secs_f64());
        let size = value.payload_size();

        let use_file = match &value {
            CacheValue::Integer(_) | CacheValue::Float(_) => false,
            CacheValue::Text(_) | CacheValue::Bytes(_) => {
                size >= config.inline_threshold as u64
            }
        };
        let filename = if use_file {
            Some(self.inner.blobs.store(value.to_file_bytes())?)
        } else {
            None
        };
        let inline = if use_file {
            SqlValue::Null
        } else {
            value.to_inline_sql()
        };
        let tag = tag.map(str::to_string);

        debug!(key = ?key, size, blob = use_file, ttl = ?ttl, "set");

        let committed = self.inner.index.write_txn(|tx| {
            let entry = NewEntry {
                store_time: now,
                expire_time,
                tag: tag.clone(),
                size: size as i64,
                mode: value.mode(),
                filename: filename.clone(),
                inline: inline.clone(),
            };
            let replaced = index::upsert(tx, &key, &entry)?;

            let (_, mut stale_files) = index::cull_expired(tx, now, config.cull_limit)?;

            if index::total_size(tx)? > config.size_limit {
                let (evicted, evicted_files) = index::evict_to_limit(
                    tx,
                    config.eviction_policy,
                    config.size_limit,
                    config.cull_limit.max(1),
                )?;
                if evicted > 0 {
                    index::bump_counter(tx, index::EVICTIONS, evicted as i64)?;
                }
                stale_files.extend(evicted_files);
            }

            stale_files.extend(replaced);
            Ok(stale_files)
        });

        match committed {
            Ok(stale_files) => {
                self.inner.blobs.remove_all(&stale_files);
                Ok(())
            }
            Err(err) => {
                // The fresh blob was never published; reclaim it.
                if let Some(filename) = &filename {
                    self.inner.blobs.remove_all(std::slice::from_ref(filename));
                }
                Err(err)
            }
        }
    }

    /// Fetch the value stored under `key`.
    ///
    /// An expired-but-not-yet-culled row is a miss and is deleted on the
    /// spot, so expiry correctness never depends on the culler having run.
    /// A missing blob file (racing delete) is likewise a miss.
    pub fn get(&self, key: impl Into<CacheKey>) -> Result<Option<CacheValue>> {
        let key = key.into();
        let config = &self.inner.config;
        let now = unix_now();

        let conn = self.inner.index.lock();
        let Some(row) = index::lookup(&conn, &key)? else {
            self.record_miss(&conn)?;
            debug!(key = ?key, "miss");
            return Ok(None);
        };

        if row.expire_time.is_some_and(|t| t < now) {
            index::delete_rowid(&conn, row.rowid)?;
            self.record_miss(&conn)?;
            drop(conn);
            if let Some(filename) = &row.filename {
                self.inner.blobs.remove_all(std::slice::from_ref(filename));
            }
            debug!(key = ?key, "expired");
            return Ok(None);
        }

        let value = match &row.filename {
            Some(filename) => match self.inner.blobs.load(filename) {
                Ok(bytes) => CacheValue::from_file_bytes(row.mode, bytes)?,
                Err(CacheError::NotFound) => {
                    // Entry was deleted out from under us; clean up the row.
                    warn!(key = ?key, file = %filename, "blob file missing, treating as miss");
                    index::delete_rowid(&conn, row.rowid)?;
                    self.record_miss(&conn)?;
                    return Ok(None);
                }
                Err(err) => return Err(err),
            },
            None => CacheValue::from_inline(row.mode, row.inline)?,
        };

        if config.statistics {
            index::bump_counter(&conn, index::HITS, 1)?;
        }
        index::touch_access(
            &conn,
            row.rowid,
            config.eviction_policy,
            config.track_all_reads,
            now,
        )?;

        debug!(key = ?key, "hit");
        Ok(Some(value))
    }

    fn record_miss(&self, conn: &rusqlite::Connection) -> Result<()> {
        if self.inner.config.statistics {
            index::bump_counter(conn, index::MISSES, 1)?;
        }
        Ok(())
    }

    /// Delete the entry under `key`, returning whether a row was removed.
    /// Also culls a bounded number of expired entries.
    pub fn delete(&self, key: impl Into<CacheKey>) -> Result<bool> {
        let key = key.into();
        let config = &self.inner.config;
        let now = unix_now();
        debug!(key = ?key, "delete");

        let (found, stale_files) = self.inner.index.write_txn(|tx| {
            let mut stale_files = Vec::new();
            let found = match index::lookup(tx, &key)? {
                Some(row) => {
                    let deleted = index::delete_rowid(tx, row.rowid)?;
                    stale_files.extend(row.filename);
                    deleted
                }
                None => false,
            };
            let (_, culled) = index::cull_expired(tx, now, config.cull_limit)?;
            stale_files.extend(culled);
            Ok((found, stale_files))
        })?;

        self.inner.blobs.remove_all(&stale_files);
        Ok(found)
    }

    /// Replace the expiry of a live entry without rewriting its value.
    /// `None` makes the entry never expire. Returns false when the key is
    /// absent or already expired.
    pub fn touch(&self, key: impl Into<CacheKey>, ttl: Option<Duration>) -> Result<bool> {
        let key = key.into();
        let now = unix_now();
        let expire_time = ttl.map(|t| now + t.as_secs_f64());

        let conn = self.inner.index.lock();
        index::touch_expiry(&conn, &key, expire_time, now)
    }

    /// Remove every expired entry, in bounded batches, until none remain.
    /// Returns the number removed.
    pub fn expire(&self) -> Result<usize> {
        let batch = self.inner.config.cull_limit.max(1);
        let now = unix_now();
        let mut total = 0;

        loop {
            let (removed, stale_files) = self
                .inner
                .index
                .write_txn(|tx| index::cull_expired(tx, now, batch))?;
            self.inner.blobs.remove_all(&stale_files);
            total += removed;
            if removed < batch {
                return Ok(total);
            }
        }
    }

    /// Remove all entries carrying `tag`, returning the count removed
    pub fn evict(&self, tag: &str) -> Result<usize> {
        let batch = self.inner.config.cull_limit.max(1);
        let mut total = 0;

        loop {
            let (removed, stale_files) = self
                .inner
                .index
                .write_txn(|tx| index::take_tagged(tx, tag, batch))?;
            self.inner.blobs.remove_all(&stale_files);
            total += removed;
            if removed < batch {
                debug!(tag, removed = total, "evicted tag");
                return Ok(total);
            }
        }
    }

    /// Remove all entries, returning the count removed
    pub fn clear(&self) -> Result<usize> {
        let batch = self.inner.config.cull_limit.max(1);
        let mut total = 0;

        loop {
            let (removed, stale_files) = self
                .inner
                .index
                .write_txn(|tx| index::take_any(tx, batch))?;
            self.inner.blobs.remove_all(&stale_files);
            total += removed;
            if removed < batch {
                info!(removed = total, "cleared cache");
                return Ok(total);
            }
        }
    }

    /// Read-through convenience around the stampede barrier.
    ///
    /// A hit returns immediately. On a miss, exactly one concurrent caller
    /// computes the value, stores it through the normal `set` path, and
    /// releases the barrier; the others block (up to `wait`) and re-read
    /// the populated entry. If the leader's compute fails, its error
    /// propagates to that caller and one of the waiters takes over.
    pub fn get_or_compute(
        &self,
        key: impl Into<CacheKey>,
        ttl: Option<Duration>,
        tag: Option<&str>,
        wait: Option<Duration>,
        mut compute: impl FnMut() -> Result<CacheValue>,
    ) -> Result<CacheValue> {
        let key = key.into();

        loop {
            if let Some(value) = self.get(key.clone())? {
                return Ok(value);
            }

            match self.inner.barrier.acquire(&key, wait)? {
                Acquired::Leader(guard) => {
                    // Another leader may have stored the value between our
                    // miss and the acquisition.
                    if let Some(value) = self.get(key.clone())? {
                        guard.complete();
                        return Ok(value);
                    }
                    let value = compute()?;
                    self.set(key.clone(), value.clone(), ttl, tag)?;
                    guard.complete();
                    return Ok(value);
                }
                Acquired::Follower => continue,
            }
        }
    }

    /// Resolve a key's backing file path if its value is blob-stored,
    /// for zero-copy reads. Inline, absent, and expired entries yield None.
    pub fn path_of(&self, key: impl Into<CacheKey>) -> Result<Option<PathBuf>> {
        let key = key.into();
        let now = unix_now();

        let conn = self.inner.index.lock();
        let Some(row) = index::lookup(&conn, &key)? else {
            return Ok(None);
        };
        if row.expire_time.is_some_and(|t| t < now) {
            return Ok(None);
        }
        Ok(row.filename.map(|f| self.inner.blobs.path(&f)))
    }

    /// Hit/miss/eviction counters plus entry count and size total
    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.inner.index.lock();
        Ok(CacheStats {
            entries: index::read_counter(&conn, index::COUNT)?.max(0) as u64,
            total_size: index::total_size(&conn)?,
            hits: index::read_counter(&conn, index::HITS)?.max(0) as u64,
            misses: index::read_counter(&conn, index::MISSES)?.max(0) as u64,
            evictions: index::read_counter(&conn, index::EVICTIONS)?.max(0) as u64,
        })
    }

    /// Reset the hit/miss/eviction counters
    pub fn reset_stats(&self) -> Result<()> {
        let conn = self.inner.index.lock();
        for counter in [index::HITS, index::MISSES, index::EVICTIONS] {
            index::set_counter(&conn, counter, 0)?;
        }
        Ok(())
    }

    /// Number of entries physically present, including expired rows the
    /// culler has not reached yet
    pub fn len(&self) -> Result<u64> {
        let conn = self.inner.index.lock();
        Ok(index::read_counter(&conn, index::COUNT)?.max(0) as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Sum of live entries' payload sizes in bytes
    pub fn total_size(&self) -> Result<u64> {
        let conn = self.inner.index.lock();
        index::total_size(&conn)
    }

    /// Scan index and file system for inconsistencies: orphaned blob
    /// files, rows pointing at missing files, drifted count/size totals.
    /// With `fix` set, repairs what it finds. Returns the findings.
    pub fn check(&self, fix: bool) -> Result<Vec<String>> {
        check::run(&self.inner.index, &self.inner.blobs, &self.inner.dir, fix)
    }
}
