use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::debug;

use super::error::{CacheError, Result};
use super::types::{CacheKey, EvictionPolicy};
use crate::config::CacheConfig;

/// Name of the metadata index file inside the cache directory
pub(crate) const DATABASE_NAME: &str = "cache.sqlite3";

/// Immediate retries on SQLITE_BUSY before surfacing the error
const BUSY_RETRIES: usize = 3;

/// Counter rows maintained in the settings table
pub(crate) const COUNT: &str = "count";
pub(crate) const SIZE: &str = "size";
pub(crate) const HITS: &str = "hits";
pub(crate) const MISSES: &str = "misses";
pub(crate) const EVICTIONS: &str = "evictions";

/// One entry row fetched from the index
#[derive(Debug)]
pub(crate) struct EntryRow {
    pub rowid: i64,
    pub expire_time: Option<f64>,
    pub mode: i64,
    pub filename: Option<String>,
    pub inline: SqlValue,
}

/// Field values for an entry about to be written
#[derive(Debug)]
pub(crate) struct NewEntry {
    pub store_time: f64,
    pub expire_time: Option<f64>,
    pub tag: Option<String>,
    pub size: i64,
    pub mode: i64,
    pub filename: Option<String>,
    pub inline: SqlValue,
}

/// Durable, transactional key-to-entry mapping backed by SQLite.
///
/// The connection is opened in WAL mode with a busy timeout; SQLite's
/// native locking serializes conflicting writers across threads and
/// processes. Count and size totals are maintained by triggers so the
/// accounting is transactional with the row changes themselves.
pub(crate) struct MetadataIndex {
    conn: Mutex<Connection>,
}

impl MetadataIndex {
    /// Open or create the index inside `dir` and resolve the effective
    /// configuration: defaults, overlaid with whatever the settings table
    /// already holds, overlaid with `overrides` when given.
    pub(crate) fn open(dir: &Path, overrides: Option<&CacheConfig>) -> Result<(Self, CacheConfig)> {
        let conn = Connection::open(dir.join(DATABASE_NAME))?;

        let defaults = CacheConfig::default();
        let timeout = overrides.map_or(defaults.busy_timeout_ms, |c| c.busy_timeout_ms);
        conn.busy_timeout(Duration::from_millis(timeout))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (key TEXT NOT NULL UNIQUE, value)",
            [],
        )?;

        let mut config = stored_config(&conn, defaults)?;
        if let Some(overrides) = overrides {
            config = overrides.clone();
        }
        persist_config(&conn, &config)?;

        // journal_mode and mmap_size report their new value as a row.
        let _journal: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let _mmap: i64 = conn.query_row(
            &format!("PRAGMA mmap_size = {}", config.sqlite_mmap_size),
            [],
            |row| row.get(0),
        )?;
        conn.execute_batch(&format!(
            "PRAGMA synchronous = NORMAL; PRAGMA cache_size = {};",
            config.sqlite_cache_pages,
        ))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                rowid INTEGER PRIMARY KEY,
                key BLOB NOT NULL,
                kind INTEGER NOT NULL,
                store_time REAL NOT NULL,
                expire_time REAL,
                access_time REAL NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                tag TEXT,
                size INTEGER NOT NULL DEFAULT 0,
                mode INTEGER NOT NULL,
                filename TEXT,
                value BLOB
            );
            CREATE UNIQUE INDEX IF NOT EXISTS entries_key_kind ON entries (key, kind);
            CREATE INDEX IF NOT EXISTS entries_expire_time ON entries (expire_time);
            CREATE INDEX IF NOT EXISTS entries_tag_rowid ON entries (tag, rowid);",
        )?;
        conn.execute_batch(config.eviction_policy.init_index_sql())?;

        // Count and size stay consistent with row changes through triggers,
        // never through a separately cached total that could drift.
        conn.execute_batch(
            "CREATE TRIGGER IF NOT EXISTS entries_count_insert
             AFTER INSERT ON entries FOR EACH ROW BEGIN
             UPDATE settings SET value = value + 1 WHERE key = 'count'; END;

             CREATE TRIGGER IF NOT EXISTS entries_count_delete
             AFTER DELETE ON entries FOR EACH ROW BEGIN
             UPDATE settings SET value = value - 1 WHERE key = 'count'; END;

             CREATE TRIGGER IF NOT EXISTS entries_size_insert
             AFTER INSERT ON entries FOR EACH ROW BEGIN
             UPDATE settings SET value = value + NEW.size WHERE key = 'size'; END;

             CREATE TRIGGER IF NOT EXISTS entries_size_update
             AFTER UPDATE ON entries FOR EACH ROW BEGIN
             UPDATE settings SET value = value + NEW.size - OLD.size
             WHERE key = 'size'; END;

             CREATE TRIGGER IF NOT EXISTS entries_size_delete
             AFTER DELETE ON entries FOR EACH ROW BEGIN
             UPDATE settings SET value = value - OLD.size WHERE key = 'size'; END;",
        )?;

        Ok((
            Self {
                conn: Mutex::new(conn),
            },
            config,
        ))
    }

    /// Lock the connection for autocommit reads and single-statement writes
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run `body` inside an IMMEDIATE transaction. SQLITE_BUSY on begin,
    /// inside the body, or at commit rolls the work back and retries a
    /// bounded number of times before surfacing `Busy`.
    pub(crate) fn write_txn<T>(
        &self,
        mut body: impl FnMut(&Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();

        for attempt in 0.. {
            let result = Self::attempt_txn(&mut conn, &mut body);
            match result {
                Err(CacheError::Busy) if attempt < BUSY_RETRIES => {
                    debug!(attempt, "retrying busy transaction");
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => return other,
            }
        }
        unreachable!()
    }

    fn attempt_txn<T>(
        conn: &mut Connection,
        body: &mut impl FnMut(&Transaction) -> Result<T>,
    ) -> Result<T> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = body(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

// Settings -------------------------------------------------------------

const POLICY_KEY: &str = "eviction_policy";

fn stored_config(conn: &Connection, defaults: CacheConfig) -> Result<CacheConfig> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, SqlValue>(1)?))
    })?;

    let mut stored: HashMap<String, SqlValue> = HashMap::new();
    for row in rows {
        let (key, value) = row?;
        stored.insert(key, value);
    }

    let as_u64 = |name: &str, fallback: u64| match stored.get(name) {
        Some(SqlValue::Integer(i)) if *i >= 0 => *i as u64,
        _ => fallback,
    };
    let as_bool = |name: &str, fallback: bool| match stored.get(name) {
        Some(SqlValue::Integer(i)) => *i != 0,
        _ => fallback,
    };
    let policy = match stored.get(POLICY_KEY) {
        Some(SqlValue::Text(name)) => {
            EvictionPolicy::parse(name).unwrap_or(defaults.eviction_policy)
        }
        _ => defaults.eviction_policy,
    };

    Ok(CacheConfig {
        size_limit: as_u64("size_limit", defaults.size_limit),
        eviction_policy: policy,
        cull_limit: as_u64("cull_limit", defaults.cull_limit as u64) as usize,
        inline_threshold: as_u64("inline_threshold", defaults.inline_threshold as u64) as usize,
        statistics: as_bool("statistics", defaults.statistics),
        track_all_reads: as_bool("track_all_reads", defaults.track_all_reads),
        busy_timeout_ms: as_u64("busy_timeout_ms", defaults.busy_timeout_ms),
        sqlite_cache_pages: as_u64("sqlite_cache_pages", defaults.sqlite_cache_pages),
        sqlite_mmap_size: as_u64("sqlite_mmap_size", defaults.sqlite_mmap_size),
    })
}

fn persist_config(conn: &Connection, config: &CacheConfig) -> Result<()> {
    let put = "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)";
    conn.execute(put, params![POLICY_KEY, config.eviction_policy.as_str()])?;
    conn.execute(put, params!["size_limit", config.size_limit as i64])?;
    conn.execute(put, params!["cull_limit", config.cull_limit as i64])?;
    conn.execute(
        put,
        params!["inline_threshold", config.inline_threshold as i64],
    )?;
    conn.execute(put, params!["statistics", config.statistics as i64])?;
    conn.execute(
        put,
        params!["track_all_reads", config.track_all_reads as i64],
    )?;
    conn.execute(put, params!["busy_timeout_ms", config.busy_timeout_ms as i64])?;
    conn.execute(
        put,
        params!["sqlite_cache_pages", config.sqlite_cache_pages as i64],
    )?;
    conn.execute(
        put,
        params!["sqlite_mmap_size", config.sqlite_mmap_size as i64],
    )?;

    // Counters keep their accumulated values across opens.
    for counter in [COUNT, SIZE, HITS, MISSES, EVICTIONS] {
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, 0)",
            params![counter],
        )?;
    }
    Ok(())
}

pub(crate) fn read_counter(conn: &Connection, name: &str) -> Result<i64> {
    let value = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(value.unwrap_or(0))
}

pub(crate) fn set_counter(conn: &Connection, name: &str, value: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
        params![name, value],
    )?;
    Ok(())
}

pub(crate) fn bump_counter(conn: &Connection, name: &str, delta: i64) -> Result<()> {
    conn.execute(
        "UPDATE settings SET value = value + ?1 WHERE key = ?2",
        params![delta, name],
    )?;
    Ok(())
}

/// Sum of live entries' sizes, maintained transactionally by triggers
pub(crate) fn total_size(conn: &Connection) -> Result<u64> {
    Ok(read_counter(conn, SIZE)?.max(0) as u64)
}

// Entry rows -----------------------------------------------------------

pub(crate) fn lookup(conn: &Connection, key: &CacheKey) -> Result<Option<EntryRow>> {
    let row = conn
        .query_row(
            "SELECT rowid, expire_time, mode, filename, value
             FROM entries WHERE key = ?1 AND kind = ?2",
            params![key.to_sql(), key.kind()],
            |row| {
                Ok(EntryRow {
                    rowid: row.get(0)?,
                    expire_time: row.get(1)?,
                    mode: row.get(2)?,
                    filename: row.get(3)?,
                    inline: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Insert or atomically replace the entry for `key`, returning the
/// replaced row's blob filename so the caller can reclaim it after commit.
pub(crate) fn upsert(conn: &Connection, key: &CacheKey, entry: &NewEntry) -> Result<Option<String>> {
    let existing = conn
        .query_row(
            "SELECT rowid, filename FROM entries WHERE key = ?1 AND kind = ?2",
            params![key.to_sql(), key.kind()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?;

    match existing {
        Some((rowid, old_filename)) => {
            conn.execute(
                "UPDATE entries SET
                     store_time = ?1, expire_time = ?2, access_time = ?1,
                     access_count = 0, tag = ?3, size = ?4, mode = ?5,
                     filename = ?6, value = ?7
                 WHERE rowid = ?8",
                params![
                    entry.store_time,
                    entry.expire_time,
                    entry.tag,
                    entry.size,
                    entry.mode,
                    entry.filename,
                    entry.inline,
                    rowid,
                ],
            )?;
            Ok(old_filename)
        }
        None => {
            conn.execute(
                "INSERT INTO entries
                     (key, kind, store_time, expire_time, access_time,
                      access_count, tag, size, mode, filename, value)
                 VALUES (?1, ?2, ?3, ?4, ?3, 0, ?5, ?6, ?7, ?8, ?9)",
                params![
                    key.to_sql(),
                    key.kind(),
                    entry.store_time,
                    entry.expire_time,
                    entry.tag,
                    entry.size,
                    entry.mode,
                    entry.filename,
                    entry.inline,
                ],
            )?;
            Ok(None)
        }
    }
}

/// Delete a row by id, returning whether it was still present
pub(crate) fn delete_rowid(conn: &Connection, rowid: i64) -> Result<bool> {
    let changed = conn.execute("DELETE FROM entries WHERE rowid = ?1", params![rowid])?;
    Ok(changed > 0)
}

/// Remove at most `limit` expired rows, oldest-expiring first.
/// Returns the number removed and the blob filenames they referenced.
pub(crate) fn cull_expired(
    conn: &Connection,
    now: f64,
    limit: usize,
) -> Result<(usize, Vec<String>)> {
    if limit == 0 {
        return Ok((0, Vec::new()));
    }

    let mut stmt = conn.prepare(
        "SELECT rowid, filename FROM entries
         WHERE expire_time IS NOT NULL AND expire_time < ?1
         ORDER BY expire_time LIMIT ?2",
    )?;
    let victims = stmt
        .query_map(params![now, limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut filenames = Vec::new();
    let mut removed = 0;
    for (rowid, filename) in victims {
        if delete_rowid(conn, rowid)? {
            removed += 1;
            filenames.extend(filename);
        }
    }
    Ok((removed, filenames))
}

/// Evict committed entries in policy order until the size total is at or
/// below `size_limit` or no entries remain. Victims are selected in
/// batches of `batch` rows so each query stays bounded.
pub(crate) fn evict_to_limit(
    conn: &Connection,
    policy: EvictionPolicy,
    size_limit: u64,
    batch: usize,
) -> Result<(usize, Vec<String>)> {
    let select = format!(
        "SELECT rowid, filename FROM entries ORDER BY {} LIMIT ?1",
        policy.order_clause()
    );

    let mut filenames = Vec::new();
    let mut evicted = 0;
    while total_size(conn)? > size_limit {
        let victims = {
            let mut stmt = conn.prepare(&select)?;
            stmt.query_map(params![batch.max(1) as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
        };
        if victims.is_empty() {
            break;
        }

        for (rowid, filename) in victims {
            if delete_rowid(conn, rowid)? {
                evicted += 1;
                filenames.extend(filename);
            }
            if total_size(conn)? <= size_limit {
                break;
            }
        }
    }
    Ok((evicted, filenames))
}

/// Delete up to `limit` rows carrying `tag`.
/// Returns the number removed and their blob filenames.
pub(crate) fn take_tagged(
    conn: &Connection,
    tag: &str,
    limit: usize,
) -> Result<(usize, Vec<String>)> {
    let victims = {
        let mut stmt = conn.prepare(
            "SELECT rowid, filename FROM entries
             WHERE tag = ?1 ORDER BY rowid LIMIT ?2",
        )?;
        stmt.query_map(params![tag, limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut filenames = Vec::new();
    let mut removed = 0;
    for (rowid, filename) in victims {
        if delete_rowid(conn, rowid)? {
            removed += 1;
            filenames.extend(filename);
        }
    }
    Ok((removed, filenames))
}

/// Delete up to `limit` rows regardless of tag, for `clear`
pub(crate) fn take_any(conn: &Connection, limit: usize) -> Result<(usize, Vec<String>)> {
    let victims = {
        let mut stmt =
            conn.prepare("SELECT rowid, filename FROM entries ORDER BY rowid LIMIT ?1")?;
        stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut filenames = Vec::new();
    let mut removed = 0;
    for (rowid, filename) in victims {
        if delete_rowid(conn, rowid)? {
            removed += 1;
            filenames.extend(filename);
        }
    }
    Ok((removed, filenames))
}

/// Update access statistics for a read, per policy or unconditionally
/// when every read is tracked
pub(crate) fn touch_access(
    conn: &Connection,
    rowid: i64,
    policy: EvictionPolicy,
    track_all: bool,
    now: f64,
) -> Result<()> {
    if track_all {
        conn.execute(
            "UPDATE entries SET access_time = ?1, access_count = access_count + 1
             WHERE rowid = ?2",
            params![now, rowid],
        )?;
        return Ok(());
    }

    match policy {
        EvictionPolicy::LeastRecentlyStored => {}
        EvictionPolicy::LeastRecentlyUsed => {
            conn.execute(
                "UPDATE entries SET access_time = ?1 WHERE rowid = ?2",
                params![now, rowid],
            )?;
        }
        EvictionPolicy::LeastFrequentlyUsed => {
            conn.execute(
                "UPDATE entries SET access_count = access_count + 1 WHERE rowid = ?1",
                params![rowid],
            )?;
        }
    }
    Ok(())
}

/// Replace the expiry of a live entry without rewriting its value.
/// Returns false when the key is absent or already expired.
pub(crate) fn touch_expiry(
    conn: &Connection,
    key: &CacheKey,
    expire_time: Option<f64>,
    now: f64,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE entries SET expire_time = ?1
         WHERE key = ?2 AND kind = ?3
           AND (expire_time IS NULL OR expire_time > ?4)",
        params![expire_time, key.to_sql(), key.kind(), now],
    )?;
    Ok(changed > 0)
}

// Consistency-check queries --------------------------------------------

pub(crate) fn row_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?)
}

pub(crate) fn sum_size(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(size), 0) FROM entries",
        [],
        |row| row.get(0),
    )?)
}

/// Rows referencing blob files, chunked by rowid for bounded scans
pub(crate) fn file_rows_after(
    conn: &Connection,
    after_rowid: i64,
    limit: usize,
) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare(
        "SELECT rowid, filename FROM entries
         WHERE rowid > ?1 AND filename IS NOT NULL
         ORDER BY rowid LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![after_rowid, limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn integrity_check(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CacheValue, unix_now};
    use tempfile::tempdir;

    fn entry_for(value: &CacheValue) -> NewEntry {
        NewEntry {
            store_time: unix_now(),
            expire_time: None,
            tag: None,
            size: value.payload_size() as i64,
            mode: value.mode(),
            filename: None,
            inline: value.to_inline_sql(),
        }
    }

    #[test]
    fn test_settings_persist_across_opens() {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            eviction_policy: EvictionPolicy::LeastFrequentlyUsed,
            cull_limit: 4,
            ..CacheConfig::default()
        };

        {
            let _ = MetadataIndex::open(dir.path(), Some(&config)).unwrap();
        }

        // A plain open picks up what the directory already carries.
        let (_, effective) = MetadataIndex::open(dir.path(), None).unwrap();
        assert_eq!(
            effective.eviction_policy,
            EvictionPolicy::LeastFrequentlyUsed
        );
        assert_eq!(effective.cull_limit, 4);
    }

    #[test]
    fn test_triggers_maintain_count_and_size() {
        let dir = tempdir().unwrap();
        let (index, _) = MetadataIndex::open(dir.path(), None).unwrap();
        let conn = index.lock();

        let value = CacheValue::Text("ten chars!".to_string());
        upsert(&conn, &CacheKey::from("a"), &entry_for(&value)).unwrap();
        upsert(&conn, &CacheKey::from("b"), &entry_for(&value)).unwrap();
        assert_eq!(read_counter(&conn, COUNT).unwrap(), 2);
        assert_eq!(total_size(&conn).unwrap(), 20);

        // Replacing a key adjusts size through the update trigger.
        let smaller = CacheValue::Text("tiny".to_string());
        upsert(&conn, &CacheKey::from("a"), &entry_for(&smaller)).unwrap();
        assert_eq!(read_counter(&conn, COUNT).unwrap(), 2);
        assert_eq!(total_size(&conn).unwrap(), 14);

        let row = lookup(&conn, &CacheKey::from("b")).unwrap().unwrap();
        assert!(delete_rowid(&conn, row.rowid).unwrap());
        assert_eq!(read_counter(&conn, COUNT).unwrap(), 1);
        assert_eq!(total_size(&conn).unwrap(), 4);
    }

    #[test]
    fn test_cull_is_bounded_and_ordered() {
        let dir = tempdir().unwrap();
        let (index, _) = MetadataIndex::open(dir.path(), None).unwrap();
        let conn = index.lock();

        let now = unix_now();
        for i in 0..20i64 {
            let mut entry = entry_for(&CacheValue::Integer(i));
            entry.expire_time = Some(now - 100.0 + i as f64);
            upsert(&conn, &CacheKey::Integer(i), &entry).unwrap();
        }

        let (removed, files) = cull_expired(&conn, now, 5).unwrap();
        assert_eq!(removed, 5);
        assert!(files.is_empty());
        assert_eq!(row_count(&conn).unwrap(), 15);

        // Oldest-expiring rows go first.
        assert!(lookup(&conn, &CacheKey::Integer(0)).unwrap().is_none());
        assert!(lookup(&conn, &CacheKey::Integer(4)).unwrap().is_none());
        assert!(lookup(&conn, &CacheKey::Integer(5)).unwrap().is_some());
    }

    #[test]
    fn test_int_and_text_keys_are_distinct_rows() {
        let dir = tempdir().unwrap();
        let (index, _) = MetadataIndex::open(dir.path(), None).unwrap();
        let conn = index.lock();

        upsert(
            &conn,
            &CacheKey::Integer(1),
            &entry_for(&CacheValue::Text("int".to_string())),
        )
        .unwrap();
        upsert(
            &conn,
            &CacheKey::from("1"),
            &entry_for(&CacheValue::Text("text".to_string())),
        )
        .unwrap();

        assert_eq!(row_count(&conn).unwrap(), 2);
        let by_int = lookup(&conn, &CacheKey::Integer(1)).unwrap().unwrap();
        let by_text = lookup(&conn, &CacheKey::from("1")).unwrap().unwrap();
        assert_ne!(by_int.rowid, by_text.rowid);
    }
}
