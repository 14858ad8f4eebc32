//! End-to-end tests driving the cache through its public surface only

use std::thread;
use std::time::Duration;

use burrow::{CacheConfig, CacheEngine, CacheValue};
use tempfile::tempdir;

#[test]
fn test_values_survive_reopen() {
    let dir = tempdir().unwrap();

    {
        let cache = CacheEngine::open(dir.path()).unwrap();
        cache.set("inline", 42i64, None, None).unwrap();
        cache
            .set("blob", "x".repeat(8192).as_str(), None, None)
            .unwrap();
    }

    // A fresh handle sees everything the previous one committed.
    let cache = CacheEngine::open(dir.path()).unwrap();
    assert_eq!(cache.get("inline").unwrap(), Some(CacheValue::Integer(42)));
    assert_eq!(
        cache.get("blob").unwrap(),
        Some(CacheValue::Text("x".repeat(8192)))
    );
    assert_eq!(cache.len().unwrap(), 2);
}

#[test]
fn test_expired_write_is_absent_and_culled_by_next_write() {
    let dir = tempdir().unwrap();
    let cache = CacheEngine::open(dir.path()).unwrap();

    // Already-elapsed expiry: observably absent from the first read.
    cache.set("a", 1i64, Some(Duration::ZERO), None).unwrap();
    assert_eq!(cache.get("a").unwrap(), None);

    // The next write's cull removes the leftover row.
    cache.set("b", 2i64, None, None).unwrap();
    assert_eq!(cache.len().unwrap(), 1);
    assert_eq!(cache.get("b").unwrap(), Some(CacheValue::Integer(2)));
}

#[test]
fn test_independent_handles_share_one_directory() {
    let dir = tempdir().unwrap();
    let first = CacheEngine::open(dir.path()).unwrap();
    let second = CacheEngine::open(dir.path()).unwrap();

    let writers: Vec<_> = [0i64, 1].into_iter()
        .map(|w| {
            let cache = if w == 0 { first.clone() } else { second.clone() };
            thread::spawn(move || {
                for i in 0..30i64 {
                    let key = format!("w{w}-{i}");
                    cache.set(key.as_str(), i, None, None).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    // Both handles agree on contents and accounting.
    assert_eq!(first.len().unwrap(), 60);
    assert_eq!(second.len().unwrap(), 60);
    assert_eq!(first.total_size().unwrap(), 60 * 8);
    assert_eq!(
        second.get("w0-29").unwrap(),
        Some(CacheValue::Integer(29))
    );
    assert!(first.check(false).unwrap().is_empty());
}

#[test]
fn test_capacity_stays_bounded_under_write_pressure() {
    let dir = tempdir().unwrap();
    let cache = CacheEngine::open_with(
        dir.path(),
        CacheConfig {
            size_limit: 2048,
            inline_threshold: 256,
            ..CacheConfig::default()
        },
    )
    .unwrap();

    for i in 0..50i64 {
        let key = format!("k{i}");
        cache
            .set(key.as_str(), "v".repeat(128).as_str(), None, None)
            .unwrap();
        assert!(cache.total_size().unwrap() <= 2048);
    }

    let stats = cache.stats().unwrap();
    assert!(stats.evictions > 0);
    assert!(cache.check(false).unwrap().is_empty());
}

#[test]
fn test_tag_eviction_leaves_other_groups_alone() {
    let dir = tempdir().unwrap();
    let cache = CacheEngine::open(dir.path()).unwrap();

    for i in 0..5i64 {
        cache.set(i, i, None, Some("session")).unwrap();
    }
    cache.set("config", 1i64, None, Some("static")).unwrap();
    cache.set("plain", 2i64, None, None).unwrap();

    assert_eq!(cache.evict("session").unwrap(), 5);
    assert_eq!(cache.len().unwrap(), 2);
    assert!(cache.get("config").unwrap().is_some());
    assert!(cache.get("plain").unwrap().is_some());
}

#[test]
fn test_repair_recovers_from_deleted_blob_file() {
    let dir = tempdir().unwrap();
    let cache = CacheEngine::open(dir.path()).unwrap();

    cache
        .set("doomed", "x".repeat(4096).as_str(), None, None)
        .unwrap();
    cache.set("fine", 7i64, None, None).unwrap();

    let path = cache.path_of("doomed").unwrap().unwrap();
    std::fs::remove_file(&path).unwrap();

    let issues = cache.check(true).unwrap();
    assert!(!issues.is_empty());

    assert_eq!(cache.get("doomed").unwrap(), None);
    assert_eq!(cache.get("fine").unwrap(), Some(CacheValue::Integer(7)));
    assert!(cache.check(false).unwrap().is_empty());
}

#[test]
fn test_statistics_persist_across_reopen() {
    let dir = tempdir().unwrap();

    {
        let cache = CacheEngine::open_with(
            dir.path(),
            CacheConfig {
                statistics: true,
                ..CacheConfig::default()
            },
        )
        .unwrap();
        cache.set("k", 1i64, None, None).unwrap();
        cache.get("k").unwrap();
        cache.get("absent").unwrap();
    }

    let cache = CacheEngine::open(dir.path()).unwrap();
    let stats = cache.stats().unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[test]
fn test_clear_resets_contents_but_not_configuration() {
    let dir = tempdir().unwrap();
    let cache = CacheEngine::open_with(
        dir.path(),
        CacheConfig {
            cull_limit: 4,
            ..CacheConfig::default()
        },
    )
    .unwrap();

    for i in 0..9i64 {
        cache.set(i, i, None, None).unwrap();
    }
    assert_eq!(cache.clear().unwrap(), 9);
    assert!(cache.is_empty().unwrap());
    assert_eq!(cache.total_size().unwrap(), 0);

    // The persisted configuration is untouched by clear.
    let reopened = CacheEngine::open(dir.path()).unwrap();
    assert_eq!(reopened.config().cull_limit, 4);
}
