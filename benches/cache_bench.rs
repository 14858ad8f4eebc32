use burrow::{CacheConfig, CacheEngine};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tempfile::tempdir;

fn bench_set_inline(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let cache = CacheEngine::open(dir.path()).unwrap();

    c.bench_function("set_inline", |b| {
        b.iter(|| {
            let key = black_box("bench_key");
            let value = black_box("bench_value");
            cache.set(key, value, None, None).unwrap();
        });
    });
}

fn bench_get_inline(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let cache = CacheEngine::open(dir.path()).unwrap();
    cache.set("bench_key", "bench_value", None, None).unwrap();

    c.bench_function("get_inline", |b| {
        b.iter(|| {
            let key = black_box("bench_key");
            cache.get(key).unwrap();
        });
    });
}

fn bench_set_blob(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let cache = CacheEngine::open(dir.path()).unwrap();
    let payload = vec![7u8; 64 * 1024];

    c.bench_function("set_blob_64k", |b| {
        b.iter(|| {
            let key = black_box("blob_key");
            cache.set(key, payload.clone(), None, None).unwrap();
        });
    });
}

fn bench_get_blob(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let cache = CacheEngine::open(dir.path()).unwrap();
    cache
        .set("blob_key", vec![7u8; 64 * 1024], None, None)
        .unwrap();

    c.bench_function("get_blob_64k", |b| {
        b.iter(|| {
            let key = black_box("blob_key");
            cache.get(key).unwrap();
        });
    });
}

fn bench_set_with_eviction(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let cache = CacheEngine::open_with(
        dir.path(),
        CacheConfig {
            size_limit: 64 * 1024,
            ..CacheConfig::default()
        },
    )
    .unwrap();

    let mut i = 0u64;
    c.bench_function("set_under_capacity_pressure", |b| {
        b.iter(|| {
            i += 1;
            let key = format!("key{i}");
            cache.set(key.as_str(), "x".repeat(512).as_str(), None, None).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_set_inline,
    bench_get_inline,
    bench_set_blob,
    bench_get_blob,
    bench_set_with_eviction
);
criterion_main!(benches);
