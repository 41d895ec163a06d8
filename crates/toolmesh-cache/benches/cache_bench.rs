// Criterion benchmarks for toolmesh-cache
//
// Run benchmarks with:
//   cargo bench -p toolmesh-cache

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{Map, Value};
use std::time::Duration;
use toolmesh_cache::{CacheKey, MemoryCache, ResultCache};
use toolmesh_common::{ToolContent, ToolResult};

fn key(n: usize) -> CacheKey {
    let mut args = Map::new();
    args.insert("n".to_string(), Value::from(n));
    CacheKey::new("echo", "bench", &args)
}

fn result() -> ToolResult {
    ToolResult::success("echo", "bench", vec![ToolContent::text("payload")], Duration::ZERO)
}

fn bench_key_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_key");

    for arg_count in [1, 5, 20].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(arg_count), arg_count, |b, &count| {
            let mut args = Map::new();
            for i in 0..count {
                args.insert(format!("arg{}", i), Value::from(format!("value {}", i)));
            }
            b.iter(|| CacheKey::new("web_search", "search-1", black_box(&args)));
        });
    }

    group.finish();
}

fn bench_get_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("memory_cache_get");

    for size in [100, 1_000, 10_000].iter() {
        let cache = MemoryCache::new("bench", *size, Duration::from_secs(300));
        rt.block_on(async {
            for i in 0..*size {
                cache.set(&key(i), result(), Duration::from_secs(3600)).await.unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut i = 0;
            b.to_async(&rt).iter(|| {
                i = (i + 1) % size;
                let k = key(i);
                let cache = &cache;
                async move { black_box(cache.get(&k).await.unwrap()) }
            });
        });
    }

    group.finish();
}

fn bench_set_with_eviction(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = MemoryCache::new("bench", 1_000, Duration::from_secs(300));

    c.bench_function("memory_cache_set_evicting", |b| {
        let mut i = 0;
        b.to_async(&rt).iter(|| {
            i += 1;
            let k = key(i);
            let cache = &cache;
            async move { cache.set(&k, result(), Duration::from_secs(3600)).await.unwrap() }
        });
    });
}

criterion_group!(benches, bench_key_generation, bench_get_hit, bench_set_with_eviction);
criterion_main!(benches);
