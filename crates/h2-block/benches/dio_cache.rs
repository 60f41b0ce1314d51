#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use h2_block::{DioCache, DioConfig, MemByteDevice};
use std::sync::Arc;

const PBUF: u64 = 65536;

fn make_cache(blocks: u64, config: DioConfig) -> DioCache {
    let len = usize::try_from(blocks * PBUF).expect("len");
    let dev = Arc::new(MemByteDevice::new(vec![0xA5_u8; len]));
    DioCache::new(dev, config)
}

fn bench_getblk_hit(c: &mut Criterion) {
    let cache = make_cache(16, DioConfig::default());
    let pinned = cache.getblk(3, 0, 1024).expect("pin");
    c.bench_function("dio_getblk_hit", |b| {
        b.iter(|| {
            let dio = cache.getblk(3, black_box(4096), 4096).expect("getblk");
            black_box(dio.data(4096, 4096).expect("data")[0]);
        });
    });
    drop(pinned);
}

fn bench_getblk_miss(c: &mut Criterion) {
    let cache = make_cache(256, DioConfig::default());
    let mut block = 0_u64;
    c.bench_function("dio_getblk_miss", |b| {
        b.iter(|| {
            block = (block + 1) % 256;
            let dio = cache.getblk(3, black_box(block * PBUF), 16384).expect("getblk");
            black_box(dio.buffer().len());
        });
    });
}

fn bench_sequential_readahead(c: &mut Criterion) {
    let config = DioConfig {
        soft_limit: 128,
        readahead: 4,
    };
    let cache = make_cache(256, config);
    let mut block = 0_u64;
    c.bench_function("dio_sequential_readahead4", |b| {
        b.iter(|| {
            block = (block + 1) % 256;
            let dio = cache.getblk(3, black_box(block * PBUF), 65536).expect("getblk");
            black_box(dio.buffer()[0]);
        });
    });
}

fn bench_eviction_pressure(c: &mut Criterion) {
    let config = DioConfig {
        soft_limit: 32,
        readahead: 0,
    };
    let cache = make_cache(1024, config);
    let mut block = 0_u64;
    c.bench_function("dio_eviction_pressure", |b| {
        b.iter(|| {
            block = (block * 7 + 13) % 1024;
            drop(cache.getblk(3, black_box(block * PBUF), 1024).expect("getblk"));
        });
    });
}

criterion_group!(
    benches,
    bench_getblk_hit,
    bench_getblk_miss,
    bench_sequential_readahead,
    bench_eviction_pressure
);
criterion_main!(benches);
