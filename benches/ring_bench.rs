//! Ring buffer hot-path benchmark
//!
//! Measures the push variants and the pop against the byte rates the cycle
//! callback actually sees.
//!
//! **Goal:** conversion overhead must stay far below real time even at
//! DSD512 rates (~5.6 MB/s of ring traffic).

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use resona::engine::format::DsdConversionMode;
use resona::engine::ring::SyncRing;

fn bench_push_variants(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_push");
    let block = vec![0x55u8; 16_384];
    group.throughput(Throughput::Bytes(block.len() as u64));

    group.bench_function("raw", |b| {
        let ring = SyncRing::new(1 << 20, 0x00);
        let mut sink = vec![0u8; block.len()];
        b.iter(|| {
            let n = ring.push_raw(black_box(&block));
            ring.pop(&mut sink);
            black_box(n);
        });
    });

    group.bench_function("widen_16_to_32", |b| {
        let ring = SyncRing::new(1 << 20, 0x00);
        let mut sink = vec![0u8; block.len() * 2];
        b.iter(|| {
            let n = ring.push_16_to_32(black_box(&block));
            ring.pop(&mut sink);
            black_box(n);
        });
    });

    group.bench_function("pack_24", |b| {
        let ring = SyncRing::new(1 << 20, 0x00);
        let mut sink = vec![0u8; block.len()];
        b.iter(|| {
            let n = ring.push_24_packed(black_box(&block));
            ring.pop(&mut sink);
            black_box(n);
        });
    });

    for mode in [
        DsdConversionMode::Passthrough,
        DsdConversionMode::BitReverseAndSwap,
    ] {
        group.bench_function(format!("dsd_{mode:?}"), |b| {
            let ring = SyncRing::new(1 << 20, 0x69);
            let mut sink = vec![0u8; block.len()];
            b.iter(|| {
                let n = ring.push_dsd(black_box(&block), 2, mode);
                ring.pop(&mut sink);
                black_box(n);
            });
        });
    }

    group.finish();
}

fn bench_cycle_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_pop");

    // One cycle of DSD512 stereo
    let cycle = 5_648usize;
    group.throughput(Throughput::Bytes(cycle as u64));
    group.bench_function("dsd512_cycle", |b| {
        let ring = SyncRing::new(1 << 20, 0x69);
        let feed = vec![0x69u8; 1 << 18];
        ring.push_raw(&feed);
        let mut buf = vec![0u8; cycle];
        b.iter(|| {
            if ring.available() < buf.len() {
                ring.push_raw(&feed);
            }
            let n = ring.pop(black_box(&mut buf));
            black_box(n);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_push_variants, bench_cycle_pop);
criterion_main!(benches);
