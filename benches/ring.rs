// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Ring channel and allocator benchmarks.
//
// Run with:
//   cargo bench --bench ring
//
// Groups:
//   ring_push_pop    — Channel::push/pop round trip at three payload sizes
//   ring_wrap        — push/pop pairs small enough to force repeated wrap
//   alloc_malloc_free — ShmManager::malloc/free for a size-classed request
//   alloc_singleton  — ShmManager::get_singleton repeated lookup

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use shmbus::alloc::ShmManager;
use shmbus::bus::Channel;

const SMALL: usize = 48;
const MEDIUM: usize = 256;
const LARGE: usize = 4096;

const SIZES: &[(&str, usize)] = &[
    ("small_48", SMALL),
    ("medium_256", MEDIUM),
    ("large_4096", LARGE),
];

fn make_channel(node_size: u64, node_count: u64) -> (Vec<u8>, Channel) {
    let space = Channel::calc_space(node_size, node_count) as usize;
    let mut buf = vec![0u8; space];
    let chan = unsafe { Channel::from_raw(buf.as_mut_ptr()) };
    chan.init(node_size, node_count).unwrap();
    (buf, chan)
}

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_push_pop");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        let payload = vec![0xABu8; size];
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, _| {
            let (_buf, chan) = make_channel(256, 64);
            let mut out = vec![0u8; size + 64];
            b.iter(|| {
                chan.push(1, 2, 0, &payload).unwrap();
                let (len, ..) = chan.pop(&mut out).unwrap().unwrap();
                black_box(len);
            });
        });
    }

    group.finish();
}

fn bench_wrap(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_wrap");
    group.throughput(Throughput::Bytes(40));

    group.bench_function("push_pop_pairs", |b| {
        let (_buf, chan) = make_channel(64, 8);
        let payload = [7u8; 40];
        let mut out = [0u8; 64];
        b.iter(|| {
            chan.push(1, 2, 0, &payload).unwrap();
            let (len, ..) = chan.pop(&mut out).unwrap().unwrap();
            black_box(len);
        });
    });

    group.finish();
}

fn bench_malloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_malloc_free");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let name = format!("shmbus-bench-malloc-{label}-{}", std::process::id());
            let mut mgr = ShmManager::on_create(&name).unwrap();
            b.iter(|| {
                let addr = mgr.malloc(sz as u64).unwrap();
                black_box(addr);
                mgr.free(addr);
            });
            mgr.unlink();
        });
    }

    group.finish();
}

fn bench_singleton(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_singleton");
    group.throughput(Throughput::Elements(1));

    group.bench_function("repeated_lookup", |b| {
        let name = format!("shmbus-bench-singleton-{}", std::process::id());
        let mut mgr = ShmManager::on_create(&name).unwrap();
        b.iter(|| {
            let addr = mgr.get_singleton(1, 256).unwrap();
            black_box(addr);
        });
        mgr.unlink();
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_push_pop,
    bench_wrap,
    bench_malloc_free,
    bench_singleton,
);
criterion_main!(benches);
