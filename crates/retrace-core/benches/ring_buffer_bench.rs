//! Benchmarks for the capture hand-off path.
//!
//! Run with: cargo bench -p retrace-core

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use retrace_core::{FramePool, PixelFormat, RingBuffer};

fn bench_push_pop(c: &mut Criterion) {
    let (mut tx, mut rx) = RingBuffer::<u64>::with_capacity(64).unwrap();

    c.bench_function("ring_push_pop_single", |bencher| {
        bencher.iter(|| {
            tx.push(black_box(7)).unwrap();
            black_box(rx.pop())
        });
    });
}

fn bench_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_burst");
    group.throughput(Throughput::Elements(63));

    let (mut tx, mut rx) = RingBuffer::<u64>::with_capacity(64).unwrap();
    let mut out = Vec::with_capacity(64);
    group.bench_function("fill_then_drain_63", |bencher| {
        bencher.iter(|| {
            for i in 0..63 {
                tx.push(i).unwrap();
            }
            out.clear();
            black_box(rx.pop_batch(&mut out, 64))
        });
    });
    group.finish();
}

fn bench_frame_recycle(c: &mut Criterion) {
    // 720p RGB frames through pool -> ring -> pool, the steady-state capture path.
    let pool = FramePool::new(1280, 720, PixelFormat::Rgb24, 16);
    let (mut tx, mut rx) = RingBuffer::with_capacity(64).unwrap();

    c.bench_function("frame_recycle_720p", |bencher| {
        bencher.iter(|| {
            let frame = pool.acquire();
            if let Err(frame) = tx.push(frame) {
                pool.release(frame);
            }
            if let Some(frame) = rx.pop() {
                pool.release(black_box(frame));
            }
        });
    });
}

criterion_group!(benches, bench_push_pop, bench_burst, bench_frame_recycle);
criterion_main!(benches);
