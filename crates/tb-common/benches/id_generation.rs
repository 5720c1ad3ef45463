//! Identifier generation benchmark
//!
//! Single caller versus callers contending on the generator lock.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tb_common::{IdGenerator, UInt128};

fn id_single_thread_benchmark(c: &mut Criterion) {
    let generator = IdGenerator::new();

    c.bench_function("next_id", |b| {
        b.iter(|| black_box(generator.next_id().unwrap()))
    });

    c.bench_function("uint128_round_trip", |b| {
        let id = generator.next_id().unwrap();
        b.iter(|| black_box(UInt128::from_bytes(black_box(id.as_bytes())).unwrap()))
    });
}

fn id_contended_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_id_contended");

    for threads in [2usize, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            let generator = Arc::new(IdGenerator::new());
            b.iter(|| {
                std::thread::scope(|s| {
                    for _ in 0..threads {
                        let generator = Arc::clone(&generator);
                        s.spawn(move || {
                            for _ in 0..1_000 {
                                black_box(generator.next_id().unwrap());
                            }
                        });
                    }
                });
            })
        });
    }

    group.finish();
}

criterion_group!(benches, id_single_thread_benchmark, id_contended_benchmark);
criterion_main!(benches);
