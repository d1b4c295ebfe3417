//! Criterion benchmarks for pool allocation and teardown.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use poolkit_alloc::Allocator;
use poolkit_core::Pool;

fn bench_palloc(c: &mut Criterion) {
    let allocator = Arc::new(Allocator::default());
    let sizes: Vec<usize> = vec![16, 256, 4_096, 100_000];

    let mut group = c.benchmark_group("palloc_then_clear");
    for &size in &sizes {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let pool = Pool::with_allocator(Arc::clone(&allocator)).unwrap();
            b.iter(|| {
                for _ in 0..64 {
                    pool.palloc(size).unwrap();
                }
                pool.clear().unwrap();
            });
            pool.destroy().unwrap();
        });
    }
    group.finish();
}

fn bench_tree_teardown(c: &mut Criterion) {
    let allocator = Arc::new(Allocator::default());
    let widths: Vec<usize> = vec![1, 8, 64];

    let mut group = c.benchmark_group("create_destroy_tree");
    for &width in &widths {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| {
                let root = Pool::with_allocator(Arc::clone(&allocator)).unwrap();
                for _ in 0..width {
                    let child = root.create_child().unwrap();
                    child.palloc(512).unwrap();
                    child.cleanup_register(|| {}).unwrap();
                }
                root.destroy().unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_palloc, bench_tree_teardown);
criterion_main!(benches);
