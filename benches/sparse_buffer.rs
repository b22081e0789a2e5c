//! Benchmarks for sparse buffer writes and tiered spill

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use partstream::{BackingArena, Channel, SparseBlockBuffer, TierConfig, TieredBlockStore};
use rand::{Rng, SeedableRng};
use std::io::SeekFrom;

fn benchmark_sequential_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("sparse_sequential_write");

    for size in [64usize, 512, 4096].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let chunk = vec![0xABu8; size];
            b.iter(|| {
                let mut buffer = SparseBlockBuffer::new();
                for _ in 0..256 {
                    buffer.write(black_box(&chunk)).unwrap();
                }
                black_box(buffer.block_count());
            });
        });
    }

    group.finish();
}

fn benchmark_random_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("sparse_random_write");

    for gap in [0u64, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(gap), gap, |b, &gap| {
            let mut rng = rand::rngs::StdRng::seed_from_u64(7);
            let offsets: Vec<u64> = (0..1000).map(|_| rng.gen_range(0..1_000_000)).collect();
            let chunk = [0x5Au8; 32];

            b.iter(|| {
                let mut buffer = SparseBlockBuffer::with_limits(gap, 1024 * 1024);
                for &offset in &offsets {
                    buffer.seek(SeekFrom::Start(offset)).unwrap();
                    buffer.write(&chunk).unwrap();
                }
                black_box(buffer.block_count());
            });
        });
    }

    group.finish();
}

fn benchmark_sparse_read(c: &mut Criterion) {
    let mut buffer = SparseBlockBuffer::new();
    for i in 0..1000u64 {
        buffer.seek(SeekFrom::Start(i * 500)).unwrap();
        buffer.write(&[i as u8; 64]).unwrap();
    }

    c.bench_function("sparse_read_64k", |b| {
        let mut out = vec![0u8; 64 * 1024];
        b.iter(|| {
            buffer.seek(SeekFrom::Start(black_box(100_000))).unwrap();
            black_box(buffer.read_full(&mut out).unwrap());
        });
    });
}

fn benchmark_spill(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let arena = BackingArena::new(Some(dir.path().to_path_buf()));
    let tiers = TierConfig::with_marks(16 * 1024, 256 * 1024);

    c.bench_function("tiered_spill_1mb", |b| {
        let chunk = vec![1u8; 8192];
        b.iter(|| {
            let mut store =
                TieredBlockStore::with_parts(SparseBlockBuffer::new(), &tiers, arena.clone())
                    .unwrap();
            for _ in 0..128 {
                store.write(&chunk).unwrap();
            }
            black_box(store.tier());
        });
    });
}

criterion_group!(
    benches,
    benchmark_sequential_writes,
    benchmark_random_writes,
    benchmark_sparse_read,
    benchmark_spill
);
criterion_main!(benches);
