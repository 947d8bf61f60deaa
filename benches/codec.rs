//! Benchmarks for the typed value codec
//!
//! Run with: cargo bench

use canvis_rs::types::{scalar_from_bytes, CoValueType};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    let buffer = 16_384i32.to_le_bytes();
    for ty in [CoValueType::I32, CoValueType::U32, CoValueType::Iq15] {
        group.bench_with_input(BenchmarkId::from_parameter(ty), &ty, |b, ty| {
            b.iter(|| ty.decode(black_box(&buffer)).unwrap());
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    for ty in [CoValueType::I32, CoValueType::Iq15, CoValueType::Iq7] {
        group.bench_with_input(BenchmarkId::from_parameter(ty), &ty, |b, ty| {
            let mut buffer = [0u8; 4];
            b.iter(|| ty.encode(black_box(0.5), &mut buffer).unwrap());
        });
    }
    group.finish();
}

fn bench_scalar_access(c: &mut Criterion) {
    let buffer = 0xDEAD_BEEFu32.to_le_bytes();
    c.bench_function("scalar_from_bytes_u32", |b| {
        b.iter(|| scalar_from_bytes::<u32>(black_box(&buffer)).unwrap());
    });
}

criterion_group!(benches, bench_decode, bench_encode, bench_scalar_access);
criterion_main!(benches);
