use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use decuma_core::segment::{Conflict, Segment, When};
use tempfile::tempdir;

fn bench_insert(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let mut group = c.benchmark_group("segment_insert");
    for size in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut seg = Segment::from_single(1, 0, vec![0.0], dir.path());
                for t in 1..size as i64 {
                    seg.insert(t, vec![t as f64], Conflict::KeepBoth).unwrap();
                }
                black_box(seg.memory_consumption());
            });
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let mut seg = Segment::from_single(1, 0, vec![0.0], dir.path());
    for t in 1..10_000i64 {
        seg.insert(t, vec![t as f64], Conflict::KeepBoth).unwrap();
    }

    c.bench_function("segment_get_exact", |b| {
        b.iter(|| black_box(seg.get(black_box(5_000), None, When::Exact).unwrap()));
    });
}

criterion_group!(benches, bench_insert, bench_get);
criterion_main!(benches);
