//! Timeline benchmarks
//!
//! Measures push throughput under retention and query latency by history size.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use igtcom::timeline::{
    Buffer, Direction, Matrix4, MatrixTl, Retention, TimelineConfig, Timestamp,
};

fn filled(len: i64) -> MatrixTl {
    let timeline = MatrixTl::with_config(
        "bench",
        TimelineConfig::default().with_retention(Retention::unbounded()),
    )
    .unwrap();
    for i in 0..len {
        timeline
            .push(Buffer::single(Timestamp::from_millis(i * 10), Matrix4::identity()))
            .unwrap();
    }
    timeline
}

fn bench_push_with_retention(c: &mut Criterion) {
    let timeline = MatrixTl::with_config(
        "push",
        TimelineConfig::default().with_retention(Retention::count(1000)),
    )
    .unwrap();
    let mut next = 0i64;

    let mut group = c.benchmark_group("push");
    group.throughput(Throughput::Elements(1));
    group.bench_function("count_1000", |b| {
        b.iter(|| {
            next += 1;
            timeline
                .push(Buffer::single(Timestamp::from_micros(next), Matrix4::identity()))
                .unwrap();
        })
    });
    group.finish();
}

fn bench_closest_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("closest_buffer");

    for len in [100i64, 1_000, 10_000] {
        let timeline = filled(len);
        let query = Timestamp::from_millis(len * 5 + 3);

        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| black_box(timeline.closest_buffer(black_box(query), Direction::Nearest)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_push_with_retention, bench_closest_buffer);
criterion_main!(benches);
