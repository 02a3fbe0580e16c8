//! Benchmarks for the per-lane hot path: classification, batching and
//! payload encoding.

use std::time::{Duration, Instant};

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use femtotransport::batcher::Batcher;
use femtotransport::classifier;
use femtotransport::{ClientConfig, Lane, Level, LogGroup, LogRecord, TransportPackage};

fn groups(count: usize) -> Vec<LogGroup> {
    (0..count)
        .map(|i| {
            LogGroup::singleton(
                LogRecord::new(Level::Info, "request handled")
                    .with_context("request_id", i as i64)
                    .with_context("path", "/api/orders"),
            )
        })
        .collect()
}

fn bench_batching(c: &mut Criterion) {
    let mut group = c.benchmark_group("batcher");
    for size in [16usize, 64, 256] {
        group.bench_function(format!("push_{size}"), |b| {
            b.iter_batched(
                || groups(1024),
                |input| {
                    let mut batcher = Batcher::new(Lane::Normal, size, Duration::from_millis(500));
                    let now = Instant::now();
                    let mut emitted = 0;
                    for g in input {
                        if let Some(batch) = batcher.push(g, now) {
                            emitted += batch.len();
                        }
                    }
                    black_box(emitted + batcher.flush().map_or(0, |b| b.len()))
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let config = ClientConfig::default();
    let input = groups(256);
    c.bench_function("classify_256", |b| {
        b.iter(|| {
            input
                .iter()
                .filter(|g| classifier::classify(g, &config, false) == Lane::Normal)
                .count()
        })
    });
}

fn bench_encode(c: &mut Criterion) {
    let config = ClientConfig::default();
    c.bench_function("encode_group", |b| {
        b.iter_batched(
            || groups(1).remove(0),
            |g| TransportPackage::for_group(g, Lane::Normal, &config).map(|p| p.payload.len()),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_batching, bench_classify, bench_encode);
criterion_main!(benches);
