//! Benchmarks for the Strata storage engine
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use strata::encoding::{marshal_timestamps, marshal_values, unmarshal_timestamps, unmarshal_values};
use strata::index::TagFilter;
use strata::storage::*;
use tempfile::tempdir;

const BASE_TS: i64 = 1_700_000_000_000;

fn create_test_rows(series: usize, samples: usize) -> Vec<MetricRow> {
    let mut rows = Vec::with_capacity(series * samples);
    for s in 0..samples {
        for host in 0..series {
            let host = format!("host-{}", host);
            rows.push(MetricRow::from_labels(
                &[("__name__", "cpu_usage"), ("host", host.as_str()), ("dc", "eu")],
                BASE_TS + s as i64 * 15_000,
                (s % 100) as f64 * 0.37,
            ));
        }
    }
    rows
}

fn bench_config(dir: &std::path::Path) -> StorageConfig {
    let mut config = StorageConfig::new(dir);
    config.retention_months = 1200;
    config.wal_sync = WalSyncMode::None;
    config
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoding");

    for size in [100, 1000, 8192] {
        let timestamps: Vec<i64> = (0..size).map(|i| BASE_TS + i as i64 * 15_000 + (i % 7) as i64).collect();
        let gauges: Vec<f64> = (0..size).map(|i| (i as f64 * 0.1).sin() * 100.0).collect();
        let counters: Vec<f64> = (0..size).map(|i| (i * 3) as f64).collect();

        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("marshal_timestamps_{}", size), |b| {
            b.iter(|| marshal_timestamps(black_box(&timestamps)))
        });

        group.bench_function(format!("marshal_gauge_values_{}", size), |b| {
            b.iter(|| marshal_values(black_box(&gauges), 64))
        });

        group.bench_function(format!("marshal_gauge_values_p12_{}", size), |b| {
            b.iter(|| marshal_values(black_box(&gauges), 12))
        });

        group.bench_function(format!("marshal_counter_values_{}", size), |b| {
            b.iter(|| marshal_values(black_box(&counters), 64))
        });

        let ts = marshal_timestamps(&timestamps);
        group.bench_function(format!("unmarshal_timestamps_{}", size), |b| {
            b.iter(|| unmarshal_timestamps(black_box(&ts.data), ts.marshal_type, ts.first_value, size).unwrap())
        });

        let vs = marshal_values(&gauges, 64);
        group.bench_function(format!("unmarshal_gauge_values_{}", size), |b| {
            b.iter(|| unmarshal_values(black_box(&vs.data), vs.marshal_type, vs.first_value, size).unwrap())
        });
    }

    group.finish();
}

fn bench_add_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_rows");

    // New series on every iteration: index writes dominate
    group.bench_function("new_series_1000", |b| {
        b.iter_custom(|iters| {
            let dir = tempdir().unwrap();
            let engine = StorageEngine::open(bench_config(dir.path())).unwrap();
            let batches: Vec<Vec<MetricRow>> = (0..iters)
                .map(|i| {
                    (0..1000)
                        .map(|j| {
                            let id = format!("{}-{}", i, j);
                            MetricRow::from_labels(&[("__name__", "req"), ("id", id.as_str())], BASE_TS, 1.0)
                        })
                        .collect()
                })
                .collect();

            let start = std::time::Instant::now();
            for batch in &batches {
                engine.add_rows(black_box(batch), 64).unwrap();
            }
            let elapsed = start.elapsed();
            engine.must_close().unwrap();
            elapsed
        });
    });

    // Known series: the TSID cache path
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("existing_series_10000", |b| {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(bench_config(dir.path())).unwrap();
        let rows = create_test_rows(100, 100);
        engine.add_rows(&rows, 64).unwrap();

        b.iter(|| engine.add_rows(black_box(&rows), 64).unwrap());
        engine.must_close().unwrap();
    });

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");

    let dir = tempdir().unwrap();
    let engine = StorageEngine::open(bench_config(dir.path())).unwrap();
    engine.add_rows(&create_test_rows(1000, 200), 64).unwrap();
    engine.force_flush().unwrap();
    engine.force_merge("").unwrap();

    let tr = TimeRange::try_new(BASE_TS, BASE_TS + 200 * 15_000).unwrap();

    group.bench_function("single_series", |b| {
        let filters = [TagFilter::metric("cpu_usage"), TagFilter::eq("host", "host-42")];
        b.iter(|| {
            let n: usize = engine
                .search(black_box(&filters), &tr, SearchContext::new())
                .unwrap()
                .map(|s| s.unwrap().len())
                .sum();
            assert_eq!(n, 200);
        })
    });

    group.bench_function("regex_100_series", |b| {
        let filters = [TagFilter::metric("cpu_usage"), TagFilter::regex("host", "host-1[0-9]{2}")];
        b.iter(|| {
            engine
                .search(black_box(&filters), &tr, SearchContext::new())
                .unwrap()
                .count()
        })
    });

    group.bench_function("label_values", |b| {
        b.iter(|| engine.search_label_values("host", &[], &tr, 10_000).unwrap())
    });

    group.finish();
    engine.must_close().unwrap();
}

criterion_group!(benches, bench_encoding, bench_add_rows, bench_search);
criterion_main!(benches);
