//! Store operation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ticksync_bench::{random_data, seed};
use ticksync_store::{Database, Record, StoreOptions};

/// Benchmark batch writes of live records.
fn bench_batch_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_write");

    for batch_size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let db = Database::new();
                let records: Vec<_> = (0..batch_size)
                    .map(|i| Record::new("encounters", format!("e{i}"), random_data(4)))
                    .collect();

                b.iter(|| {
                    db.transaction(|txn| {
                        for record in &records {
                            txn.put_record(black_box(record.clone()))?;
                        }
                        Ok(())
                    })
                    .unwrap();
                });
            },
        );
    }
    group.finish();
}

/// Benchmark a full scan of one record type.
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_records");

    for count in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let db = Database::new();
            seed(&db, count);
            b.iter(|| {
                let txn = db.begin();
                black_box(txn.scan_records("encounters", None, usize::MAX, |r| !r.is_deleted).len())
            });
        });
    }
    group.finish();
}

/// Benchmark checkpoint and restore.
fn bench_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint");
    group.sample_size(20);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.json");

    let db = Database::new();
    seed(&db, 10_000);
    group.bench_function("write", |b| {
        b.iter(|| db.checkpoint(&path).unwrap());
    });
    db.checkpoint(&path).unwrap();
    group.bench_function("restore", |b| {
        b.iter(|| Database::restore(&path, StoreOptions::default()).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_batch_write, bench_scan, bench_checkpoint);
criterion_main!(benches);
