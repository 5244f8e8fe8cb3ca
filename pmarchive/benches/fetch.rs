//! Benchmarks for the read path: sequential fetches, seeks and record
//! encoding.
//!
//! Run with: `cargo bench -p pmarchive -- fetch`

#![allow(missing_docs, clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use pmarchive::{
    ArchiveContext, ArchiveWriter, Direction, InsituValue, ReadOptions, Record, Timestamp,
    ValueSet, Values, WriterConfig,
};
use std::path::PathBuf;
use tempfile::tempdir;

const BASE_SEC: i64 = 1_700_000_000;

/// A record shaped like a typical sampling interval: `metrics` value-sets
/// with four instances each.
fn sample_record(sec: i64, metrics: u32) -> Record {
    let value_sets = (0..metrics)
        .map(|pmid| ValueSet {
            pmid,
            values: Values::Insitu(
                (0..4)
                    .map(|inst| InsituValue {
                        inst,
                        value: pmid ^ sec as u32,
                    })
                    .collect(),
            ),
        })
        .collect();
    Record::new(Timestamp::from_secs(sec), value_sets)
}

/// Writes an archive of `records` one-second samples spread over four volumes.
fn setup_archive(records: i64, metrics: u32) -> (PathBuf, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("bench_archive");

    let mut writer = ArchiveWriter::create(&base, WriterConfig::new("bench-host")).unwrap();
    let per_volume = (records / 4).max(1);
    for i in 0..records {
        if i > 0 && i % per_volume == 0 {
            writer.new_volume().unwrap();
        }
        writer.append(&sample_record(BASE_SEC + i, metrics)).unwrap();
    }
    writer.close().unwrap();

    (base, temp_dir)
}

fn bench_fetch_forward(c: &mut Criterion) {
    let (base, _dir) = setup_archive(10_000, 30);
    let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();

    c.bench_function("fetch/forward", |b| {
        b.iter(|| match context.fetch(black_box(Direction::Forward)) {
            Ok(record) => {
                black_box(record);
            }
            Err(_) => context.rewind(),
        });
    });
}

fn bench_fetch_backward(c: &mut Criterion) {
    let (base, _dir) = setup_archive(10_000, 30);
    let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
    context.seek_end();

    c.bench_function("fetch/backward", |b| {
        b.iter(|| match context.fetch(black_box(Direction::Backward)) {
            Ok(record) => {
                black_box(record);
            }
            Err(_) => context.seek_end(),
        });
    });
}

fn bench_fetch_paranoid(c: &mut Criterion) {
    let (base, _dir) = setup_archive(10_000, 30);
    let options = ReadOptions::new().with_paranoid(true);
    let mut context = ArchiveContext::open(&[&base], options).unwrap();

    c.bench_function("fetch/forward_paranoid", |b| {
        b.iter(|| match context.fetch(black_box(Direction::Forward)) {
            Ok(record) => {
                black_box(record);
            }
            Err(_) => context.rewind(),
        });
    });
}

fn bench_seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("seek/index_interval");

    for interval in [10u32, 100, 1_000] {
        let temp_dir = tempdir().unwrap();
        let base = temp_dir.path().join("bench_seek");
        let config = WriterConfig::new("bench-host").with_index_interval(interval);
        let mut writer = ArchiveWriter::create(&base, config).unwrap();
        for i in 0..10_000 {
            writer.append(&sample_record(BASE_SEC + i, 10)).unwrap();
        }
        writer.close().unwrap();

        let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
        let mut target = 0i64;

        group.bench_with_input(BenchmarkId::from_parameter(interval), &interval, |b, _| {
            b.iter(|| {
                target = (target + 7_919) % 10_000;
                context
                    .seek(
                        black_box(Timestamp::from_secs(BASE_SEC + target)),
                        Direction::Forward,
                    )
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode/metrics");

    for metrics in [1u32, 30, 300] {
        let record = sample_record(BASE_SEC, metrics);
        group.bench_with_input(BenchmarkId::from_parameter(metrics), &record, |b, record| {
            b.iter(|| pmarchive::codec::encode(black_box(record), 2).unwrap());
        });
    }

    group.finish();
}

fn bench_end_time(c: &mut Criterion) {
    let (base, _dir) = setup_archive(10_000, 30);
    let context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
    let handle = &context.archives()[0];

    c.bench_function("end_time/rescan", |b| {
        b.iter(|| {
            handle.invalidate_end_cache();
            black_box(handle.end_time().unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_fetch_forward,
    bench_fetch_backward,
    bench_fetch_paranoid,
    bench_seek,
    bench_encode,
    bench_end_time,
);
criterion_main!(benches);
