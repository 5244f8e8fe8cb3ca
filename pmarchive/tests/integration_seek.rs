//! Integration tests for seeking by timestamp.

use std::fs::OpenOptions;
use std::path::Path;

use pmarchive::naming::{self, FileKind};
use pmarchive::{
    codec, ArchiveContext, ArchiveWriter, Direction, InsituValue, ReadOptions, Record, Timestamp,
    ValueSet, Values, WriterConfig,
};
use tempfile::tempdir;

fn record(sec: i64) -> Record {
    Record::new(
        Timestamp::from_secs(sec),
        vec![ValueSet {
            pmid: 7,
            values: Values::Insitu(vec![InsituValue { inst: 0, value: 1 }]),
        }],
    )
}

fn write_archive(base: &Path, host: &str, secs: &[i64], index_interval: u32, volume_breaks: &[i64]) {
    let config = WriterConfig::new(host).with_index_interval(index_interval);
    let mut writer = ArchiveWriter::create(base, config).unwrap();
    for &sec in secs {
        if volume_breaks.contains(&sec) {
            writer.new_volume().unwrap();
        }
        writer.append(&record(sec)).unwrap();
    }
    writer.close().unwrap();
}

fn next_sec(context: &mut ArchiveContext, direction: Direction) -> Option<i64> {
    match context.fetch(direction) {
        Ok(record) => Some(record.timestamp.sec),
        Err(e) if e.is_end_of_log() => None,
        Err(e) => panic!("unexpected error: {e}"),
    }
}

#[test]
fn test_seek_between_records() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("basic");
    write_archive(&base, "h", &[100, 200, 300], 2, &[]);

    let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
    let entries: Vec<i64> = context.archives()[0]
        .index()
        .entries()
        .iter()
        .map(|e| e.timestamp.sec)
        .collect();
    assert_eq!(entries, vec![100, 300]);

    context.seek(Timestamp::from_secs(150), Direction::Forward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Forward), Some(200));

    context.seek(Timestamp::from_secs(250), Direction::Backward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Backward), Some(200));
}

#[test]
fn test_seek_exact_timestamp() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("exact");
    write_archive(&base, "h", &[100, 200, 300], 2, &[]);

    let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
    context.seek(Timestamp::from_secs(200), Direction::Forward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Forward), Some(200));
    context.seek(Timestamp::from_secs(200), Direction::Backward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Backward), Some(200));
    context.seek(Timestamp::from_secs(300), Direction::Forward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Forward), Some(300));
}

#[test]
fn test_seek_outside_archive() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("outside");
    write_archive(&base, "h", &[100, 200, 300], 2, &[]);

    let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
    context.seek(Timestamp::from_secs(50), Direction::Forward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Forward), Some(100));
    context.seek(Timestamp::from_secs(50), Direction::Backward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Backward), None);

    context.seek(Timestamp::from_secs(1_000), Direction::Forward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Forward), None);
    context.seek(Timestamp::from_secs(1_000), Direction::Backward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Backward), Some(300));
}

#[test]
fn test_seek_agrees_with_linear_scan() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("scan");
    let secs: Vec<i64> = (0..40).map(|i| 1_000 + i * 10).collect();
    write_archive(&base, "h", &secs, 4, &[1_100, 1_250]);

    let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
    for target in (990..1_400).step_by(7) {
        let expected_forward = secs.iter().copied().find(|&s| s >= target);
        let expected_backward = secs.iter().copied().rev().find(|&s| s <= target);

        context.seek(Timestamp::from_secs(target), Direction::Forward).unwrap();
        assert_eq!(
            next_sec(&mut context, Direction::Forward),
            expected_forward,
            "forward seek to {target}"
        );
        context.seek(Timestamp::from_secs(target), Direction::Backward).unwrap();
        assert_eq!(
            next_sec(&mut context, Direction::Backward),
            expected_backward,
            "backward seek to {target}"
        );
    }
}

#[test]
fn test_seek_without_index() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("noindex");
    write_archive(&base, "h", &[100, 200, 300, 400], 0, &[300]);
    std::fs::remove_file(naming::file_name(&base, FileKind::Index)).unwrap();

    let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
    assert!(context.archives()[0].index().is_empty());

    context.seek(Timestamp::from_secs(250), Direction::Forward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Forward), Some(300));
    context.seek(Timestamp::from_secs(250), Direction::Backward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Backward), Some(200));
}

#[test]
fn test_seek_skips_entries_past_volume_end() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("stale");
    write_archive(&base, "h", &[100, 200, 300, 400, 500, 600], 2, &[]);

    // Cut the volume back to its first three records; the index still
    // points at 500.
    let volume = naming::file_name(&base, FileKind::Volume(0));
    let record_len = codec::encode(&record(100), 2).unwrap().len() as u64;
    let len = std::fs::metadata(&volume).unwrap().len();
    let file = OpenOptions::new().write(true).open(&volume).unwrap();
    file.set_len(len - 3 * record_len).unwrap();

    let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
    context.seek(Timestamp::from_secs(550), Direction::Backward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Backward), Some(300));
    context.seek(Timestamp::from_secs(250), Direction::Forward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Forward), Some(300));
    assert_eq!(next_sec(&mut context, Direction::Forward), None);
}

#[test]
fn test_seek_selects_archive_in_chain() {
    let temp_dir = tempdir().unwrap();
    let first = temp_dir.path().join("first");
    let second = temp_dir.path().join("second");
    write_archive(&first, "h", &[100, 200, 300], 2, &[]);
    write_archive(&second, "h", &[1_000, 1_100, 1_200], 2, &[]);

    let mut context = ArchiveContext::open(&[&second, &first], ReadOptions::default()).unwrap();

    context.seek(Timestamp::from_secs(1_050), Direction::Forward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Forward), Some(1_100));

    context.seek(Timestamp::from_secs(1_050), Direction::Backward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Backward), Some(1_000));

    // In the gap: the first archive is selected, and reading forward
    // crosses the boundary with a mark record.
    context.seek(Timestamp::from_secs(500), Direction::Forward).unwrap();
    let mark = context.fetch(Direction::Forward).unwrap();
    assert!(mark.is_mark());
    assert_eq!(mark.timestamp, Timestamp::new(300, 1_000_000));
    assert_eq!(next_sec(&mut context, Direction::Forward), Some(1_000));

    // Before the chain: the first archive.
    context.seek(Timestamp::from_secs(10), Direction::Forward).unwrap();
    assert_eq!(next_sec(&mut context, Direction::Forward), Some(100));
}
