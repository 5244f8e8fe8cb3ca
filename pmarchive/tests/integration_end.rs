//! Integration tests for end-of-archive resolution on intact, growing,
//! truncated and damaged archives, and for reading backward from a torn
//! tail.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use pmarchive::naming::{self, FileKind};
use pmarchive::{
    ArchiveContext, ArchiveHandle, ArchiveWriter, Direction, ReadOptions, Timestamp, WriterConfig,
};
use tempfile::tempdir;

fn write_marks(base: &Path, secs: &[i64], index_interval: u32, volume_breaks: &[i64]) {
    let config = WriterConfig::new("end-host").with_index_interval(index_interval);
    let mut writer = ArchiveWriter::create(base, config).unwrap();
    for &sec in secs {
        if volume_breaks.contains(&sec) {
            writer.new_volume().unwrap();
        }
        writer.put_mark(Timestamp::from_secs(sec)).unwrap();
    }
    writer.close().unwrap();
}

fn set_len(path: &Path, len: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(len).unwrap();
}

/// Writes marks and cuts the last byte off volume 0.
fn truncated_archive(base: &Path, secs: &[i64], volume_breaks: &[i64]) {
    write_marks(base, secs, 2, volume_breaks);
    let volume = naming::file_name(base, FileKind::Volume(0));
    let len = std::fs::metadata(&volume).unwrap().len();
    set_len(&volume, len - 1);
}

#[test]
fn test_end_of_intact_archive() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("intact");
    write_marks(&base, &[100, 200, 300], 2, &[]);

    let handle = ArchiveHandle::open(&base).unwrap();
    assert_eq!(handle.end_time().unwrap(), Timestamp::from_secs(300));
    // Cached answer.
    assert_eq!(handle.end_time().unwrap(), Timestamp::from_secs(300));
    handle.invalidate_end_cache();
    assert_eq!(handle.end_time().unwrap(), Timestamp::from_secs(300));
}

#[test]
fn test_truncated_tail_falls_back_then_recovers() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("truncated");
    write_marks(&base, &[100, 200, 300], 2, &[]);

    let volume = naming::file_name(&base, FileKind::Volume(0));
    let full = std::fs::read(&volume).unwrap();
    let handle = ArchiveHandle::open(&base).unwrap();
    assert_eq!(handle.end_time().unwrap(), Timestamp::from_secs(300));

    set_len(&volume, full.len() as u64 - 1);
    assert_eq!(handle.end_time().unwrap(), Timestamp::from_secs(200));

    std::fs::write(&volume, &full).unwrap();
    assert_eq!(handle.end_time().unwrap(), Timestamp::from_secs(300));
}

#[test]
fn test_end_follows_appending_writer() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("growing");
    let mut writer = ArchiveWriter::create(&base, WriterConfig::new("end-host")).unwrap();
    writer.put_mark(Timestamp::from_secs(100)).unwrap();
    writer.flush().unwrap();

    let handle = ArchiveHandle::open(&base).unwrap();
    assert_eq!(handle.end_time().unwrap(), Timestamp::from_secs(100));

    writer.put_mark(Timestamp::from_secs(150)).unwrap();
    writer.flush().unwrap();
    assert_eq!(handle.end_time().unwrap(), Timestamp::from_secs(150));
    writer.close().unwrap();
}

#[test]
fn test_archive_without_records_ends_at_start() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("empty");
    let start = Timestamp::new(1_700_000_000, 500);
    let mut writer =
        ArchiveWriter::create(&base, WriterConfig::new("end-host").with_start(start)).unwrap();
    writer.flush().unwrap();
    writer.close().unwrap();

    let handle = ArchiveHandle::open(&base).unwrap();
    assert_eq!(handle.start(), start);
    assert_eq!(handle.end_time().unwrap(), start);
}

#[test]
fn test_garbage_after_last_record_is_ignored() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("garbage");
    write_marks(&base, &[100, 200, 300, 400, 500, 600], 2, &[]);

    let volume = naming::file_name(&base, FileKind::Volume(0));
    let mut file = OpenOptions::new().append(true).open(&volume).unwrap();
    file.write_all(&[0xff; 10]).unwrap();

    let handle = ArchiveHandle::open(&base).unwrap();
    assert_eq!(handle.end_time().unwrap(), Timestamp::from_secs(600));
}

#[test]
fn test_torn_highest_volume_falls_back_to_previous() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("torn");
    write_marks(&base, &[100, 200, 300], 2, &[300]);

    let handle = ArchiveHandle::open(&base).unwrap();
    assert_eq!(handle.max_volume(), 1);
    let (data_start, _) = handle.volume_bounds(1).unwrap().unwrap();

    set_len(&naming::file_name(&base, FileKind::Volume(1)), data_start + 2);
    assert_eq!(handle.end_time().unwrap(), Timestamp::from_secs(200));
}

#[test]
fn test_label_only_highest_volume_is_skipped() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("fresh");
    let mut writer = ArchiveWriter::create(&base, WriterConfig::new("end-host")).unwrap();
    writer.put_mark(Timestamp::from_secs(100)).unwrap();
    writer.put_mark(Timestamp::from_secs(200)).unwrap();
    writer.new_volume().unwrap();
    writer.close().unwrap();

    let handle = ArchiveHandle::open(&base).unwrap();
    assert_eq!(handle.max_volume(), 1);
    assert_eq!(handle.end_time().unwrap(), Timestamp::from_secs(200));
}

#[test]
fn test_backward_read_starts_at_last_valid_record() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("torn_tail");
    truncated_archive(&base, &[100, 200, 300], &[]);

    let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
    context.seek_end();
    assert_eq!(context.fetch(Direction::Backward).unwrap().timestamp.sec, 200);
    assert_eq!(context.fetch(Direction::Backward).unwrap().timestamp.sec, 100);
    assert!(context.fetch(Direction::Backward).unwrap_err().is_end_of_log());

    let handle = &context.archives()[0];
    let (data_start, valid_end) = handle.valid_end(0).unwrap().unwrap();
    let (_, physical) = handle.volume_bounds(0).unwrap().unwrap();
    assert!(data_start < valid_end && valid_end < physical);
}

#[test]
fn test_seek_past_torn_tail() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("torn_seek");
    truncated_archive(&base, &[100, 200, 300], &[]);

    let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
    context.seek(Timestamp::from_secs(350), Direction::Forward).unwrap();
    assert!(context.fetch(Direction::Forward).unwrap_err().is_end_of_log());
    assert_eq!(context.fetch(Direction::Backward).unwrap().timestamp.sec, 200);

    context.seek(Timestamp::from_secs(350), Direction::Backward).unwrap();
    assert_eq!(context.fetch(Direction::Backward).unwrap().timestamp.sec, 200);
}

#[test]
fn test_backward_rollover_into_torn_volume() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("torn_rollover");
    truncated_archive(&base, &[100, 200, 300, 400], &[400]);

    let mut context = ArchiveContext::open(&[&base], ReadOptions::default()).unwrap();
    context.seek_end();
    let secs: Vec<i64> = context
        .iter(Direction::Backward)
        .map(|r| r.unwrap().timestamp.sec)
        .collect();
    assert_eq!(secs, vec![400, 200, 100]);
}

#[test]
fn test_valid_end_follows_repaired_volume() {
    let temp_dir = tempdir().unwrap();
    let base = temp_dir.path().join("repaired");
    write_marks(&base, &[100, 200], 2, &[]);

    let volume = naming::file_name(&base, FileKind::Volume(0));
    let full = std::fs::read(&volume).unwrap();
    let handle = ArchiveHandle::open(&base).unwrap();
    let (_, intact_end) = handle.valid_end(0).unwrap().unwrap();
    assert_eq!(intact_end, full.len() as u64);

    set_len(&volume, full.len() as u64 - 3);
    let (_, torn_end) = handle.valid_end(0).unwrap().unwrap();
    assert!(torn_end < intact_end);

    std::fs::write(&volume, &full).unwrap();
    assert_eq!(handle.valid_end(0).unwrap().unwrap().1, intact_end);
    assert!(handle.valid_end(7).unwrap().is_none());
}
