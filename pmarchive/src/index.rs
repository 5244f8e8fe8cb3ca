//! Sparse temporal index.
//!
//! The index file holds a label followed by framed entries, each mapping a
//! timestamp to the volume and byte offsets where reading should start to
//! find the first record at or after that time. Entries are written by the
//! writer every few records and at every volume change, so they are sparse
//! and timestamps never decrease.
//!
//! A missing index file yields an empty index: seeks then fall back to
//! scanning from the archive's start or end.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::{self, ByteReader, ByteWriter, Frame};
use crate::context::Direction;
use crate::error::{ArchiveError, CodecError, Result};
use crate::label::ArchiveLabel;
use crate::naming::ResolvedFile;
use crate::record::Timestamp;

/// Encoded size of an index entry payload.
pub const ENTRY_PAYLOAD_SIZE: usize = 32;

/// Framed size of an index entry.
pub const ENTRY_FRAME_SIZE: usize = ENTRY_PAYLOAD_SIZE + codec::FRAME_OVERHEAD;

/// One temporal index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Timestamp of the first record at `data_offset`.
    pub timestamp: Timestamp,
    /// Volume holding the record.
    pub volume: u32,
    /// Size of the metadata file when the entry was written.
    pub meta_offset: u64,
    /// Byte offset of the record within its volume.
    pub data_offset: u64,
}

impl IndexEntry {
    /// Encodes the framed entry.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooBig`] if a field does not fit its encoding.
    pub fn frame(&self, version: u8) -> std::result::Result<Frame, CodecError> {
        let too_big = |len: u64| CodecError::TooBig {
            len: usize::try_from(len).unwrap_or(usize::MAX),
            max: i64::MAX as usize,
        };
        let volume = i32::try_from(self.volume).map_err(|_| too_big(u64::from(self.volume)))?;
        let meta = i64::try_from(self.meta_offset).map_err(|_| too_big(self.meta_offset))?;
        let data = i64::try_from(self.data_offset).map_err(|_| too_big(self.data_offset))?;

        let mut writer = ByteWriter::with_len(ENTRY_PAYLOAD_SIZE);
        self.timestamp.write(&mut writer);
        writer.put_i32(volume);
        writer.put_i64(meta);
        writer.put_i64(data);
        codec::frame(&writer.into_inner(), version)
    }

    /// Decodes an entry payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] for a short payload or negative
    /// volume or offsets.
    pub fn decode_payload(payload: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut reader = ByteReader::new(payload);
        let timestamp = Timestamp::read(&mut reader)?;
        let volume = reader.i32("volume")?;
        let meta = reader.i64("meta offset")?;
        let data = reader.i64("data offset")?;
        let (Ok(volume), Ok(meta_offset), Ok(data_offset)) = (
            u32::try_from(volume),
            u64::try_from(meta),
            u64::try_from(data),
        ) else {
            return Err(CodecError::malformed(format!(
                "negative index field: volume {volume}, meta {meta}, data {data}"
            )));
        };
        Ok(Self {
            timestamp,
            volume,
            meta_offset,
            data_offset,
        })
    }
}

/// In-memory copy of an archive's temporal index.
#[derive(Debug, Clone, Default)]
pub struct TemporalIndex {
    path: Option<PathBuf>,
    label: Option<ArchiveLabel>,
    entries: Vec<IndexEntry>,
}

impl TemporalIndex {
    /// An index with no entries, used when the archive has no index file.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads the index file, mapping it into memory (or decompressing it).
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if the file cannot be read, or a label
    /// error if the leading label is bad. A damaged tail is not an error.
    pub fn load(file: &ResolvedFile) -> Result<Self> {
        if file.compressed {
            return Self::from_bytes(&file.decompress()?, &file.path);
        }

        let handle = File::open(&file.path).map_err(|e| ArchiveError::io(&file.path, 0, e))?;
        let len = handle
            .metadata()
            .map_err(|e| ArchiveError::io(&file.path, 0, e))?
            .len();
        if len == 0 {
            return Self::from_bytes(&[], &file.path);
        }

        // SAFETY: The map is read-only and only lives for the duration of
        // this call. Writers only ever append to index files, so the mapped
        // prefix is not modified while entries are copied out of it.
        let mmap = unsafe { Mmap::map(&handle) }.map_err(|e| ArchiveError::io(&file.path, 0, e))?;
        Self::from_bytes(&mmap, &file.path)
    }

    /// Parses an index from its raw file contents.
    ///
    /// Entries after the first damaged or truncated frame are dropped with a
    /// warning; everything read up to that point is kept.
    ///
    /// # Errors
    ///
    /// Returns a label error if the leading label cannot be read.
    pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Self> {
        let (label, vol, label_len) = ArchiveLabel::read_from(&mut &bytes[..], path)?;
        ArchiveLabel::check_file(path, crate::label::INDEX_VOL, vol)?;

        let mut entries: Vec<IndexEntry> = Vec::new();
        let mut offset = usize::try_from(label_len).unwrap_or(bytes.len());
        while offset < bytes.len() {
            let end = offset + ENTRY_FRAME_SIZE;
            let parsed = bytes
                .get(offset..end)
                .ok_or_else(|| CodecError::TooSmall {
                    len: bytes.len() - offset,
                    min: ENTRY_FRAME_SIZE,
                })
                .and_then(|frame| codec::unframe(frame, ENTRY_FRAME_SIZE))
                .and_then(IndexEntry::decode_payload);

            match parsed {
                Ok(entry) => {
                    if let Some(last) = entries.last()
                        && entry.timestamp < last.timestamp
                    {
                        warn!(
                            path = %path.display(),
                            offset,
                            "index entry goes back in time, ignoring the rest of the index"
                        );
                        break;
                    }
                    entries.push(entry);
                    offset = end;
                }
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        offset,
                        entries = entries.len(),
                        %error,
                        "truncated or corrupt index tail, keeping entries read so far"
                    );
                    break;
                }
            }
        }

        Ok(Self {
            path: Some(path.to_path_buf()),
            label: Some(label),
            entries,
        })
    }

    /// Path of the index file, if one was loaded.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The index file's label, if one was loaded.
    pub fn label(&self) -> Option<&ArchiveLabel> {
        self.label.as_ref()
    }

    /// All entries in file order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an entry; timestamps must not decrease.
    pub fn push(&mut self, entry: IndexEntry) {
        debug_assert!(
            self.entries
                .last()
                .is_none_or(|last| last.timestamp <= entry.timestamp),
            "index timestamps must not decrease"
        );
        self.entries.push(entry);
    }

    /// Finds the entry to start reading from for `target`.
    ///
    /// Forward: the first entry with timestamp `>= target`. Backward: the
    /// last entry with timestamp `<= target`. `None` if no entry qualifies.
    pub fn lookup(&self, target: Timestamp, direction: Direction) -> Option<usize> {
        match direction {
            Direction::Forward => {
                let i = self.entries.partition_point(|e| e.timestamp < target);
                (i < self.entries.len()).then_some(i)
            }
            Direction::Backward => self
                .entries
                .partition_point(|e| e.timestamp <= target)
                .checked_sub(1),
        }
    }

    /// Starting at `pos`, moves in `direction` until an entry is `usable`.
    ///
    /// Entries pointing at missing volumes (or past a volume's physical
    /// end) are skipped this way.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::EndOfLog`] if no usable entry remains.
    pub fn volume_skip(
        &self,
        direction: Direction,
        pos: usize,
        mut usable: impl FnMut(&IndexEntry) -> bool,
    ) -> Result<usize> {
        let mut pos = Some(pos);
        while let Some(i) = pos {
            let Some(entry) = self.entries.get(i) else {
                break;
            };
            if usable(entry) {
                return Ok(i);
            }
            pos = match direction {
                Direction::Forward => i.checked_add(1),
                Direction::Backward => i.checked_sub(1),
            };
        }
        Err(ArchiveError::EndOfLog)
    }

    /// Last entry for `volume` whose data offset is at most `limit`.
    pub fn last_in_volume(&self, volume: u32, limit: u64) -> Option<&IndexEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.volume == volume && e.data_offset <= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::{CURRENT_VERSION, INDEX_VOL};

    fn entry(sec: i64, volume: u32, data_offset: u64) -> IndexEntry {
        IndexEntry {
            timestamp: Timestamp::from_secs(sec),
            volume,
            meta_offset: 64,
            data_offset,
        }
    }

    fn label() -> ArchiveLabel {
        ArchiveLabel {
            version: CURRENT_VERSION,
            pid: 1,
            hostname: "h".to_string(),
            start: Timestamp::from_secs(100),
            timezone: "UTC".to_string(),
            zoneinfo: None,
            features: None,
        }
    }

    fn index_bytes(entries: &[IndexEntry]) -> Vec<u8> {
        let mut bytes = label().frame(INDEX_VOL).unwrap().to_bytes();
        for e in entries {
            bytes.extend(e.frame(CURRENT_VERSION).unwrap().to_bytes());
        }
        bytes
    }

    fn index(secs: &[i64]) -> TemporalIndex {
        let mut index = TemporalIndex::empty();
        for (i, &sec) in secs.iter().enumerate() {
            index.push(entry(sec, 0, 100 + 40 * i as u64));
        }
        index
    }

    #[test]
    fn test_entry_frame_size() {
        let frame = entry(1, 2, 3).frame(CURRENT_VERSION).unwrap();
        assert_eq!(frame.len(), ENTRY_FRAME_SIZE);
    }

    #[test]
    fn test_from_bytes_reads_entries() {
        let entries = [entry(100, 0, 80), entry(300, 0, 160), entry(400, 1, 80)];
        let idx = TemporalIndex::from_bytes(&index_bytes(&entries), Path::new("a.index")).unwrap();
        assert_eq!(idx.entries(), &entries);
        assert_eq!(idx.label(), Some(&label()));
    }

    #[test]
    fn test_truncated_tail_keeps_prefix() {
        let entries = [entry(100, 0, 80), entry(300, 0, 160)];
        let mut bytes = index_bytes(&entries);
        bytes.truncate(bytes.len() - 5);
        let idx = TemporalIndex::from_bytes(&bytes, Path::new("a.index")).unwrap();
        assert_eq!(idx.entries(), &entries[..1]);
    }

    #[test]
    fn test_corrupt_entry_stops_parsing() {
        let entries = [entry(100, 0, 80), entry(300, 0, 160), entry(400, 0, 240)];
        let mut bytes = index_bytes(&entries);
        let second_trailer = bytes.len() - ENTRY_FRAME_SIZE - 1;
        bytes[second_trailer] ^= 0xff;
        let idx = TemporalIndex::from_bytes(&bytes, Path::new("a.index")).unwrap();
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_wrong_file_number_rejected() {
        let bytes = label().frame(0).unwrap().to_bytes();
        assert!(TemporalIndex::from_bytes(&bytes, Path::new("a.index")).is_err());
    }

    #[test]
    fn test_lookup_forward_and_backward() {
        let idx = index(&[100, 300, 300, 500]);

        assert_eq!(idx.lookup(Timestamp::from_secs(150), Direction::Forward), Some(1));
        assert_eq!(idx.lookup(Timestamp::from_secs(300), Direction::Forward), Some(1));
        assert_eq!(idx.lookup(Timestamp::from_secs(50), Direction::Forward), Some(0));
        assert_eq!(idx.lookup(Timestamp::from_secs(501), Direction::Forward), None);

        assert_eq!(idx.lookup(Timestamp::from_secs(250), Direction::Backward), Some(0));
        assert_eq!(idx.lookup(Timestamp::from_secs(300), Direction::Backward), Some(2));
        assert_eq!(idx.lookup(Timestamp::from_secs(900), Direction::Backward), Some(3));
        assert_eq!(idx.lookup(Timestamp::from_secs(99), Direction::Backward), None);
    }

    #[test]
    fn test_lookup_exact_between_ticks() {
        let mut idx = TemporalIndex::empty();
        idx.push(IndexEntry {
            timestamp: Timestamp::new(10, 500),
            ..entry(0, 0, 80)
        });
        assert_eq!(idx.lookup(Timestamp::new(10, 499), Direction::Forward), Some(0));
        assert_eq!(idx.lookup(Timestamp::new(10, 501), Direction::Forward), None);
        assert_eq!(idx.lookup(Timestamp::new(10, 500), Direction::Backward), Some(0));
    }

    #[test]
    fn test_volume_skip() {
        let mut idx = TemporalIndex::empty();
        idx.push(entry(100, 0, 80));
        idx.push(entry(200, 1, 80));
        idx.push(entry(300, 2, 80));

        let usable = |e: &IndexEntry| e.volume != 1;
        assert_eq!(idx.volume_skip(Direction::Forward, 1, usable).unwrap(), 2);
        assert_eq!(idx.volume_skip(Direction::Backward, 1, usable).unwrap(), 0);

        let err = idx
            .volume_skip(Direction::Forward, 0, |_| false)
            .unwrap_err();
        assert!(err.is_end_of_log());
    }

    #[test]
    fn test_last_in_volume() {
        let mut idx = TemporalIndex::empty();
        idx.push(entry(100, 0, 80));
        idx.push(entry(200, 0, 400));
        idx.push(entry(300, 1, 80));
        assert_eq!(idx.last_in_volume(0, 1_000).unwrap().data_offset, 400);
        assert_eq!(idx.last_in_volume(0, 399).unwrap().data_offset, 80);
        assert!(idx.last_in_volume(2, 1_000).is_none());
    }
}
