//! Archive creation and appending.
//!
//! An [`ArchiveWriter`] creates the metadata file, the temporal index and
//! volume 0 of a new archive, then appends records, metadata payloads and
//! index entries to them. Files are written without user-space buffering:
//! each frame reaches the file in one `write` call (version 2) or two
//! (version 1), so concurrent readers see at most one torn frame at the end
//! of a volume.
//!
//! Nothing is written until the first record (or explicit flush): the label
//! is then written to the index, the metadata file and volume 0.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{self, Frame};
use crate::error::{ArchiveError, Result};
use crate::index::IndexEntry;
use crate::label::{ArchiveLabel, CURRENT_VERSION, INDEX_VOL, META_VOL, SUPPORTED_VERSIONS};
use crate::naming::{self, FileKind};
use crate::record::{Record, Timestamp};

/// Configuration for a new archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Host the metrics are collected from.
    pub hostname: String,
    /// Timezone of the collection host.
    pub timezone: String,
    /// Optional zoneinfo name recorded in the label.
    pub zoneinfo: Option<String>,
    /// Optional feature bitmask recorded in the label.
    pub features: Option<u32>,
    /// Label and framing version (1 or 2).
    pub version: u8,
    /// Write an index entry every this many records; 0 writes entries only
    /// when [`ArchiveWriter::put_index`] is called.
    pub index_interval: u32,
    /// Writer pid recorded in the label; defaults to the current process.
    pub pid: Option<i32>,
    /// Archive start time; defaults to the first record's timestamp.
    pub start: Option<Timestamp>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            timezone: "UTC".to_string(),
            zoneinfo: None,
            features: None,
            version: CURRENT_VERSION,
            index_interval: 100,
            pid: None,
            start: None,
        }
    }
}

impl WriterConfig {
    /// Creates a config for `hostname` with defaults for everything else.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    /// Sets the timezone.
    #[must_use]
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Sets the zoneinfo name.
    #[must_use]
    pub fn with_zoneinfo(mut self, zoneinfo: impl Into<String>) -> Self {
        self.zoneinfo = Some(zoneinfo.into());
        self
    }

    /// Sets the feature bitmask.
    #[must_use]
    pub fn with_features(mut self, features: u32) -> Self {
        self.features = Some(features);
        self
    }

    /// Sets the format version.
    #[must_use]
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Sets the automatic index interval.
    #[must_use]
    pub fn with_index_interval(mut self, records: u32) -> Self {
        self.index_interval = records;
        self
    }

    /// Sets the pid recorded in the label.
    #[must_use]
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Sets the archive start time.
    #[must_use]
    pub fn with_start(mut self, start: Timestamp) -> Self {
        self.start = Some(start);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidConfig`] for an unsupported version,
    /// an empty hostname, or a label string too long to encode.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(ArchiveError::InvalidConfig {
                reason: format!(
                    "unsupported version {}, expected one of {SUPPORTED_VERSIONS:?}",
                    self.version
                ),
            });
        }

        if self.hostname.is_empty() {
            return Err(ArchiveError::InvalidConfig {
                reason: "hostname cannot be empty".to_string(),
            });
        }

        let strings = [
            ("hostname", Some(&self.hostname)),
            ("timezone", Some(&self.timezone)),
            ("zoneinfo", self.zoneinfo.as_ref()),
        ];
        for (name, value) in strings {
            if let Some(value) = value
                && value.len() > usize::from(u16::MAX)
            {
                return Err(ArchiveError::InvalidConfig {
                    reason: format!("{name} is {} bytes, maximum {}", value.len(), u16::MAX),
                });
            }
        }

        Ok(())
    }
}

/// Whether the label has been written yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    /// Files exist but are empty.
    New,
    /// Labels written; records may follow.
    Initialized,
}

/// One open output file with its current size.
#[derive(Debug)]
struct OutputFile {
    path: PathBuf,
    file: File,
    offset: u64,
}

impl OutputFile {
    fn create(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    ArchiveError::AlreadyExists { path: path.clone() }
                } else {
                    ArchiveError::io(&path, 0, e)
                }
            })?;
        Ok(Self {
            path,
            file,
            offset: 0,
        })
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        frame
            .write_to(&mut self.file)
            .map_err(|e| ArchiveError::io(&self.path, self.offset, e))?;
        self.offset += frame.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file
            .flush()
            .and_then(|()| self.file.sync_data())
            .map_err(|e| ArchiveError::io(&self.path, self.offset, e))
    }
}

/// Appends to a new archive.
#[derive(Debug)]
pub struct ArchiveWriter {
    base: PathBuf,
    config: WriterConfig,
    state: WriterState,
    label: Option<ArchiveLabel>,
    meta: OutputFile,
    index: OutputFile,
    volume: OutputFile,
    volume_number: u32,
    records_since_index: u32,
    volume_has_records: bool,
    last_timestamp: Option<Timestamp>,
    closed: bool,
}

impl ArchiveWriter {
    /// Creates a new archive named `base`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidConfig`] for a bad config,
    /// [`ArchiveError::AlreadyExists`] if the metadata file, index or
    /// volume 0 already exists (compressed or not), and
    /// [`ArchiveError::Io`] if a file cannot be created. Files created
    /// before a failure are removed.
    pub fn create(base: impl AsRef<Path>, config: WriterConfig) -> Result<Self> {
        config.validate()?;
        let base = base.as_ref().to_path_buf();

        for kind in [FileKind::Meta, FileKind::Index, FileKind::Volume(0)] {
            if let Some(existing) = naming::resolve(&base, kind) {
                return Err(ArchiveError::AlreadyExists {
                    path: existing.path,
                });
            }
        }

        let mut created: Vec<OutputFile> = Vec::with_capacity(3);
        for kind in [FileKind::Meta, FileKind::Index, FileKind::Volume(0)] {
            match OutputFile::create(naming::file_name(&base, kind)) {
                Ok(file) => created.push(file),
                Err(error) => {
                    for file in &created {
                        if let Err(e) = std::fs::remove_file(&file.path) {
                            warn!(path = %file.path.display(), error = %e, "failed to remove partially created archive file");
                        }
                    }
                    return Err(error);
                }
            }
        }

        let mut created = created.into_iter();
        let (Some(meta), Some(index), Some(volume)) = (created.next(), created.next(), created.next())
        else {
            return Err(ArchiveError::InvalidConfig {
                reason: "archive files were not created".to_string(),
            });
        };

        debug!(base = %base.display(), version = config.version, "created archive");

        Ok(Self {
            base,
            config,
            state: WriterState::New,
            label: None,
            meta,
            index,
            volume,
            volume_number: 0,
            records_since_index: 0,
            volume_has_records: false,
            last_timestamp: None,
            closed: false,
        })
    }

    /// The archive's base name.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The label, once written.
    pub fn label(&self) -> Option<&ArchiveLabel> {
        self.label.as_ref()
    }

    /// The volume currently being appended to.
    pub fn volume(&self) -> u32 {
        self.volume_number
    }

    /// Current size of the volume being appended to.
    pub fn data_offset(&self) -> u64 {
        self.volume.offset
    }

    /// Appends a measurement (or mark) record.
    ///
    /// An index entry is written first when this is the first record of the
    /// volume or the automatic index interval has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Codec`] if the record cannot be encoded and
    /// [`ArchiveError::Io`] if a write fails.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        self.ensure_initialized(Some(record.timestamp))?;
        let frame = codec::encode(record, self.config.version)?;

        if let Some(last) = self.last_timestamp
            && record.timestamp < last
        {
            warn!(
                base = %self.base.display(),
                previous = %last,
                timestamp = %record.timestamp,
                "record timestamp goes backwards"
            );
        }

        let interval = self.config.index_interval;
        let index_due = interval > 0
            && (!self.volume_has_records || self.records_since_index >= interval)
            && self.last_timestamp.is_none_or(|last| record.timestamp >= last);
        if index_due {
            self.put_index(record.timestamp)?;
        }

        self.volume.write_frame(&frame)?;
        self.records_since_index += 1;
        self.volume_has_records = true;
        self.last_timestamp = Some(record.timestamp);
        Ok(())
    }

    /// Appends a mark record at `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if the write fails.
    pub fn put_mark(&mut self, timestamp: Timestamp) -> Result<()> {
        self.append(&Record::mark(timestamp))
    }

    /// Appends an opaque framed payload to the metadata file.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Codec`] for an oversized payload and
    /// [`ArchiveError::Io`] if the write fails.
    pub fn put_meta(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_initialized(None)?;
        let frame = codec::frame(payload, self.config.version)?;
        self.meta.write_frame(&frame)
    }

    /// Writes an index entry for `timestamp` at the current data and
    /// metadata offsets. The next record appended should not be older
    /// than `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if a write fails.
    pub fn put_index(&mut self, timestamp: Timestamp) -> Result<()> {
        self.ensure_initialized(Some(timestamp))?;
        self.meta.file.flush().map_err(|e| ArchiveError::io(&self.meta.path, self.meta.offset, e))?;
        self.volume.file.flush().map_err(|e| ArchiveError::io(&self.volume.path, self.volume.offset, e))?;

        let entry = IndexEntry {
            timestamp,
            volume: self.volume_number,
            meta_offset: self.meta.offset,
            data_offset: self.volume.offset,
        };
        let frame = entry.frame(self.config.version)?;
        self.index.write_frame(&frame)?;
        self.records_since_index = 0;
        Ok(())
    }

    /// Closes the current volume and starts the next one.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::AlreadyExists`] if the next volume file
    /// exists and [`ArchiveError::Io`] if it cannot be created.
    pub fn new_volume(&mut self) -> Result<u32> {
        self.ensure_initialized(None)?;
        let next = self.volume_number + 1;
        let mut volume = OutputFile::create(naming::file_name(&self.base, FileKind::Volume(next)))?;
        if let Some(label) = &self.label {
            let vol = i32::try_from(next).unwrap_or(i32::MAX);
            volume.write_frame(&label.frame(vol)?)?;
        }

        self.volume.sync()?;
        self.volume = volume;
        self.volume_number = next;
        self.volume_has_records = false;
        debug!(base = %self.base.display(), volume = next, "started new volume");
        Ok(next)
    }

    /// Writes the label if needed and flushes all files to disk.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if a write or sync fails.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_initialized(None)?;
        self.sync_all()
    }

    /// Flushes and closes the archive.
    ///
    /// An archive that never received a record or flush is left with
    /// empty files.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if the final sync fails.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        if self.state == WriterState::Initialized {
            self.sync_all()?;
        }
        debug!(base = %self.base.display(), "closed archive writer");
        Ok(())
    }

    fn sync_all(&mut self) -> Result<()> {
        self.meta.sync()?;
        self.index.sync()?;
        self.volume.sync()
    }

    /// Writes the label to the index, metadata file and current volume on
    /// first use. The start time is the configured start, else `hint`, else
    /// now.
    fn ensure_initialized(&mut self, hint: Option<Timestamp>) -> Result<()> {
        if self.state == WriterState::Initialized {
            return Ok(());
        }

        let start = self.config.start.or(hint).unwrap_or_else(Timestamp::now);
        let pid = self
            .config
            .pid
            .unwrap_or_else(|| i32::try_from(std::process::id()).unwrap_or(i32::MAX));
        let label = ArchiveLabel {
            version: self.config.version,
            pid,
            hostname: self.config.hostname.clone(),
            start,
            timezone: self.config.timezone.clone(),
            zoneinfo: self.config.zoneinfo.clone(),
            features: self.config.features,
        };

        self.index.write_frame(&label.frame(INDEX_VOL)?)?;
        self.meta.write_frame(&label.frame(META_VOL)?)?;
        let vol = i32::try_from(self.volume_number).unwrap_or(i32::MAX);
        self.volume.write_frame(&label.frame(vol)?)?;

        debug!(base = %self.base.display(), %start, "wrote archive labels");
        self.label = Some(label);
        self.state = WriterState::Initialized;
        Ok(())
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if self.closed || self.state == WriterState::New {
            return;
        }
        if let Err(error) = self.sync_all() {
            warn!(base = %self.base.display(), %error, "failed to sync archive on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TemporalIndex;
    use crate::naming::ResolvedFile;
    use crate::record::{InsituValue, ValueSet, Values};

    fn sample(sec: i64) -> Record {
        Record::new(
            Timestamp::from_secs(sec),
            vec![ValueSet {
                pmid: 1,
                values: Values::Insitu(vec![InsituValue {
                    inst: 0,
                    value: u32::try_from(sec).unwrap(),
                }]),
            }],
        )
    }

    #[test]
    fn test_config_validation() {
        assert!(WriterConfig::default().validate().is_ok());
        assert!(WriterConfig::new("h").with_version(3).validate().is_err());
        assert!(WriterConfig::new("").validate().is_err());
        assert!(
            WriterConfig::new("h")
                .with_timezone("x".repeat(70_000))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: WriterConfig =
            serde_json::from_str(r#"{"hostname": "db1", "index_interval": 5}"#).unwrap();
        assert_eq!(config.hostname, "db1");
        assert_eq!(config.index_interval, 5);
        assert_eq!(config.version, CURRENT_VERSION);
    }

    #[test]
    fn test_create_refuses_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("arch");
        std::fs::write(naming::file_name(&base, FileKind::Index), b"").unwrap();

        let err = ArchiveWriter::create(&base, WriterConfig::new("h")).unwrap_err();
        assert!(matches!(err, ArchiveError::AlreadyExists { .. }));
        assert!(!naming::file_name(&base, FileKind::Meta).exists());
    }

    #[test]
    fn test_nothing_written_before_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("arch");
        let writer = ArchiveWriter::create(&base, WriterConfig::new("h")).unwrap();
        assert!(writer.label().is_none());
        writer.close().unwrap();

        let len = std::fs::metadata(naming::file_name(&base, FileKind::Meta)).unwrap().len();
        assert_eq!(len, 0);
    }

    #[test]
    fn test_label_start_from_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("arch");
        let mut writer = ArchiveWriter::create(&base, WriterConfig::new("h").with_pid(77)).unwrap();
        writer.append(&sample(500)).unwrap();
        let label = writer.label().unwrap();
        assert_eq!(label.start, Timestamp::from_secs(500));
        assert_eq!(label.pid, 77);
    }

    #[test]
    fn test_automatic_index_entries() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("arch");
        let mut writer =
            ArchiveWriter::create(&base, WriterConfig::new("h").with_index_interval(2)).unwrap();
        for sec in [100, 200, 300, 400, 500] {
            writer.append(&sample(sec)).unwrap();
        }
        writer.new_volume().unwrap();
        writer.append(&sample(600)).unwrap();
        writer.close().unwrap();

        let index = TemporalIndex::load(&ResolvedFile {
            path: naming::file_name(&base, FileKind::Index),
            compressed: false,
        })
        .unwrap();
        let stamps: Vec<(i64, u32)> = index
            .entries()
            .iter()
            .map(|e| (e.timestamp.sec, e.volume))
            .collect();
        assert_eq!(stamps, vec![(100, 0), (300, 0), (500, 0), (600, 1)]);
    }

    #[test]
    fn test_manual_index_only_with_zero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("arch");
        let mut writer =
            ArchiveWriter::create(&base, WriterConfig::new("h").with_index_interval(0)).unwrap();
        writer.append(&sample(100)).unwrap();
        writer.put_index(Timestamp::from_secs(150)).unwrap();
        writer.append(&sample(200)).unwrap();
        writer.close().unwrap();

        let index = TemporalIndex::load(&ResolvedFile {
            path: naming::file_name(&base, FileKind::Index),
            compressed: false,
        })
        .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries()[0].timestamp, Timestamp::from_secs(150));
    }

    #[test]
    fn test_version_one_bytes_match_version_two() {
        let dir = tempfile::tempdir().unwrap();
        let mut sizes = Vec::new();
        for version in [1u8, 2] {
            let base = dir.path().join(format!("v{version}"));
            let config = WriterConfig::new("h")
                .with_version(version)
                .with_pid(1)
                .with_start(Timestamp::from_secs(1));
            let mut writer = ArchiveWriter::create(&base, config).unwrap();
            writer.append(&sample(100)).unwrap();
            writer.put_meta(b"opaque metadata").unwrap();
            sizes.push(writer.data_offset());
            writer.close().unwrap();
        }
        assert_eq!(sizes[0], sizes[1]);
    }
}
