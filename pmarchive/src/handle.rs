//! Shared, read-only access to one archive.
//!
//! An [`ArchiveHandle`] owns everything that can be shared between reading
//! sessions: the validated label, the temporal index, the open volume files
//! and a per-volume cache of where the last valid record ends. Contexts hold
//! it through an [`Arc`]; the files are closed when the last reference is
//! dropped.
//!
//! Volumes are opened lazily. The volume map lock is only held while looking
//! up or opening a volume; each open volume has its own lock, held across
//! every seek-then-read pair on its file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::context::Direction;
use crate::error::{ArchiveError, Result};
use crate::index::TemporalIndex;
use crate::label::{ArchiveLabel, META_VOL};
use crate::naming::{self, ArchiveFiles, FileKind, ResolvedFile};
use crate::record::Timestamp;
use crate::volume::{ReadOutcome, Source, VolumeFile};

/// The last valid record of one volume, valid while the volume keeps the
/// physical size it had when the tail was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TailCache {
    pub(crate) physical_size: u64,
    /// Timestamp of the last valid record and the offset just past it.
    pub(crate) last: Option<(Timestamp, u64)>,
}

/// An open archive.
#[derive(Debug)]
pub struct ArchiveHandle {
    base: PathBuf,
    label: ArchiveLabel,
    files: ArchiveFiles,
    index: TemporalIndex,
    volumes: Mutex<BTreeMap<u32, Arc<Mutex<VolumeFile>>>>,
    pub(crate) tails: Mutex<BTreeMap<u32, TailCache>>,
}

impl ArchiveHandle {
    /// Opens the archive named by `path`.
    ///
    /// `path` may be the base name or any file of the archive
    /// (`base.meta`, `base.index`, `base.N`, or a compressed variant).
    /// The labels of the metadata file, the index and the lowest volume
    /// must agree on version, pid and hostname, and each must be stamped
    /// with the file it lives in.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NotFound`] if the metadata file or every
    /// volume is missing, a [`crate::error::LabelError`] if the labels
    /// disagree, and [`ArchiveError::Io`] if a file cannot be read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let base = naming::base_name(path.as_ref());
        let files = naming::scan(&base)?;

        let meta = files.meta.clone().ok_or_else(|| ArchiveError::NotFound {
            path: naming::file_name(&base, FileKind::Meta),
        })?;
        let mut meta_source = Source::open(&meta)?;
        let (label, vol, _) = ArchiveLabel::read_from(&mut meta_source, &meta.path)?;
        ArchiveLabel::check_file(&meta.path, META_VOL, vol)?;

        let index = match &files.index {
            Some(file) => {
                let index = TemporalIndex::load(file)?;
                if let Some(index_label) = index.label() {
                    label.check_same(index_label, &meta.path, &file.path)?;
                }
                index
            }
            None => {
                debug!(base = %base.display(), "archive has no index, seeks will scan");
                TemporalIndex::empty()
            }
        };

        let (first_number, first_file) = files
            .volumes
            .iter()
            .next()
            .map(|(n, f)| (*n, f.clone()))
            .ok_or_else(|| ArchiveError::NotFound {
                path: naming::file_name(&base, FileKind::Volume(0)),
            })?;
        let (first, first_label) = VolumeFile::open(&first_file, first_number)?;
        label.check_same(&first_label, &meta.path, &first_file.path)?;

        debug!(
            base = %base.display(),
            host = %label.hostname,
            start = %label.start,
            min_volume = first_number,
            max_volume = files.max_volume().unwrap_or(first_number),
            index_entries = index.len(),
            "opened archive"
        );

        let mut volumes = BTreeMap::new();
        volumes.insert(first_number, Arc::new(Mutex::new(first)));

        Ok(Self {
            base,
            label,
            files,
            index,
            volumes: Mutex::new(volumes),
            tails: Mutex::new(BTreeMap::new()),
        })
    }

    /// The archive's base name.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The archive label.
    pub fn label(&self) -> &ArchiveLabel {
        &self.label
    }

    /// Start time from the label.
    pub fn start(&self) -> Timestamp {
        self.label.start
    }

    /// The temporal index.
    pub fn index(&self) -> &TemporalIndex {
        &self.index
    }

    /// The files found when the archive was opened.
    pub fn files(&self) -> &ArchiveFiles {
        &self.files
    }

    /// Lowest volume number.
    pub fn min_volume(&self) -> u32 {
        self.files.min_volume().unwrap_or(0)
    }

    /// Highest volume number.
    pub fn max_volume(&self) -> u32 {
        self.files.max_volume().unwrap_or(0)
    }

    /// Volume numbers present, lowest first.
    pub fn volume_numbers(&self) -> impl DoubleEndedIterator<Item = u32> + '_ {
        self.files.volumes.keys().copied()
    }

    /// The next present volume after (forward) or before (backward) `volume`.
    pub fn next_volume(&self, volume: u32, direction: Direction) -> Option<u32> {
        match direction {
            Direction::Forward => self
                .files
                .volumes
                .range(volume.checked_add(1)?..)
                .next()
                .map(|(n, _)| *n),
            Direction::Backward => self
                .files
                .volumes
                .range(..volume)
                .next_back()
                .map(|(n, _)| *n),
        }
    }

    /// Returns the open volume `number`, opening it on first use.
    ///
    /// Returns `Ok(None)` if the volume does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be opened or its label does
    /// not match the archive.
    pub fn volume(&self, number: u32) -> Result<Option<Arc<Mutex<VolumeFile>>>> {
        let mut volumes = self.volumes.lock();
        if let Some(volume) = volumes.get(&number) {
            return Ok(Some(Arc::clone(volume)));
        }
        let Some(file) = self.files.volumes.get(&number) else {
            return Ok(None);
        };

        let (volume, label) = VolumeFile::open(file, number)?;
        self.label.check_same(
            &label,
            &naming::file_name(&self.base, FileKind::Meta),
            &file.path,
        )?;
        debug!(path = %file.path.display(), volume = number, "opened volume");

        let volume = Arc::new(Mutex::new(volume));
        volumes.insert(number, Arc::clone(&volume));
        Ok(Some(volume))
    }

    /// Runs `f` with exclusive access to volume `number`.
    ///
    /// Returns `Ok(None)` if the volume does not exist.
    ///
    /// # Errors
    ///
    /// Returns any error from opening the volume or from `f`.
    pub fn with_volume<T>(
        &self,
        number: u32,
        f: impl FnOnce(&mut VolumeFile) -> Result<T>,
    ) -> Result<Option<T>> {
        let Some(volume) = self.volume(number)? else {
            return Ok(None);
        };
        let mut volume = volume.lock();
        f(&mut volume).map(Some)
    }

    /// Reads one record from `volume` at `offset`.
    ///
    /// A missing volume reads as [`ReadOutcome::EndOfVolume`].
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::CorruptRecord`] or [`ArchiveError::Io`].
    pub fn read_record(
        &self,
        volume: u32,
        offset: u64,
        direction: Direction,
        paranoid: bool,
    ) -> Result<ReadOutcome> {
        Ok(self
            .with_volume(volume, |v| v.read_record(offset, direction, paranoid))?
            .unwrap_or(ReadOutcome::EndOfVolume))
    }

    /// Returns `(data_start, physical_size)` of a volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be opened or sized.
    pub fn volume_bounds(&self, number: u32) -> Result<Option<(u64, u64)>> {
        self.with_volume(number, |v| Ok((v.data_start(), v.len()?)))
    }

    /// Reads raw bytes from one of the archive's files.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NotFound`] if the file does not exist and
    /// [`ArchiveError::Io`] if the range cannot be read.
    pub fn read_raw(&self, kind: FileKind, offset: u64, len: usize) -> Result<Vec<u8>> {
        if let FileKind::Volume(n) = kind {
            return self
                .with_volume(n, |v| v.read_range(offset, len))?
                .ok_or_else(|| ArchiveError::NotFound {
                    path: naming::file_name(&self.base, kind),
                });
        }

        let file = self.resolved_file(kind)?;
        let mut source = Source::open(file)?;
        let mut buf = vec![0u8; len];
        source.read_at(&file.path, offset, &mut buf)?;
        Ok(buf)
    }

    /// Physical size of one of the archive's files.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NotFound`] if the file does not exist and
    /// [`ArchiveError::Io`] if it cannot be sized.
    pub fn file_len(&self, kind: FileKind) -> Result<u64> {
        match kind {
            FileKind::Volume(n) => self
                .volume_bounds(n)?
                .map(|(_, len)| len)
                .ok_or_else(|| ArchiveError::NotFound {
                    path: naming::file_name(&self.base, kind),
                }),
            FileKind::Meta | FileKind::Index => {
                let file = self.resolved_file(kind)?;
                Source::open(file)?.len(&file.path)
            }
        }
    }

    /// The on-disk file of `kind`.
    fn resolved_file(&self, kind: FileKind) -> Result<&ResolvedFile> {
        match kind {
            FileKind::Meta => self.files.meta.as_ref(),
            FileKind::Index => self.files.index.as_ref(),
            FileKind::Volume(n) => self.files.volumes.get(&n),
        }
        .ok_or_else(|| ArchiveError::NotFound {
            path: naming::file_name(&self.base, kind),
        })
    }
}

impl Drop for ArchiveHandle {
    fn drop(&mut self) {
        debug!(base = %self.base.display(), "closing archive");
    }
}
