//! Data volume access.
//!
//! A [`VolumeFile`] reads single framed records from one data volume at a
//! given offset, walking forward or backward. A frame that extends past the
//! current physical end of the file is treated as not yet written: the read
//! reports [`ReadOutcome::EndOfVolume`] instead of an error, so readers can
//! follow a volume that is still being appended to.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::codec::{self, LEN_WORD, MIN_FRAME_LEN};
use crate::context::Direction;
use crate::error::{ArchiveError, CodecError, Result};
use crate::label::ArchiveLabel;
use crate::naming::ResolvedFile;
use crate::record::{self, Record};

/// Byte source backing an archive file.
#[derive(Debug)]
pub(crate) enum Source {
    /// An uncompressed file read in place.
    Plain(File),
    /// A compressed file decompressed into memory.
    Decompressed(Cursor<Vec<u8>>),
}

impl Source {
    /// Opens a resolved archive file.
    pub(crate) fn open(file: &ResolvedFile) -> Result<Self> {
        if file.compressed {
            return Ok(Self::Decompressed(Cursor::new(file.decompress()?)));
        }
        File::open(&file.path)
            .map(Self::Plain)
            .map_err(|e| ArchiveError::io(&file.path, 0, e))
    }

    /// Current physical size.
    pub(crate) fn len(&self, path: &Path) -> Result<u64> {
        match self {
            Self::Plain(file) => file
                .metadata()
                .map(|m| m.len())
                .map_err(|e| ArchiveError::io(path, 0, e)),
            Self::Decompressed(cursor) => Ok(cursor.get_ref().len() as u64),
        }
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub(crate) fn read_at(&mut self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(SeekFrom::Start(offset))
            .map_err(|e| ArchiveError::io(path, offset, e))?;
        self.read_exact(buf)
            .map_err(|e| ArchiveError::io(path, offset, e))
    }
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(file) => file.read(buf),
            Self::Decompressed(cursor) => cursor.read(buf),
        }
    }
}

impl Seek for Source {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            Self::Plain(file) => file.seek(pos),
            Self::Decompressed(cursor) => cursor.seek(pos),
        }
    }
}

/// Result of reading one record from a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete record.
    Record {
        /// The decoded record.
        record: Record,
        /// Offset of the frame's first byte.
        start: u64,
        /// Offset just past the frame's last byte.
        end: u64,
    },
    /// No complete record in the requested direction.
    EndOfVolume,
}

/// One open data volume.
#[derive(Debug)]
pub struct VolumeFile {
    number: u32,
    path: PathBuf,
    source: Source,
    data_start: u64,
}

impl VolumeFile {
    /// Opens volume `number` and reads its label.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if the file cannot be opened, or a label
    /// error if its label is unreadable or stamped for another file.
    pub fn open(file: &ResolvedFile, number: u32) -> Result<(Self, ArchiveLabel)> {
        let mut source = Source::open(file)?;
        let (label, vol, data_start) = ArchiveLabel::read_from(&mut source, &file.path)?;
        ArchiveLabel::check_file(&file.path, i32::try_from(number).unwrap_or(i32::MAX), vol)?;
        let volume = Self {
            number,
            path: file.path.clone(),
            source,
            data_start,
        };
        Ok((volume, label))
    }

    /// The volume number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Path of the volume file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the first record, just past the label.
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Current physical size of the volume.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if the size cannot be determined.
    pub fn len(&self) -> Result<u64> {
        self.source.len(&self.path)
    }

    /// Returns `true` if the volume holds nothing past its label.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if the size cannot be determined.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= self.data_start)
    }

    /// Reads raw bytes `[offset, offset + len)`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if the range cannot be read.
    pub fn read_range(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.source.read_at(&self.path, offset, &mut buf)?;
        Ok(buf)
    }

    /// Reads the record starting (forward) or ending (backward) at `offset`.
    ///
    /// With `paranoid` set, the payload is structurally validated with
    /// [`record::check_paranoid`] before decoding.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::CorruptRecord`] for a frame that is complete
    /// but invalid, and [`ArchiveError::Io`] if the read fails.
    pub fn read_record(
        &mut self,
        offset: u64,
        direction: Direction,
        paranoid: bool,
    ) -> Result<ReadOutcome> {
        let physical = self.len()?;
        let (start, len) = match direction {
            Direction::Forward => {
                if offset + LEN_WORD as u64 > physical {
                    return Ok(ReadOutcome::EndOfVolume);
                }
                let len = self.length_word(offset)?;
                if offset + len > physical {
                    return Ok(ReadOutcome::EndOfVolume);
                }
                (offset, len)
            }
            Direction::Backward => {
                if offset <= self.data_start {
                    return Ok(ReadOutcome::EndOfVolume);
                }
                let available = offset - self.data_start;
                if available < LEN_WORD as u64 {
                    return Err(self.corrupt(
                        offset,
                        CodecError::TooSmall {
                            len: usize::try_from(available).unwrap_or(0),
                            min: MIN_FRAME_LEN,
                        },
                    ));
                }
                let len = self.length_word(offset - LEN_WORD as u64)?;
                if len > available {
                    return Err(self.corrupt(
                        offset,
                        CodecError::malformed(format!(
                            "{len}-byte record ending at {offset} starts before the first record at {}",
                            self.data_start
                        )),
                    ));
                }
                (offset - len, len)
            }
        };

        let end = start + len;
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_LEN
        let mut frame = vec![0u8; len as usize];
        self.source.read_at(&self.path, start, &mut frame)?;

        let payload =
            codec::unframe(&frame, MIN_FRAME_LEN).map_err(|e| self.corrupt(start, e))?;
        if paranoid {
            record::check_paranoid(payload).map_err(|e| self.corrupt(start, e))?;
        }
        let record = Record::decode_payload(payload).map_err(|e| self.corrupt(start, e))?;

        Ok(ReadOutcome::Record { record, start, end })
    }

    /// Reads and validates the length word at `at`.
    fn length_word(&mut self, at: u64) -> Result<u64> {
        let mut word = [0u8; LEN_WORD];
        self.source.read_at(&self.path, at, &mut word)?;
        let len = codec::check_frame_len(BigEndian::read_u32(&word), MIN_FRAME_LEN)
            .map_err(|e| self.corrupt(at, e))?;
        Ok(len as u64)
    }

    fn corrupt(&self, offset: u64, source: CodecError) -> ArchiveError {
        ArchiveError::corrupt(&self.path, offset, source)
    }
}
