//! Error types for the pmarchive storage engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::record::Timestamp;

/// The main error type for all archive operations.
///
/// Read-path errors carry the archive file and byte offset involved so that
/// callers can report exactly where a problem was found.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// A required archive file does not exist.
    #[error("archive file not found: '{}'", path.display())]
    NotFound {
        /// The file (or base name) that could not be found.
        path: PathBuf,
    },

    /// Refused to create an archive over an existing file.
    #[error("archive file already exists, not overwritten: '{}'", path.display())]
    AlreadyExists {
        /// The file that already exists.
        path: PathBuf,
    },

    /// Label validation failed.
    #[error("label error: {0}")]
    Label(#[from] LabelError),

    /// A framed record in an archive file failed validation.
    #[error("corrupt record in '{}' at offset {offset}: {source}", path.display())]
    CorruptRecord {
        /// The archive file holding the record.
        path: PathBuf,
        /// Byte offset of the record frame.
        offset: u64,
        /// What was wrong with the record.
        #[source]
        source: CodecError,
    },

    /// Encoding or decoding failed outside of any particular file.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No more records in the requested direction across the whole chain.
    #[error("end of archive log")]
    EndOfLog,

    /// Two chained archives cover overlapping time ranges.
    #[error(
        "archives overlap: '{}' ends at {previous_end} but '{}' starts at {next_start}",
        previous.display(),
        next.display()
    )]
    LogOverlap {
        /// The earlier archive in chain order.
        previous: PathBuf,
        /// The later archive in chain order.
        next: PathBuf,
        /// End of the earlier archive.
        previous_end: Timestamp,
        /// Start of the later archive.
        next_start: Timestamp,
    },

    /// An I/O operation on an archive file failed.
    #[error("I/O error on '{}' at offset {offset}: {source}", path.display())]
    Io {
        /// The file being accessed.
        path: PathBuf,
        /// Byte offset of the failed operation.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of what is invalid.
        reason: String,
    },

    /// Error during upload operations.
    #[cfg(feature = "upload")]
    #[error("upload error: {0}")]
    Upload(#[from] UploadError),
}

impl ArchiveError {
    /// Returns `true` for the expected end-of-iteration condition.
    pub fn is_end_of_log(&self) -> bool {
        matches!(self, Self::EndOfLog)
    }

    /// Builds an [`ArchiveError::Io`] for `path` at `offset`.
    pub(crate) fn io(path: impl Into<PathBuf>, offset: u64, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            offset,
            source,
        }
    }

    /// Builds an [`ArchiveError::CorruptRecord`] for `path` at `offset`.
    pub(crate) fn corrupt(path: impl Into<PathBuf>, offset: u64, source: CodecError) -> Self {
        Self::CorruptRecord {
            path: path.into(),
            offset,
            source,
        }
    }
}

/// Errors produced while framing or decoding a single record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The record is shorter than its minimum fixed layout.
    #[error("record too small: {len} bytes (minimum {min})")]
    TooSmall {
        /// The actual length.
        len: usize,
        /// The minimum acceptable length.
        min: usize,
    },

    /// The record is longer than any record this engine will read or write.
    #[error("record too big: {len} bytes (maximum {max})")]
    TooBig {
        /// The declared or actual length.
        len: usize,
        /// The maximum acceptable length.
        max: usize,
    },

    /// Header and trailer length words disagree.
    #[error("record length mismatch: header {header} != trailer {trailer}")]
    LengthMismatch {
        /// The header length word.
        header: u32,
        /// The trailer length word.
        trailer: u32,
    },

    /// The payload structure is inconsistent with its declared lengths.
    #[error("malformed record: {reason}")]
    Malformed {
        /// Description of the inconsistency.
        reason: String,
    },
}

impl CodecError {
    /// Shorthand for [`CodecError::Malformed`].
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Errors raised while reading or cross-checking archive labels.
#[derive(Error, Debug)]
pub enum LabelError {
    /// The label magic number is wrong.
    #[error("bad label magic in '{}': {magic:#010x}", path.display())]
    BadMagic {
        /// The file holding the label.
        path: PathBuf,
        /// The magic word found.
        magic: u32,
    },

    /// The label format version is not supported.
    #[error("unsupported label version {version} in '{}'", path.display())]
    UnsupportedVersion {
        /// The file holding the label.
        path: PathBuf,
        /// The version found.
        version: u8,
    },

    /// The label belongs to a different file of the archive.
    #[error("label in '{}' is stamped for file {found}, expected {expected}", path.display())]
    WrongFile {
        /// The file holding the label.
        path: PathBuf,
        /// The file number the label should carry.
        expected: i32,
        /// The file number the label does carry.
        found: i32,
    },

    /// Labels of files of one archive (or of chained archives) disagree.
    #[error("label mismatch between '{}' and '{}': {reason}", first.display(), second.display())]
    Mismatch {
        /// The file holding the reference label.
        first: PathBuf,
        /// The file holding the disagreeing label.
        second: PathBuf,
        /// What differs.
        reason: String,
    },

    /// The label record could not be read or decoded.
    #[error("unreadable label in '{}': {source}", path.display())]
    Unreadable {
        /// The file holding the label.
        path: PathBuf,
        /// What was wrong with the label record.
        #[source]
        source: CodecError,
    },

    /// The archive has no label yet (nothing was ever flushed).
    #[error("archive file '{}' has no label", path.display())]
    Missing {
        /// The empty file.
        path: PathBuf,
    },
}

/// Errors that can occur while uploading an archive.
#[cfg(feature = "upload")]
#[derive(Error, Debug)]
pub enum UploadError {
    /// Failed to compress a request body with Snappy.
    #[error("failed to compress upload body: {source}")]
    Compression {
        /// The snappy compression error.
        #[source]
        source: snap::Error,
    },

    /// Failed to create HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// HTTP request failed after retries.
    #[error("HTTP request failed: {source}")]
    RequestFailed {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Server returned non-2xx status after retries.
    #[error("server returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// The label upload did not return an archive identifier.
    #[error("ingestion endpoint returned no archive identifier")]
    MissingArchiveId,
}

/// Type alias for `Result<T, ArchiveError>`.
pub type Result<T> = std::result::Result<T, ArchiveError>;
