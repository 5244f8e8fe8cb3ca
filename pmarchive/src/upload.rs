//! Pushing archives to a remote ingestion endpoint.
//!
//! The label is sent first and the endpoint answers with an archive id.
//! The metadata file, the index and every volume are then sent as raw byte
//! ranges (past their labels), each tagged with the file and offset it came
//! from so the receiver can reassemble the archive. Bodies are
//! snappy-compressed and retried with exponential backoff.
//!
//! This module is only available when the `upload` feature is enabled.
//!
//! # Example
//!
//! ```rust,no_run
//! use pmarchive::ArchiveHandle;
//! use pmarchive::upload::{push, UploadConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = ArchiveHandle::open("/var/log/pcp/pmlogger/web1/20240101")?;
//! let config = UploadConfig::new("http://ingest.example.com/api/v1")
//!     .with_header("Authorization", "Bearer token");
//! let summary = push(&config, &handle)?;
//! println!("uploaded {} bytes as {}", summary.bytes, summary.archive_id);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ArchiveError, Result, UploadError};
use crate::handle::ArchiveHandle;
use crate::label::{INDEX_VOL, META_VOL};
use crate::naming::FileKind;

/// Configuration for an ingestion endpoint.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Base URL of the ingestion API (e.g., `http://localhost:8080/api/v1`).
    pub endpoint: String,
    /// HTTP timeout for each request.
    pub timeout: Duration,
    /// Maximum number of retry attempts on failure.
    pub max_retries: u32,
    /// Initial backoff duration between retries (doubles each attempt).
    pub retry_backoff: Duration,
    /// Largest byte range sent in one request.
    pub chunk_size: u64,
    /// Optional HTTP headers (e.g., for authentication).
    pub headers: Vec<(String, String)>,
}

impl UploadConfig {
    /// Creates a new config with sensible defaults.
    ///
    /// Defaults: 30s timeout, 3 retries, 100ms initial backoff, 4 MiB chunks.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            chunk_size: 4 * 1024 * 1024,
            headers: Vec::new(),
        }
    }

    /// Adds an HTTP header (e.g., for authentication tokens).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the HTTP timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial retry backoff.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the largest byte range sent per request (at least 1).
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

/// One byte range of one archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadChunk {
    /// The file the range belongs to.
    pub kind: FileKind,
    /// Offset of the first byte.
    pub offset: u64,
    /// Number of bytes.
    pub len: u64,
}

impl UploadChunk {
    /// Endpoint path for this chunk, relative to the archive.
    pub fn path(&self) -> String {
        let file = match self.kind {
            FileKind::Meta => "meta".to_string(),
            FileKind::Index => "index".to_string(),
            FileKind::Volume(n) => format!("volume/{n}"),
        };
        format!("{file}?offset={}", self.offset)
    }
}

/// Everything to send for one archive, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    /// The framed label, as stored at the start of the metadata file.
    pub label: Vec<u8>,
    /// Byte ranges of the metadata file, index and volumes.
    pub chunks: Vec<UploadChunk>,
}

impl UploadPlan {
    /// Builds the plan for an open archive: metadata, index, then volumes
    /// lowest first, each split into ranges of at most `chunk_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be sized.
    pub fn for_archive(handle: &ArchiveHandle, chunk_size: u64) -> Result<Self> {
        let label = handle.label().frame(META_VOL)?.to_bytes();
        let chunk_size = chunk_size.max(1);
        let mut chunks = Vec::new();

        let mut add = |kind: FileKind, start: u64, end: u64| {
            let mut offset = start;
            while offset < end {
                let len = chunk_size.min(end - offset);
                chunks.push(UploadChunk { kind, offset, len });
                offset += len;
            }
        };

        add(FileKind::Meta, label.len() as u64, handle.file_len(FileKind::Meta)?);
        if handle.files().index.is_some() {
            let index_label = handle.label().frame(INDEX_VOL)?.len() as u64;
            add(FileKind::Index, index_label, handle.file_len(FileKind::Index)?);
        }
        for number in handle.volume_numbers() {
            if let Some((data_start, len)) = handle.volume_bounds(number)? {
                add(FileKind::Volume(number), data_start, len);
            }
        }

        Ok(Self { label, chunks })
    }

    /// Total bytes in all chunks.
    pub fn data_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.len).sum()
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    /// Identifier assigned by the endpoint.
    pub archive_id: String,
    /// Number of chunk requests sent.
    pub chunks: usize,
    /// Uncompressed bytes sent, label included.
    pub bytes: u64,
}

/// Uploads an archive.
///
/// # Errors
///
/// Returns [`UploadError`] if a request fails after all retries or the
/// endpoint assigns no archive id, and any error from reading the archive.
pub fn push(config: &UploadConfig, handle: &ArchiveHandle) -> Result<UploadSummary> {
    let plan = UploadPlan::for_archive(handle, config.chunk_size)?;
    let client = reqwest::blocking::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| UploadError::ClientCreate { source: e })?;

    let response = send_with_retry(
        &client,
        config,
        &format!("{}/archives", config.endpoint),
        &compress_snappy(&plan.label)?,
    )?;
    let archive_id = response.trim().to_string();
    if archive_id.is_empty() {
        return Err(UploadError::MissingArchiveId.into());
    }
    debug!(base = %handle.base().display(), %archive_id, chunks = plan.chunks.len(), "uploading archive");

    for chunk in &plan.chunks {
        let len = usize::try_from(chunk.len).map_err(|_| ArchiveError::InvalidConfig {
            reason: format!("chunk of {} bytes does not fit in memory", chunk.len),
        })?;
        let bytes = handle.read_raw(chunk.kind, chunk.offset, len)?;
        let url = format!("{}/archives/{archive_id}/{}", config.endpoint, chunk.path());
        send_with_retry(&client, config, &url, &compress_snappy(&bytes)?)?;
    }

    Ok(UploadSummary {
        archive_id,
        chunks: plan.chunks.len(),
        bytes: plan.label.len() as u64 + plan.data_bytes(),
    })
}

/// Compresses bytes using Snappy.
fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = snap::raw::Encoder::new();
    encoder
        .compress_vec(data)
        .map_err(|e| UploadError::Compression { source: e })
        .map_err(Into::into)
}

/// POSTs a compressed body with exponential backoff retry, returning the
/// response body of the first successful attempt.
fn send_with_retry(
    client: &reqwest::blocking::Client,
    config: &UploadConfig,
    url: &str,
    body: &[u8],
) -> Result<String> {
    let mut backoff = config.retry_backoff;
    let mut attempt = 0;

    loop {
        let mut request = client
            .post(url)
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/octet-stream");

        for (name, value) in &config.headers {
            request = request.header(name, value);
        }

        let error = match request.body(body.to_vec()).send() {
            Ok(resp) if resp.status().is_success() => {
                return resp
                    .text()
                    .map_err(|e| UploadError::RequestFailed { source: e }.into());
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().unwrap_or_default();
                UploadError::HttpStatus { status, body }
            }
            Err(e) => UploadError::RequestFailed { source: e },
        };

        if attempt >= config.max_retries {
            return Err(error.into());
        }
        warn!(url, attempt, %error, "upload request failed, retrying");
        std::thread::sleep(backoff);
        backoff *= 2;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, Timestamp};
    use crate::writer::{ArchiveWriter, WriterConfig};

    fn write_archive(dir: &std::path::Path) -> std::path::PathBuf {
        let base = dir.join("arch");
        let mut writer = ArchiveWriter::create(&base, WriterConfig::new("up-host")).unwrap();
        for sec in 0..10 {
            writer.put_mark(Timestamp::from_secs(100 + sec)).unwrap();
        }
        writer.put_meta(&[1, 2, 3, 4]).unwrap();
        writer.new_volume().unwrap();
        writer.append(&Record::mark(Timestamp::from_secs(500))).unwrap();
        writer.close().unwrap();
        base
    }

    #[test]
    fn test_config_defaults() {
        let config = UploadConfig::new("http://localhost:8080/api/");
        assert_eq!(config.endpoint, "http://localhost:8080/api");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff, Duration::from_millis(100));
        assert!(config.headers.is_empty());
        assert_eq!(config.with_chunk_size(0).chunk_size, 1);
    }

    #[test]
    fn test_chunk_paths() {
        let chunk = |kind| UploadChunk {
            kind,
            offset: 64,
            len: 1,
        };
        assert_eq!(chunk(FileKind::Meta).path(), "meta?offset=64");
        assert_eq!(chunk(FileKind::Index).path(), "index?offset=64");
        assert_eq!(chunk(FileKind::Volume(3)).path(), "volume/3?offset=64");
    }

    #[test]
    fn test_plan_covers_files_past_labels() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_archive(dir.path());
        let handle = ArchiveHandle::open(&base).unwrap();

        let plan = UploadPlan::for_archive(&handle, u64::MAX).unwrap();
        let kinds: Vec<FileKind> = plan.chunks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![FileKind::Meta, FileKind::Index, FileKind::Volume(0), FileKind::Volume(1)]
        );
        assert_eq!(plan.chunks[0].offset, plan.label.len() as u64);

        // Each volume range starts with a readable record frame.
        let volume_chunk = plan.chunks[2];
        let bytes = handle
            .read_raw(volume_chunk.kind, volume_chunk.offset, 24)
            .unwrap();
        assert_eq!(
            crate::codec::decode(&bytes).unwrap().timestamp,
            Timestamp::from_secs(100)
        );
    }

    #[test]
    fn test_plan_splits_large_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_archive(dir.path());
        let handle = ArchiveHandle::open(&base).unwrap();

        let whole = UploadPlan::for_archive(&handle, u64::MAX).unwrap();
        let split = UploadPlan::for_archive(&handle, 50).unwrap();
        assert!(split.chunks.len() > whole.chunks.len());
        assert!(split.chunks.iter().all(|c| c.len <= 50));
        assert_eq!(split.data_bytes(), whole.data_bytes());
    }

    #[test]
    fn test_push_unreachable_endpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_archive(dir.path());
        let handle = ArchiveHandle::open(&base).unwrap();

        let config = UploadConfig::new("http://127.0.0.1:9")
            .with_max_retries(0)
            .with_timeout(Duration::from_secs(2));
        let err = push(&config, &handle).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Upload(UploadError::RequestFailed { .. })
        ));
    }

    #[test]
    fn test_compress_snappy_roundtrip() {
        let data = b"archive bytes archive bytes archive bytes";
        let compressed = compress_snappy(data).unwrap();
        let mut decoder = snap::raw::Decoder::new();
        assert_eq!(decoder.decompress_vec(&compressed).unwrap(), data);
    }
}
