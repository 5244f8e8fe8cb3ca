//! Length-prefixed record framing.
//!
//! Every record in every archive file (labels, index entries, metadata and
//! measurement records) is stored as a frame:
//!
//! ```text
//! [u32 len][payload][u32 len]      len = payload length + 8, big-endian
//! ```
//!
//! The trailing copy of the length lets readers walk a file backward. A
//! frame whose header and trailer disagree is corrupt, and a frame that
//! extends past the end of a file is a write still in progress.

use std::io::Write;

use byteorder::{BigEndian, ByteOrder};

use crate::error::CodecError;
use crate::record::{MIN_PAYLOAD_SIZE, Record};

/// Bytes of framing around each payload (header plus trailer).
pub const FRAME_OVERHEAD: usize = 8;

/// Size of one length word.
pub const LEN_WORD: usize = 4;

/// Smallest valid record frame.
pub const MIN_FRAME_LEN: usize = FRAME_OVERHEAD + MIN_PAYLOAD_SIZE;

/// Largest frame this engine reads or writes (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A frame ready to be written.
///
/// Version 2 archives write each frame with a single `write` call so that a
/// reader never observes a header without its payload. Version 1 archives
/// write the header and payload first and the trailer second; the bytes on
/// disk are identical either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The whole frame in one buffer.
    Single(Vec<u8>),
    /// Header plus payload, then the trailer as a second write.
    Split {
        /// Header and payload bytes.
        head: Vec<u8>,
        /// Trailing length word.
        trailer: [u8; LEN_WORD],
    },
}

impl Frame {
    /// Total frame length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Single(bytes) => bytes.len(),
            Self::Split { head, .. } => head.len() + LEN_WORD,
        }
    }

    /// Frames are never empty; provided for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the frame as one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Single(bytes) => bytes.clone(),
            Self::Split { head, trailer } => {
                let mut bytes = Vec::with_capacity(head.len() + LEN_WORD);
                bytes.extend_from_slice(head);
                bytes.extend_from_slice(trailer);
                bytes
            }
        }
    }

    /// Writes the frame with one `write_all` (version 2) or two (version 1).
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Self::Single(bytes) => writer.write_all(bytes),
            Self::Split { head, trailer } => {
                writer.write_all(head)?;
                writer.write_all(trailer)
            }
        }
    }
}

/// Validates a frame length word and returns it as a `usize`.
///
/// `min` is the smallest acceptable frame for the context: labels and
/// index entries have their own fixed minimums.
///
/// # Errors
///
/// Returns [`CodecError::TooSmall`] or [`CodecError::TooBig`].
pub fn check_frame_len(len: u32, min: usize) -> Result<usize, CodecError> {
    let len = len as usize;
    if len < min {
        return Err(CodecError::TooSmall { len, min });
    }
    if len > MAX_FRAME_LEN {
        return Err(CodecError::TooBig {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

/// Frames an already encoded payload.
///
/// # Errors
///
/// Returns [`CodecError::TooBig`] if the frame would exceed [`MAX_FRAME_LEN`].
pub fn frame(payload: &[u8], version: u8) -> Result<Frame, CodecError> {
    let len = frame_len(payload.len())?;
    let mut writer = ByteWriter::with_len(payload.len() + FRAME_OVERHEAD);
    writer.put_u32(len);
    writer.put_bytes(payload);
    Ok(finish(writer, len, version))
}

/// Encodes a measurement record directly into a frame.
///
/// # Errors
///
/// Returns any payload encoding error, or [`CodecError::TooBig`].
pub fn encode(record: &Record, version: u8) -> Result<Frame, CodecError> {
    let len = frame_len(record.payload_size())?;
    let mut writer = ByteWriter::with_len(len as usize);
    writer.put_u32(len);
    record.encode_into(&mut writer)?;
    Ok(finish(writer, len, version))
}

/// Checks a complete frame and returns its payload.
///
/// # Errors
///
/// Returns [`CodecError::LengthMismatch`] if the header, trailer and buffer
/// length disagree, and [`CodecError::TooSmall`] / [`CodecError::TooBig`]
/// for out-of-range lengths.
pub fn unframe(bytes: &[u8], min: usize) -> Result<&[u8], CodecError> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(CodecError::TooSmall {
            len: bytes.len(),
            min,
        });
    }
    let header = BigEndian::read_u32(&bytes[..LEN_WORD]);
    let trailer = BigEndian::read_u32(&bytes[bytes.len() - LEN_WORD..]);
    if header != trailer || header as usize != bytes.len() {
        return Err(CodecError::LengthMismatch { header, trailer });
    }
    check_frame_len(header, min)?;
    Ok(&bytes[LEN_WORD..bytes.len() - LEN_WORD])
}

/// Decodes one framed measurement record.
///
/// # Errors
///
/// Returns any framing or payload error.
pub fn decode(bytes: &[u8]) -> Result<Record, CodecError> {
    Record::decode_payload(unframe(bytes, MIN_FRAME_LEN)?)
}

fn frame_len(payload_len: usize) -> Result<u32, CodecError> {
    let len = payload_len + FRAME_OVERHEAD;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::TooBig {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    #[allow(clippy::cast_possible_truncation)] // len <= MAX_FRAME_LEN
    Ok(len as u32)
}

fn finish(mut writer: ByteWriter, len: u32, version: u8) -> Frame {
    if version >= 2 {
        writer.put_u32(len);
        Frame::Single(writer.into_inner())
    } else {
        let mut head = writer.into_inner();
        head.truncate(len as usize - LEN_WORD);
        let mut trailer = [0u8; LEN_WORD];
        BigEndian::write_u32(&mut trailer, len);
        Frame::Split { head, trailer }
    }
}

/// Bounds-checked big-endian reader over a byte slice.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub(crate) fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8], CodecError> {
        let slice = self
            .pos
            .checked_add(n)
            .and_then(|end| self.buf.get(self.pos..end))
            .ok_or_else(|| {
                CodecError::malformed(format!(
                    "{what} ({n} bytes at offset {}) overruns {}-byte record",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u16(&mut self, what: &str) -> Result<u16, CodecError> {
        self.bytes(2, what).map(BigEndian::read_u16)
    }

    pub(crate) fn u32(&mut self, what: &str) -> Result<u32, CodecError> {
        self.bytes(4, what).map(BigEndian::read_u32)
    }

    pub(crate) fn i32(&mut self, what: &str) -> Result<i32, CodecError> {
        self.bytes(4, what).map(BigEndian::read_i32)
    }

    pub(crate) fn i64(&mut self, what: &str) -> Result<i64, CodecError> {
        self.bytes(8, what).map(BigEndian::read_i64)
    }
}

/// Big-endian writer that grows its buffer as needed.
///
/// Supports writing at arbitrary offsets so that value blocks can be placed
/// after the value-sets that point at them.
#[derive(Debug, Default)]
pub(crate) struct ByteWriter {
    buf: Vec<u8>,
    pos: usize,
}

impl ByteWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_len(len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(len),
            pos: 0,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn seek(&mut self, pos: usize) {
        self.slot(pos, 0);
        self.pos = pos;
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn slot(&mut self, at: usize, n: usize) -> &mut [u8] {
        if self.buf.len() < at + n {
            self.buf.resize(at + n, 0);
        }
        &mut self.buf[at..at + n]
    }

    pub(crate) fn put_u16(&mut self, v: u16) {
        BigEndian::write_u16(self.slot(self.pos, 2), v);
        self.pos += 2;
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.put_u32_at(self.pos, v);
        self.pos += 4;
    }

    pub(crate) fn put_i32(&mut self, v: i32) {
        BigEndian::write_i32(self.slot(self.pos, 4), v);
        self.pos += 4;
    }

    pub(crate) fn put_i64(&mut self, v: i64) {
        BigEndian::write_i64(self.slot(self.pos, 8), v);
        self.pos += 8;
    }

    pub(crate) fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_bytes_at(self.pos, bytes);
        self.pos += bytes.len();
    }

    pub(crate) fn put_u32_at(&mut self, at: usize, v: u32) {
        BigEndian::write_u32(self.slot(at, 4), v);
    }

    pub(crate) fn put_bytes_at(&mut self, at: usize, bytes: &[u8]) {
        self.slot(at, bytes.len()).copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{InsituValue, Timestamp, ValueSet, Values};

    fn record() -> Record {
        Record::new(
            Timestamp::new(100, 5),
            vec![ValueSet {
                pmid: 7,
                values: Values::Insitu(vec![InsituValue { inst: 1, value: 99 }]),
            }],
        )
    }

    #[test]
    fn test_encode_versions_produce_identical_bytes() {
        let v1 = encode(&record(), 1).unwrap();
        let v2 = encode(&record(), 2).unwrap();

        assert!(matches!(v1, Frame::Split { .. }));
        assert!(matches!(v2, Frame::Single(_)));
        assert_eq!(v1.to_bytes(), v2.to_bytes());
        assert_eq!(v1.len(), record().payload_size() + FRAME_OVERHEAD);
    }

    #[test]
    fn test_split_frame_writes_twice() {
        struct CountingWriter {
            writes: usize,
            bytes: Vec<u8>,
        }
        impl Write for CountingWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.writes += 1;
                self.bytes.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        for (version, expected_writes) in [(1u8, 2usize), (2, 1)] {
            let mut w = CountingWriter {
                writes: 0,
                bytes: Vec::new(),
            };
            encode(&record(), version).unwrap().write_to(&mut w).unwrap();
            assert_eq!(w.writes, expected_writes);
            assert_eq!(decode(&w.bytes).unwrap(), record());
        }
    }

    #[test]
    fn test_frame_matches_encode() {
        let payload = record().encode_payload().unwrap();
        assert_eq!(
            frame(&payload, 2).unwrap().to_bytes(),
            encode(&record(), 2).unwrap().to_bytes()
        );
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut bytes = encode(&record(), 2).unwrap().to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_too_small() {
        let mut bytes = vec![0u8; 16];
        BigEndian::write_u32(&mut bytes[..4], 16);
        BigEndian::write_u32(&mut bytes[12..], 16);
        assert_eq!(
            decode(&bytes),
            Err(CodecError::TooSmall {
                len: 16,
                min: MIN_FRAME_LEN
            })
        );
    }

    #[test]
    fn test_check_frame_len_bounds() {
        assert!(check_frame_len(24, MIN_FRAME_LEN).is_ok());
        assert!(matches!(
            check_frame_len(20, MIN_FRAME_LEN),
            Err(CodecError::TooSmall { .. })
        ));
        assert!(matches!(
            check_frame_len(u32::MAX, MIN_FRAME_LEN),
            Err(CodecError::TooBig { .. })
        ));
    }

    #[test]
    fn test_byte_reader_overrun() {
        let mut reader = ByteReader::new(&[0, 1, 2]);
        assert_eq!(reader.u16("short").unwrap(), 1);
        assert!(reader.u32("word").is_err());
        assert_eq!(reader.remaining(), 1);
    }
}
