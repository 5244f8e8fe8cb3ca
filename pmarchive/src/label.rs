//! Archive labels.
//!
//! Every file of an archive starts with a framed label record carrying the
//! archive's identity. The copies differ only in the file number they are
//! stamped with: [`META_VOL`] for the metadata file, [`INDEX_VOL`] for the
//! temporal index, and `N` for data volume `N`.
//!
//! # Label Payload
//!
//! ```text
//! magic     u32   0x50052600 | version
//! pid       i32   process id of the writer
//! start     i64 seconds, u32 nanoseconds
//! vol       i32   file number this copy is stamped with
//! flags     u32   bit 0: zoneinfo present, bit 1: features present
//! hostname  u16 length + UTF-8
//! timezone  u16 length + UTF-8
//! zoneinfo  u16 length + UTF-8   (optional)
//! features  u32                  (optional)
//! ```

use std::io::{ErrorKind, Read};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::codec::{self, ByteReader, ByteWriter, Frame, LEN_WORD};
use crate::error::{ArchiveError, CodecError, LabelError, Result};
use crate::record::Timestamp;

/// Magic number with the version byte cleared.
pub const LABEL_MAGIC: u32 = 0x5005_2600;

/// Label version written by default.
pub const CURRENT_VERSION: u8 = 2;

/// Label versions this engine reads and writes.
pub const SUPPORTED_VERSIONS: [u8; 2] = [1, 2];

/// File number stamped on the metadata file's label.
pub const META_VOL: i32 = -1;

/// File number stamped on the temporal index's label.
pub const INDEX_VOL: i32 = -2;

/// Smallest possible label frame: fixed fields and two empty strings.
pub const MIN_LABEL_FRAME: usize = codec::FRAME_OVERHEAD + 32;

const FLAG_ZONEINFO: u32 = 0x1;
const FLAG_FEATURES: u32 = 0x2;

/// Identity and metadata of one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveLabel {
    /// Format version, the low byte of the magic number.
    pub version: u8,
    /// Process id of the writer.
    pub pid: i32,
    /// Host the metrics were collected from.
    pub hostname: String,
    /// Timestamp of the first record (or of archive creation).
    pub start: Timestamp,
    /// Timezone of the collection host, e.g. `"UTC"`.
    pub timezone: String,
    /// Optional zoneinfo name, e.g. `":Europe/Berlin"`.
    pub zoneinfo: Option<String>,
    /// Optional feature bitmask.
    pub features: Option<u32>,
}

impl ArchiveLabel {
    /// Encodes the label payload stamped with file number `vol`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooBig`] if a string exceeds 65535 bytes.
    pub fn encode_payload(&self, vol: i32) -> std::result::Result<Vec<u8>, CodecError> {
        let mut flags = 0;
        if self.zoneinfo.is_some() {
            flags |= FLAG_ZONEINFO;
        }
        if self.features.is_some() {
            flags |= FLAG_FEATURES;
        }

        let mut writer = ByteWriter::new();
        writer.put_u32(LABEL_MAGIC | u32::from(self.version));
        writer.put_i32(self.pid);
        self.start.write(&mut writer);
        writer.put_i32(vol);
        writer.put_u32(flags);
        put_str(&mut writer, &self.hostname)?;
        put_str(&mut writer, &self.timezone)?;
        if let Some(zoneinfo) = &self.zoneinfo {
            put_str(&mut writer, zoneinfo)?;
        }
        if let Some(features) = self.features {
            writer.put_u32(features);
        }
        Ok(writer.into_inner())
    }

    /// Encodes the framed label stamped with file number `vol`.
    ///
    /// # Errors
    ///
    /// Returns any encoding error.
    pub fn frame(&self, vol: i32) -> std::result::Result<Frame, CodecError> {
        codec::frame(&self.encode_payload(vol)?, self.version)
    }

    /// Decodes a label payload, returning the label and its file number.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::BadMagic`], [`LabelError::UnsupportedVersion`] or
    /// [`LabelError::Unreadable`].
    pub fn decode_payload(
        payload: &[u8],
        path: &Path,
    ) -> std::result::Result<(Self, i32), LabelError> {
        let unreadable = |source| LabelError::Unreadable {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = ByteReader::new(payload);

        let magic = reader.u32("label magic").map_err(unreadable)?;
        if magic & !0xff != LABEL_MAGIC {
            return Err(LabelError::BadMagic {
                path: path.to_path_buf(),
                magic,
            });
        }
        #[allow(clippy::cast_possible_truncation)] // masked to one byte
        let version = (magic & 0xff) as u8;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(LabelError::UnsupportedVersion {
                path: path.to_path_buf(),
                version,
            });
        }

        let decode = |reader: &mut ByteReader<'_>| -> std::result::Result<(Self, i32), CodecError> {
            let pid = reader.i32("pid")?;
            let start = Timestamp::read(reader)?;
            let vol = reader.i32("file number")?;
            let flags = reader.u32("flags")?;
            let hostname = get_str(reader, "hostname")?;
            let timezone = get_str(reader, "timezone")?;
            let zoneinfo = if flags & FLAG_ZONEINFO != 0 {
                Some(get_str(reader, "zoneinfo")?)
            } else {
                None
            };
            let features = if flags & FLAG_FEATURES != 0 {
                Some(reader.u32("features")?)
            } else {
                None
            };
            let label = Self {
                version,
                pid,
                hostname,
                start,
                timezone,
                zoneinfo,
                features,
            };
            Ok((label, vol))
        };
        decode(&mut reader).map_err(unreadable)
    }

    /// Reads the framed label at the start of `source`.
    ///
    /// Returns the label, the file number it is stamped with, and the frame
    /// length (the offset of the first record after the label).
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::Missing`] for an empty file, other
    /// [`LabelError`]s for a bad label, and [`ArchiveError::Io`] when the
    /// read fails.
    pub fn read_from<R: Read>(source: &mut R, path: &Path) -> Result<(Self, i32, u64)> {
        let unreadable = |source| LabelError::Unreadable {
            path: path.to_path_buf(),
            source,
        };

        let mut head = [0u8; LEN_WORD];
        match source.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(LabelError::Missing {
                    path: path.to_path_buf(),
                }
                .into());
            }
            Err(e) => return Err(ArchiveError::io(path, 0, e)),
        }

        let len = codec::check_frame_len(BigEndian::read_u32(&head), MIN_LABEL_FRAME)
            .map_err(unreadable)?;
        let mut frame = vec![0u8; len];
        frame[..LEN_WORD].copy_from_slice(&head);
        match source.read_exact(&mut frame[LEN_WORD..]) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(unreadable(CodecError::malformed("label frame is truncated")).into());
            }
            Err(e) => return Err(ArchiveError::io(path, LEN_WORD as u64, e)),
        }

        let payload = codec::unframe(&frame, MIN_LABEL_FRAME).map_err(unreadable)?;
        let (label, vol) = Self::decode_payload(payload, path)?;
        Ok((label, vol, len as u64))
    }

    /// Checks that a label copy is stamped with the file number it should be.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::WrongFile`] on a mismatch.
    pub fn check_file(path: &Path, expected: i32, found: i32) -> std::result::Result<(), LabelError> {
        if expected != found {
            return Err(LabelError::WrongFile {
                path: path.to_path_buf(),
                expected,
                found,
            });
        }
        Ok(())
    }

    /// Checks that two label copies describe the same archive: same version,
    /// same writer pid and same hostname.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::Mismatch`] naming the first difference.
    pub fn check_same(
        &self,
        other: &Self,
        first: &Path,
        second: &Path,
    ) -> std::result::Result<(), LabelError> {
        let reason = if self.version != other.version {
            format!("version {} != {}", self.version, other.version)
        } else if self.pid != other.pid {
            format!("pid {} != {}", self.pid, other.pid)
        } else if self.hostname != other.hostname {
            format!("hostname '{}' != '{}'", self.hostname, other.hostname)
        } else {
            return Ok(());
        };
        Err(LabelError::Mismatch {
            first: first.to_path_buf(),
            second: second.to_path_buf(),
            reason,
        })
    }
}

fn put_str(writer: &mut ByteWriter, s: &str) -> std::result::Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::TooBig {
        len: s.len(),
        max: u16::MAX as usize,
    })?;
    writer.put_u16(len);
    writer.put_bytes(s.as_bytes());
    Ok(())
}

fn get_str(reader: &mut ByteReader<'_>, what: &str) -> std::result::Result<String, CodecError> {
    let len = reader.u16(what)? as usize;
    let bytes = reader.bytes(len, what)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| CodecError::malformed(format!("{what} is not UTF-8: {e}")))
}
