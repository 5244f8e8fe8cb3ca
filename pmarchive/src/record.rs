//! Measurement records and their payload encoding.
//!
//! A [`Record`] is one timestamped snapshot of any number of metric
//! value-sets. A record with no value-sets is a *mark record*: an explicit
//! "no data here" marker for a gap in the timeline.
//!
//! # Payload Format
//!
//! All multi-byte fields are big-endian.
//!
//! ```text
//! [0..8)    timestamp seconds (i64)
//! [8..12)   timestamp nanoseconds (u32)
//! [12..16)  value-set count (u32)
//! [16..)    value-sets, each:
//!             pmid (u32), numval (i32)
//!             if numval > 0: valfmt (u32), numval x (inst i32, word u32)
//! [..end)   value blocks, each:
//!             (vtype << 24 | vlen) (u32), data, zero padding to 4 bytes
//! ```
//!
//! A negative `numval` is an error code for that metric. With `valfmt` 0
//! the word is the value itself; with `valfmt` 1 it is the byte offset of a
//! value block inside the payload.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::codec::{ByteReader, ByteWriter};
use crate::error::CodecError;

/// Size of an encoded timestamp in bytes.
pub const TIMESTAMP_SIZE: usize = 12;

/// Minimum payload size: timestamp plus value-set count.
pub const MIN_PAYLOAD_SIZE: usize = TIMESTAMP_SIZE + 4;

/// Nanoseconds per second.
const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Value format for in-situ 32-bit values.
const VALFMT_INSITU: u32 = 0;

/// Value format for out-of-line value blocks.
const VALFMT_BLOCK: u32 = 1;

/// Size of a value block header word.
const BLOCK_HEADER_SIZE: usize = 4;

/// Largest `vlen` a value block header can carry (24 bits).
const MAX_BLOCK_LEN: usize = 0x00ff_ffff;

/// A point in time with nanosecond resolution.
///
/// Ordering is chronological. `nsec` is always below one second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Whole seconds since the Unix epoch.
    pub sec: i64,
    /// Nanoseconds within the second.
    pub nsec: u32,
}

impl Timestamp {
    /// One tick: the offset used to place mark records next to a boundary.
    pub const TICK_NANOS: i64 = 1_000_000;

    /// Creates a timestamp, normalizing `nsec` overflow into seconds.
    pub fn new(sec: i64, nsec: u32) -> Self {
        Self {
            sec: sec + i64::from(nsec / NANOS_PER_SEC),
            nsec: nsec % NANOS_PER_SEC,
        }
    }

    /// Creates a timestamp from whole seconds.
    pub fn from_secs(sec: i64) -> Self {
        Self { sec, nsec: 0 }
    }

    /// Creates a timestamp from nanoseconds since the epoch.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // rem_euclid keeps nsec in 0..1e9
    pub fn from_nanos(nanos: i128) -> Self {
        let per_sec = i128::from(NANOS_PER_SEC);
        Self {
            sec: nanos.div_euclid(per_sec) as i64,
            nsec: nanos.rem_euclid(per_sec) as u32,
        }
    }

    /// Returns nanoseconds since the epoch.
    pub fn as_nanos(&self) -> i128 {
        i128::from(self.sec) * i128::from(NANOS_PER_SEC) + i128::from(self.nsec)
    }

    /// Returns this timestamp shifted by `nanos` (may be negative).
    #[must_use]
    pub fn add_nanos(&self, nanos: i64) -> Self {
        Self::from_nanos(self.as_nanos() + i128::from(nanos))
    }

    /// Returns the current wall-clock time.
    #[allow(clippy::cast_possible_wrap)] // seconds since epoch fit in i64
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: elapsed.as_secs() as i64,
            nsec: elapsed.subsec_nanos(),
        }
    }

    /// Decodes a timestamp, rejecting out-of-range nanoseconds.
    pub(crate) fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let sec = reader.i64("timestamp seconds")?;
        let nsec = reader.u32("timestamp nanoseconds")?;
        if nsec >= NANOS_PER_SEC {
            return Err(CodecError::malformed(format!(
                "timestamp nanoseconds {nsec} out of range"
            )));
        }
        Ok(Self { sec, nsec })
    }

    /// Encodes the timestamp.
    pub(crate) fn write(&self, writer: &mut ByteWriter) {
        writer.put_i64(self.sec);
        writer.put_u32(self.nsec);
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

impl FromStr for Timestamp {
    type Err = String;

    /// Parses `"<seconds>[.<fraction>]"`, e.g. `"1700000000.25"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        let sec: i64 = whole
            .parse()
            .map_err(|e| format!("invalid seconds '{whole}': {e}"))?;
        if frac.len() > 9 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid fraction '{frac}'"));
        }
        let nsec = if frac.is_empty() {
            0
        } else {
            let digits: u32 = frac
                .parse()
                .map_err(|e| format!("invalid fraction '{frac}': {e}"))?;
            #[allow(clippy::cast_possible_truncation)] // frac.len() <= 9
            let scale = 10u32.pow(9 - frac.len() as u32);
            digits * scale
        };
        Ok(Self { sec, nsec })
    }
}

/// One 32-bit value stored directly in the value-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsituValue {
    /// Instance identifier.
    pub inst: i32,
    /// The value.
    pub value: u32,
}

/// One out-of-line value (strings, 64-bit numbers, aggregates).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockValue {
    /// Instance identifier.
    pub inst: i32,
    /// Value type tag, opaque to the storage engine.
    pub vtype: u8,
    /// Raw value bytes.
    pub data: Vec<u8>,
}

/// The values of one metric within a record.
///
/// An empty value list always decodes as [`Values::Insitu`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Values {
    /// The metric could not be sampled; carries a negative error code.
    Error(i32),
    /// 32-bit values stored in place.
    Insitu(Vec<InsituValue>),
    /// Values stored in out-of-line blocks.
    Blocks(Vec<BlockValue>),
}

impl Values {
    /// Number of values (zero for errors).
    pub fn len(&self) -> usize {
        match self {
            Self::Error(_) => 0,
            Self::Insitu(values) => values.len(),
            Self::Blocks(values) => values.len(),
        }
    }

    /// Returns `true` when there are no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All values of one metric in a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueSet {
    /// Metric identifier.
    pub pmid: u32,
    /// The metric's values.
    pub values: Values,
}

impl ValueSet {
    /// Encoded size of the value-set itself, excluding value blocks.
    fn header_size(&self) -> usize {
        match self.values.len() {
            0 => 8,
            n => 12 + 8 * n,
        }
    }

    /// Encoded size of this value-set's value blocks.
    fn blocks_size(&self) -> usize {
        match &self.values {
            Values::Blocks(values) => values
                .iter()
                .map(|v| padded(BLOCK_HEADER_SIZE + v.data.len()))
                .sum(),
            _ => 0,
        }
    }
}

/// One timestamped measurement snapshot, or a mark record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// When the values were sampled.
    pub timestamp: Timestamp,
    /// The sampled metrics; empty for a mark record.
    pub value_sets: Vec<ValueSet>,
}

impl Record {
    /// Creates a record.
    pub fn new(timestamp: Timestamp, value_sets: Vec<ValueSet>) -> Self {
        Self {
            timestamp,
            value_sets,
        }
    }

    /// Creates a mark record: a gap in the timeline at `timestamp`.
    pub fn mark(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            value_sets: Vec::new(),
        }
    }

    /// Returns `true` for a mark record.
    pub fn is_mark(&self) -> bool {
        self.value_sets.is_empty()
    }

    /// Restricts the record to the metrics in `pmids`.
    ///
    /// The result holds one value-set per requested pmid, in request order;
    /// a pmid the record does not carry gets an empty value-set. Returns
    /// `None` for a mark record and for a record carrying none of `pmids`.
    pub fn select(&self, pmids: &[u32]) -> Option<Record> {
        if self.is_mark() {
            return None;
        }
        let mut matched = false;
        let value_sets = pmids
            .iter()
            .map(|&pmid| match self.value_sets.iter().find(|vs| vs.pmid == pmid) {
                Some(found) => {
                    matched = true;
                    found.clone()
                }
                None => ValueSet {
                    pmid,
                    values: Values::Insitu(Vec::new()),
                },
            })
            .collect();
        matched.then(|| Record::new(self.timestamp, value_sets))
    }

    /// Size of the encoded payload in bytes.
    pub fn payload_size(&self) -> usize {
        MIN_PAYLOAD_SIZE
            + self
                .value_sets
                .iter()
                .map(|vs| vs.header_size() + vs.blocks_size())
                .sum::<usize>()
    }

    /// Encodes the record payload (without framing).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] for a non-negative error code, and
    /// [`CodecError::TooBig`] for a value block or count that does not fit
    /// the format.
    pub fn encode_payload(&self) -> Result<Vec<u8>, CodecError> {
        let mut writer = ByteWriter::with_len(self.payload_size());
        self.encode_into(&mut writer)?;
        Ok(writer.into_inner())
    }

    /// Encodes the payload into a writer positioned at the payload start.
    pub(crate) fn encode_into(&self, writer: &mut ByteWriter) -> Result<(), CodecError> {
        let base = writer.position();
        let numpmid = u32::try_from(self.value_sets.len()).map_err(|_| CodecError::TooBig {
            len: self.value_sets.len(),
            max: u32::MAX as usize,
        })?;

        self.timestamp.write(writer);
        writer.put_u32(numpmid);

        let vsets_end: usize =
            MIN_PAYLOAD_SIZE + self.value_sets.iter().map(ValueSet::header_size).sum::<usize>();
        let mut block_at = vsets_end;

        for vs in &self.value_sets {
            writer.put_u32(vs.pmid);
            match &vs.values {
                Values::Error(code) => {
                    if *code >= 0 {
                        return Err(CodecError::malformed(format!(
                            "error code {code} for pmid {} is not negative",
                            vs.pmid
                        )));
                    }
                    writer.put_i32(*code);
                }
                Values::Insitu(values) => {
                    writer.put_i32(count_i32(values.len())?);
                    if !values.is_empty() {
                        writer.put_u32(VALFMT_INSITU);
                        for v in values {
                            writer.put_i32(v.inst);
                            writer.put_u32(v.value);
                        }
                    }
                }
                Values::Blocks(values) => {
                    writer.put_i32(count_i32(values.len())?);
                    if !values.is_empty() {
                        writer.put_u32(VALFMT_BLOCK);
                        for v in values {
                            let vlen = BLOCK_HEADER_SIZE + v.data.len();
                            if vlen > MAX_BLOCK_LEN {
                                return Err(CodecError::TooBig {
                                    len: vlen,
                                    max: MAX_BLOCK_LEN,
                                });
                            }
                            writer.put_i32(v.inst);
                            writer.put_u32(word(block_at)?);

                            #[allow(clippy::cast_possible_truncation)] // vlen <= MAX_BLOCK_LEN
                            let header = (u32::from(v.vtype) << 24) | vlen as u32;
                            writer.put_u32_at(base + block_at, header);
                            writer.put_bytes_at(base + block_at + BLOCK_HEADER_SIZE, &v.data);
                            block_at += padded(vlen);
                        }
                    }
                }
            }
        }

        writer.seek(base + block_at);
        Ok(())
    }

    /// Decodes a record payload (without framing).
    ///
    /// Decoding is bounds-checked but otherwise lenient: trailing bytes that
    /// no value-set refers to are ignored. Use [`check_paranoid`] to verify
    /// that every byte is accounted for.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooSmall`] below the fixed header size and
    /// [`CodecError::Malformed`] when a declared length leaves the payload.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < MIN_PAYLOAD_SIZE {
            return Err(CodecError::TooSmall {
                len: payload.len(),
                min: MIN_PAYLOAD_SIZE,
            });
        }

        let mut reader = ByteReader::new(payload);
        let timestamp = Timestamp::read(&mut reader)?;
        let numpmid = reader.u32("value-set count")? as usize;
        if numpmid > reader.remaining() / 8 {
            return Err(CodecError::malformed(format!(
                "{numpmid} value-sets cannot fit in {} bytes",
                payload.len()
            )));
        }

        let mut value_sets = Vec::with_capacity(numpmid);
        for i in 0..numpmid {
            let pmid = reader.u32("pmid")?;
            let numval = reader.i32("numval")?;
            let values = if numval < 0 {
                Values::Error(numval)
            } else if numval == 0 {
                Values::Insitu(Vec::new())
            } else {
                #[allow(clippy::cast_sign_loss)] // numval > 0
                let numval = numval as usize;
                let valfmt = reader.u32("valfmt")?;
                if numval > reader.remaining() / 8 {
                    return Err(CodecError::malformed(format!(
                        "value-set {i}: {numval} values overrun the record"
                    )));
                }
                match valfmt {
                    VALFMT_INSITU => {
                        let mut values = Vec::with_capacity(numval);
                        for _ in 0..numval {
                            let inst = reader.i32("instance")?;
                            let value = reader.u32("value")?;
                            values.push(InsituValue { inst, value });
                        }
                        Values::Insitu(values)
                    }
                    VALFMT_BLOCK => {
                        let mut values = Vec::with_capacity(numval);
                        for _ in 0..numval {
                            let inst = reader.i32("instance")?;
                            let offset = reader.u32("value block offset")? as usize;
                            let (vtype, data) = read_block(payload, offset)?;
                            values.push(BlockValue {
                                inst,
                                vtype,
                                data: data.to_vec(),
                            });
                        }
                        Values::Blocks(values)
                    }
                    other => {
                        return Err(CodecError::malformed(format!(
                            "value-set {i}: unknown valfmt {other}"
                        )));
                    }
                }
            };
            value_sets.push(ValueSet { pmid, values });
        }

        Ok(Self {
            timestamp,
            value_sets,
        })
    }
}

/// Structural validation of a record payload.
///
/// Walks every declared value-set and value-block length and verifies that
/// each stays within the record, that value formats are known, that block
/// offsets are word aligned and lie past the value-sets, and that the
/// value-sets plus blocks account for every byte of the payload. A mark
/// record must be exactly [`MIN_PAYLOAD_SIZE`] bytes.
///
/// # Errors
///
/// Returns the first inconsistency found.
pub fn check_paranoid(payload: &[u8]) -> Result<(), CodecError> {
    let len = payload.len();
    if len < MIN_PAYLOAD_SIZE {
        return Err(CodecError::TooSmall {
            len,
            min: MIN_PAYLOAD_SIZE,
        });
    }
    if len % 4 != 0 {
        return Err(CodecError::malformed(format!(
            "payload length {len} is not word aligned"
        )));
    }

    let mut reader = ByteReader::new(payload);
    Timestamp::read(&mut reader)?;
    let numpmid = reader.u32("value-set count")?;

    if numpmid == 0 && len != MIN_PAYLOAD_SIZE {
        return Err(CodecError::malformed(format!(
            "mark record has {len} bytes, expected {MIN_PAYLOAD_SIZE}"
        )));
    }

    let mut vsize = 0usize;
    let mut vbsize = 0usize;
    let mut block_offsets = Vec::new();

    for i in 0..numpmid {
        vsize += 8;
        if MIN_PAYLOAD_SIZE + vsize + vbsize > len {
            return Err(CodecError::malformed(format!(
                "value-set {i} needs {} bytes, record has {len}",
                MIN_PAYLOAD_SIZE + vsize + vbsize
            )));
        }
        reader.u32("pmid")?;
        let numval = reader.i32("numval")?;
        if numval <= 0 {
            continue;
        }

        let valfmt = reader.u32("valfmt")?;
        if valfmt != VALFMT_INSITU && valfmt != VALFMT_BLOCK {
            return Err(CodecError::malformed(format!(
                "value-set {i}: bad valfmt {valfmt}"
            )));
        }
        #[allow(clippy::cast_sign_loss)] // numval > 0
        let numval = numval as usize;
        vsize += 4 + numval.saturating_mul(8);
        if MIN_PAYLOAD_SIZE.saturating_add(vsize).saturating_add(vbsize) > len {
            return Err(CodecError::malformed(format!(
                "value-set {i}: {numval} values overrun the record"
            )));
        }

        for j in 0..numval {
            reader.i32("instance")?;
            let word = reader.u32("value")? as usize;
            if valfmt == VALFMT_INSITU {
                continue;
            }
            if word % 4 != 0 || word < MIN_PAYLOAD_SIZE || word + BLOCK_HEADER_SIZE > len {
                return Err(CodecError::malformed(format!(
                    "value-set {i} value {j}: block offset {word} not in range {MIN_PAYLOAD_SIZE}..{len}"
                )));
            }
            let (_, data) = read_block(payload, word)?;
            let size = padded(BLOCK_HEADER_SIZE + data.len());
            if word + size > len {
                return Err(CodecError::malformed(format!(
                    "value-set {i} value {j}: block at {word} overruns the record"
                )));
            }
            vbsize += size;
            block_offsets.push(word);
        }
    }

    let vsets_end = MIN_PAYLOAD_SIZE + vsize;
    if let Some(offset) = block_offsets.iter().find(|&&offset| offset < vsets_end) {
        return Err(CodecError::malformed(format!(
            "value block at {offset} overlaps value-sets ending at {vsets_end}"
        )));
    }
    if vsets_end + vbsize != len {
        return Err(CodecError::malformed(format!(
            "record accounts for {} bytes, has {len}",
            vsets_end + vbsize
        )));
    }

    Ok(())
}

/// Reads the value block at `offset`, returning its type and data bytes.
fn read_block(payload: &[u8], offset: usize) -> Result<(u8, &[u8]), CodecError> {
    let mut reader = ByteReader::at(payload, offset);
    let header = reader.u32("value block header")?;
    let vlen = (header & 0x00ff_ffff) as usize;
    if vlen < BLOCK_HEADER_SIZE {
        return Err(CodecError::malformed(format!(
            "value block at {offset}: bad vlen {vlen}"
        )));
    }
    #[allow(clippy::cast_possible_truncation)] // top byte of a u32
    let vtype = (header >> 24) as u8;
    let data = reader.bytes(vlen - BLOCK_HEADER_SIZE, "value block data")?;
    Ok((vtype, data))
}

/// Rounds `len` up to a whole number of 4-byte words.
fn padded(len: usize) -> usize {
    len.div_ceil(4) * 4
}

fn count_i32(len: usize) -> Result<i32, CodecError> {
    i32::try_from(len).map_err(|_| CodecError::TooBig {
        len,
        max: i32::MAX as usize,
    })
}

fn word(offset: usize) -> Result<u32, CodecError> {
    u32::try_from(offset).map_err(|_| CodecError::TooBig {
        len: offset,
        max: u32::MAX as usize,
    })
}
