//! End-of-archive resolution.
//!
//! The end of an archive is the timestamp of its last complete, valid
//! record. An archive that is still being written (or whose writer crashed)
//! may end in a torn record, so the last frame cannot simply be trusted:
//! every candidate is validated with the paranoid checks, and a bad tail
//! makes the resolver fall back to the last index entry of the volume and
//! walk forward from there.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::Direction;
use crate::error::{ArchiveError, Result};
use crate::handle::{ArchiveHandle, TailCache};
use crate::index::TemporalIndex;
use crate::record::Timestamp;
use crate::volume::{ReadOutcome, VolumeFile};

impl ArchiveHandle {
    /// Returns the timestamp of the archive's last valid record.
    ///
    /// Volumes are checked from the highest down. Each volume's tail is
    /// cached together with its physical size and reused while the size is
    /// unchanged. An archive holding no records ends at its label's start
    /// time.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if a volume cannot be read. Corrupt or
    /// torn records are never reported from here.
    pub fn end_time(&self) -> Result<Timestamp> {
        for number in self.volume_numbers().rev() {
            let volume = match self.volume(number) {
                Ok(Some(volume)) => volume,
                Ok(None) => continue,
                Err(error) => {
                    warn!(base = %self.base().display(), volume = number, %error, "skipping unreadable volume");
                    continue;
                }
            };
            if let Some((end, _)) = self.tail_of(number, &volume)?.last {
                return Ok(end);
            }
        }

        Ok(self.start())
    }

    /// Returns `(data_start, valid_end)` of a volume, where `valid_end` is
    /// the offset just past its last valid record.
    ///
    /// Backward reads start at `valid_end` rather than at the physical end,
    /// so a torn final record reads as not yet written. A volume without
    /// valid records has `valid_end == data_start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be opened or read.
    pub fn valid_end(&self, number: u32) -> Result<Option<(u64, u64)>> {
        let Some(volume) = self.volume(number)? else {
            return Ok(None);
        };
        let tail = self.tail_of(number, &volume)?;
        let data_start = volume.lock().data_start();
        let end = tail.last.map_or(data_start, |(_, end)| end);
        Ok(Some((data_start, end)))
    }

    /// Forgets every cached volume tail so the next lookup rescans.
    pub fn invalidate_end_cache(&self) {
        self.tails.lock().clear();
    }

    /// Resolves the tail of volume `number`, from the cache when the
    /// volume's physical size is unchanged.
    fn tail_of(&self, number: u32, volume: &Mutex<VolumeFile>) -> Result<TailCache> {
        let mut volume = volume.lock();
        let physical = volume.len()?;

        let cached = self.tails.lock().get(&number).copied();
        if let Some(cached) = cached
            && cached.physical_size == physical
        {
            return Ok(cached);
        }

        let last = if physical <= volume.data_start() {
            None
        } else {
            resolve_volume(&mut volume, physical, self.index())?
        };
        let tail = TailCache {
            physical_size: physical,
            last,
        };
        self.tails.lock().insert(number, tail);
        Ok(tail)
    }
}

/// Finds the last valid record of one volume, up to `physical` bytes.
///
/// Returns the record's timestamp and the offset just past it.
fn resolve_volume(
    volume: &mut VolumeFile,
    physical: u64,
    index: &TemporalIndex,
) -> Result<Option<(Timestamp, u64)>> {
    if let Some((timestamp, _)) = tolerate(volume.read_record(physical, Direction::Backward, true))? {
        return Ok(Some((timestamp, physical)));
    }

    warn!(
        path = %volume.path().display(),
        physical,
        "volume does not end in a valid record, scanning from the last index entry"
    );

    let mut candidate = None;
    let mut offset = volume.data_start();
    if let Some(entry) = index.last_in_volume(volume.number(), physical)
        && entry.data_offset > volume.data_start()
    {
        offset = entry.data_offset;
        if let Some((timestamp, _)) =
            tolerate(volume.read_record(offset, Direction::Backward, true))?
        {
            candidate = Some((timestamp, offset));
        }
    }

    while offset < physical {
        match tolerate(volume.read_record(offset, Direction::Forward, true))? {
            Some((timestamp, end)) if end <= physical => {
                candidate = Some((timestamp, end));
                offset = end;
            }
            _ => break,
        }
    }

    debug!(path = %volume.path().display(), end = ?candidate, offset, "resolved volume end");
    Ok(candidate)
}

/// Turns corrupt or missing records into `None`, keeping I/O failures.
///
/// Returns the record's timestamp and the offset just past it.
fn tolerate(outcome: Result<ReadOutcome>) -> Result<Option<(Timestamp, u64)>> {
    match outcome {
        Ok(ReadOutcome::Record { record, end, .. }) => Ok(Some((record.timestamp, end))),
        Ok(ReadOutcome::EndOfVolume) | Err(ArchiveError::CorruptRecord { .. }) => Ok(None),
        Err(error) => Err(error),
    }
}
