//! Positioning a context at a timestamp.

use tracing::debug;

use crate::context::{ArchiveContext, ChainState, Direction};
use crate::error::Result;
use crate::index::IndexEntry;
use crate::record::Timestamp;

impl ArchiveContext {
    /// Positions the context so that the next fetch in `direction` returns
    /// the record nearest `target` without overshooting it.
    ///
    /// After seeking, `fetch(Forward)` returns the first record with a
    /// timestamp at or after `target`, and `fetch(Backward)` the last record
    /// at or before it, within the selected archive. The archive is the last
    /// one in the chain starting at or before `target` (the first archive
    /// if `target` precedes them all). Mark state is reset.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ArchiveError::CorruptRecord`] or
    /// [`crate::ArchiveError::Io`] if a record read while positioning fails.
    pub fn seek(&mut self, target: Timestamp, direction: Direction) -> Result<()> {
        let archive = self
            .archives
            .partition_point(|a| a.start() <= target)
            .saturating_sub(1);
        self.marks.reset();

        let handle = &self.archives[archive];
        let index = handle.index();
        let usable = |entry: &IndexEntry| {
            handle
                .volume_bounds(entry.volume)
                .ok()
                .flatten()
                .is_some_and(|(_, len)| entry.data_offset <= len)
        };
        let entry = index
            .lookup(target, direction)
            .and_then(|pos| index.volume_skip(direction, pos, usable).ok())
            .map(|pos| index.entries()[pos]);

        let (_, mut volume, mut offset) = match entry {
            Some(entry) => {
                let data_start = handle
                    .volume_bounds(entry.volume)?
                    .map_or(0, |(data_start, _)| data_start);
                debug!(
                    base = %handle.base().display(),
                    %target,
                    entry = %entry.timestamp,
                    volume = entry.volume,
                    offset = entry.data_offset,
                    "seek using index entry"
                );
                (archive, entry.volume, entry.data_offset.max(data_start))
            }
            None => {
                debug!(
                    base = %handle.base().display(),
                    %target,
                    ?direction,
                    "no usable index entry, seeking from archive edge"
                );
                self.position_at_edge(archive, direction.reverse())?
            }
        };

        match direction {
            Direction::Forward => {
                // Back up over records at or after the target...
                while let Some((record, v, o)) = self.step(archive, volume, offset, Direction::Backward)? {
                    if record.timestamp < target {
                        break;
                    }
                    (volume, offset) = (v, o);
                }
                // ...then skip any still before it.
                while let Some((record, v, o)) = self.step(archive, volume, offset, Direction::Forward)? {
                    if record.timestamp >= target {
                        break;
                    }
                    (volume, offset) = (v, o);
                }
            }
            Direction::Backward => {
                while let Some((record, v, o)) = self.step(archive, volume, offset, Direction::Forward)? {
                    if record.timestamp > target {
                        break;
                    }
                    (volume, offset) = (v, o);
                }
                while let Some((record, v, o)) = self.step(archive, volume, offset, Direction::Backward)? {
                    if record.timestamp <= target {
                        break;
                    }
                    (volume, offset) = (v, o);
                }
            }
        }

        self.state = ChainState::Positioned {
            archive,
            volume,
            offset,
        };
        Ok(())
    }
}
