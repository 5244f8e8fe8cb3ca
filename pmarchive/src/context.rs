//! Reading sessions over a chain of archives.
//!
//! An [`ArchiveContext`] presents one or more archives, ordered by start
//! time, as a single timeline. Records are fetched forward or backward; at
//! the end of a volume the next volume of the same archive is tried, and at
//! the end of an archive the context moves to the neighbouring archive in
//! the chain.
//!
//! Crossing from one archive to the next first yields a synthesized mark
//! record, so callers always see an explicit gap between archives. The
//! following fetch switches archives. If the two archives overlap in time
//! the switch reports [`ArchiveError::LogOverlap`], and reading continues
//! normally on the next fetch.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ArchiveError, LabelError, Result};
use crate::handle::ArchiveHandle;
use crate::label::ArchiveLabel;
use crate::record::{Record, Timestamp};
use crate::volume::ReadOutcome;

/// Reading direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Increasing time.
    Forward,
    /// Decreasing time.
    Backward,
}

impl Direction {
    /// The opposite direction.
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }
}

/// Where a context currently is in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// Before the first record of the first archive.
    AtChainStart,
    /// Between two records (or at a volume edge) of one archive.
    Positioned {
        /// Index of the archive in the chain.
        archive: usize,
        /// Current volume of that archive.
        volume: u32,
        /// Byte offset within the volume.
        offset: u64,
    },
    /// After the last record of the last archive.
    AtChainEnd,
}

/// Options controlling how records are read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    /// Validate every record's internal structure before decoding it.
    pub paranoid: bool,
    /// Metrics to return; empty returns whole records.
    pub pmids: Vec<u32>,
}

impl ReadOptions {
    /// Creates the default options: framing checks only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables paranoid record validation.
    #[must_use]
    pub fn with_paranoid(mut self, paranoid: bool) -> Self {
        self.paranoid = paranoid;
        self
    }

    /// Restricts fetched records to the metrics in `pmids`.
    ///
    /// With a non-empty list, each fetched record carries one value-set per
    /// requested pmid in request order, and mark records and records with
    /// none of the pmids are skipped.
    #[must_use]
    pub fn with_pmids(mut self, pmids: impl IntoIterator<Item = u32>) -> Self {
        self.pmids = pmids.into_iter().collect();
        self
    }
}

/// What to do when the current archive is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStep {
    /// No archive further along the chain.
    EndOfLog,
    /// Return a mark record for `boundary` without switching archives.
    EmitMark {
        /// Boundary between archive `boundary` and `boundary + 1`.
        boundary: usize,
    },
    /// Switch to archive `to` across `boundary`.
    Switch {
        /// The archive to switch to.
        to: usize,
        /// Boundary being crossed.
        boundary: usize,
    },
}

/// "Mark already emitted" flags, one per boundary per direction.
///
/// Boundary `b` lies between archives `b` and `b + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkFlags {
    forward: Vec<bool>,
    backward: Vec<bool>,
}

impl MarkFlags {
    /// Flags for a chain of `chain_len` archives, all clear.
    pub fn new(chain_len: usize) -> Self {
        let boundaries = chain_len.saturating_sub(1);
        Self {
            forward: vec![false; boundaries],
            backward: vec![false; boundaries],
        }
    }

    /// Whether a mark was already emitted at `boundary` going `direction`.
    pub fn emitted(&self, boundary: usize, direction: Direction) -> bool {
        self.flags(direction).get(boundary).copied().unwrap_or(false)
    }

    /// Sets or clears the flag for `boundary` going `direction`.
    pub fn set(&mut self, boundary: usize, direction: Direction, emitted: bool) {
        let flags = match direction {
            Direction::Forward => &mut self.forward,
            Direction::Backward => &mut self.backward,
        };
        if let Some(flag) = flags.get_mut(boundary) {
            *flag = emitted;
        }
    }

    /// Clears every flag.
    pub fn reset(&mut self) {
        self.forward.fill(false);
        self.backward.fill(false);
    }

    fn flags(&self, direction: Direction) -> &[bool] {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.backward,
        }
    }
}

/// Decides how to continue once archive `archive` is exhausted.
pub fn plan_chain_advance(
    archive: usize,
    chain_len: usize,
    direction: Direction,
    marks: &MarkFlags,
) -> ChainStep {
    let (to, boundary) = match direction {
        Direction::Forward if archive + 1 < chain_len => (archive + 1, archive),
        Direction::Backward if archive > 0 && archive < chain_len => (archive - 1, archive - 1),
        _ => return ChainStep::EndOfLog,
    };
    if marks.emitted(boundary, direction) {
        ChainStep::Switch { to, boundary }
    } else {
        ChainStep::EmitMark { boundary }
    }
}

/// Timestamp of the mark record for a gap from `previous_end` to
/// `next_start`.
///
/// The mark sits one tick past `previous_end` going forward and one tick
/// before `next_start` going backward. A gap narrower than two ticks puts
/// it at the midpoint instead, so it stays strictly inside the gap.
pub fn mark_timestamp(
    previous_end: Timestamp,
    next_start: Timestamp,
    direction: Direction,
) -> Timestamp {
    let gap = next_start.as_nanos() - previous_end.as_nanos();
    if gap > 0 && gap < 2 * i128::from(Timestamp::TICK_NANOS) {
        return Timestamp::from_nanos(previous_end.as_nanos() + gap / 2);
    }
    match direction {
        Direction::Forward => previous_end.add_nanos(Timestamp::TICK_NANOS),
        Direction::Backward => next_start.add_nanos(-Timestamp::TICK_NANOS),
    }
}

/// Offset of the first (forward) or last (backward) record edge of volume
/// `number`. Backward edges stop at the last valid record.
fn volume_edge(handle: &ArchiveHandle, number: u32, direction: Direction) -> Result<Option<u64>> {
    Ok(match direction {
        Direction::Forward => handle.volume_bounds(number)?.map(|(data_start, _)| data_start),
        Direction::Backward => handle.valid_end(number)?.map(|(_, end)| end),
    })
}

/// A reading session over an ordered chain of archives.
#[derive(Debug, Clone)]
pub struct ArchiveContext {
    pub(crate) archives: Vec<Arc<ArchiveHandle>>,
    pub(crate) state: ChainState,
    pub(crate) marks: MarkFlags,
    pub(crate) options: ReadOptions,
}

impl ArchiveContext {
    /// Opens each path as an archive and chains them.
    ///
    /// # Errors
    ///
    /// Returns any error from [`ArchiveHandle::open`] or
    /// [`from_handles`](Self::from_handles).
    pub fn open<P: AsRef<Path>>(paths: &[P], options: ReadOptions) -> Result<Self> {
        let archives = paths
            .iter()
            .map(|p| ArchiveHandle::open(p).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Self::from_handles(archives, options)
    }

    /// Chains already open archives, ordering them by start time.
    ///
    /// All archives must come from the same host.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidConfig`] for an empty chain and
    /// [`LabelError::Mismatch`] if the hostnames differ.
    pub fn from_handles(mut archives: Vec<Arc<ArchiveHandle>>, options: ReadOptions) -> Result<Self> {
        if archives.is_empty() {
            return Err(ArchiveError::InvalidConfig {
                reason: "a context needs at least one archive".to_string(),
            });
        }
        archives.sort_by_key(|a| a.start());

        let first = &archives[0];
        for other in &archives[1..] {
            if other.label().hostname != first.label().hostname {
                return Err(LabelError::Mismatch {
                    first: first.base().to_path_buf(),
                    second: other.base().to_path_buf(),
                    reason: format!(
                        "hostname '{}' != '{}'",
                        first.label().hostname,
                        other.label().hostname
                    ),
                }
                .into());
            }
        }

        let marks = MarkFlags::new(archives.len());
        Ok(Self {
            archives,
            state: ChainState::AtChainStart,
            marks,
            options,
        })
    }

    /// A new context over the same archives, with its own position.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// The chained archives in timeline order.
    pub fn archives(&self) -> &[Arc<ArchiveHandle>] {
        &self.archives
    }

    /// The current position.
    pub fn state(&self) -> ChainState {
        self.state
    }

    /// The read options in effect.
    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    /// Label of the current archive (the first one when not positioned).
    pub fn label(&self) -> &ArchiveLabel {
        let archive = match self.state {
            ChainState::Positioned { archive, .. } => archive,
            ChainState::AtChainStart => 0,
            ChainState::AtChainEnd => self.archives.len() - 1,
        };
        self.archives[archive].label()
    }

    /// Start of the chain.
    pub fn start_time(&self) -> Timestamp {
        self.archives[0].start()
    }

    /// End of the chain: the end of its last archive.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if the archive cannot be read.
    pub fn end_time(&self) -> Result<Timestamp> {
        self.archives[self.archives.len() - 1].end_time()
    }

    /// Moves to the start of the chain and clears all mark state.
    pub fn rewind(&mut self) {
        self.state = ChainState::AtChainStart;
        self.marks.reset();
    }

    /// Moves to the end of the chain and clears all mark state.
    pub fn seek_end(&mut self) {
        self.state = ChainState::AtChainEnd;
        self.marks.reset();
    }

    /// Fetches the next record in `direction`.
    ///
    /// When [`ReadOptions::pmids`] is set, records are restricted to those
    /// metrics and records without any of them are skipped; see
    /// [`ReadOptions::with_pmids`].
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::EndOfLog`] when the chain is exhausted,
    /// [`ArchiveError::LogOverlap`] once when crossing into an overlapping
    /// archive, and [`ArchiveError::CorruptRecord`] or
    /// [`ArchiveError::Io`] for a bad read, which leaves the position
    /// unchanged.
    pub fn fetch(&mut self, direction: Direction) -> Result<Record> {
        if self.options.pmids.is_empty() {
            return self.fetch_record(direction);
        }
        loop {
            let record = self.fetch_record(direction)?;
            if let Some(selected) = record.select(&self.options.pmids) {
                return Ok(selected);
            }
        }
    }

    /// Fetches the next whole record in `direction`, marks included.
    fn fetch_record(&mut self, direction: Direction) -> Result<Record> {
        loop {
            let state = self.state;
            let (archive, volume, offset) = match state {
                ChainState::Positioned {
                    archive,
                    volume,
                    offset,
                } => (archive, volume, offset),
                ChainState::AtChainStart if direction == Direction::Forward => {
                    self.position_at_edge(0, Direction::Forward)?
                }
                ChainState::AtChainEnd if direction == Direction::Backward => {
                    self.position_at_edge(self.archives.len() - 1, Direction::Backward)?
                }
                ChainState::AtChainStart | ChainState::AtChainEnd => {
                    return Err(ArchiveError::EndOfLog);
                }
            };

            if let Some((record, volume, offset)) = self.step(archive, volume, offset, direction)? {
                self.state = ChainState::Positioned {
                    archive,
                    volume,
                    offset,
                };
                return Ok(record);
            }

            match plan_chain_advance(archive, self.archives.len(), direction, &self.marks) {
                ChainStep::EndOfLog => {
                    self.state = match direction {
                        Direction::Forward => ChainState::AtChainEnd,
                        Direction::Backward => ChainState::AtChainStart,
                    };
                    return Err(ArchiveError::EndOfLog);
                }
                ChainStep::EmitMark { boundary } => {
                    let timestamp = mark_timestamp(
                        self.archives[boundary].end_time()?,
                        self.archives[boundary + 1].start(),
                        direction,
                    );
                    self.marks.set(boundary, direction, true);
                    debug!(boundary, ?direction, %timestamp, "emitting mark record at archive boundary");
                    return Ok(Record::mark(timestamp));
                }
                ChainStep::Switch { to, boundary } => {
                    self.marks.set(boundary, direction.reverse(), false);
                    self.position_at_edge(to, direction)?;
                    debug!(
                        from = %self.archives[archive].base().display(),
                        to = %self.archives[to].base().display(),
                        ?direction,
                        "switched archive"
                    );
                    self.overlap_check(boundary)?;
                }
            }
        }
    }

    /// Iterates records in `direction` until the chain is exhausted.
    ///
    /// Overlap reports are yielded as errors and iteration continues; any
    /// other error ends the iteration after being yielded.
    pub fn iter(&mut self, direction: Direction) -> Records<'_> {
        Records {
            context: self,
            direction,
            done: false,
        }
    }

    /// Reads one record within `archive`, rolling over to neighbouring
    /// volumes of that archive. Returns the record and the position after
    /// it, or `None` at the archive's edge.
    pub(crate) fn step(
        &self,
        archive: usize,
        mut volume: u32,
        mut offset: u64,
        direction: Direction,
    ) -> Result<Option<(Record, u32, u64)>> {
        let handle = &self.archives[archive];
        loop {
            match handle.read_record(volume, offset, direction, self.options.paranoid)? {
                ReadOutcome::Record { record, start, end } => {
                    let offset = match direction {
                        Direction::Forward => end,
                        Direction::Backward => start,
                    };
                    return Ok(Some((record, volume, offset)));
                }
                ReadOutcome::EndOfVolume => {}
            }

            let Some(next) = handle.next_volume(volume, direction) else {
                return Ok(None);
            };
            let Some(offset_at_edge) = volume_edge(handle, next, direction)? else {
                return Ok(None);
            };
            debug!(base = %handle.base().display(), from = volume, to = next, "volume rollover");
            volume = next;
            offset = offset_at_edge;
        }
    }

    /// Positions at the first (forward) or last (backward) record edge of
    /// `archive` and returns that position.
    pub(crate) fn position_at_edge(
        &mut self,
        archive: usize,
        direction: Direction,
    ) -> Result<(usize, u32, u64)> {
        let handle = &self.archives[archive];
        let volume = match direction {
            Direction::Forward => handle.min_volume(),
            Direction::Backward => handle.max_volume(),
        };
        let offset = volume_edge(handle, volume, direction)?.unwrap_or(0);
        self.state = ChainState::Positioned {
            archive,
            volume,
            offset,
        };
        Ok((archive, volume, offset))
    }

    /// Checks the archives on either side of `boundary` for overlapping
    /// time ranges.
    fn overlap_check(&self, boundary: usize) -> Result<()> {
        let previous = &self.archives[boundary];
        let next = &self.archives[boundary + 1];
        let previous_end = previous.end_time()?;
        let next_start = next.start();
        if next_start < previous_end {
            warn!(
                previous = %previous.base().display(),
                next = %next.base().display(),
                %previous_end,
                %next_start,
                "chained archives overlap"
            );
            return Err(ArchiveError::LogOverlap {
                previous: previous.base().to_path_buf(),
                next: next.base().to_path_buf(),
                previous_end,
                next_start,
            });
        }
        Ok(())
    }
}

/// Iterator over the records of a context; see [`ArchiveContext::iter`].
#[derive(Debug)]
pub struct Records<'a> {
    context: &'a mut ArchiveContext,
    direction: Direction,
    done: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.context.fetch(self.direction) {
            Ok(record) => Some(Ok(record)),
            Err(ArchiveError::EndOfLog) => {
                self.done = true;
                None
            }
            Err(error @ ArchiveError::LogOverlap { .. }) => Some(Err(error)),
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}
