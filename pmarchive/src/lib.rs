//! # pmarchive
//!
//! Multi-volume archive storage engine for performance metrics.
//!
//! pmarchive persists streams of timestamped, multi-metric measurement
//! records to an on-disk archive and reads them back forward, backward or by
//! seeking to a timestamp. Several archives can be chained into one
//! continuous timeline, with explicit mark records at every boundary.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Length-prefixed framing in both directions: every record can be read
//!   walking forward or backward through a volume
//! - Archives can be read while a writer is still appending; a torn final
//!   record reads as "not yet written"
//! - Sparse temporal index for seeking without scanning
//! - End-of-archive detection that survives a crashed writer
//! - Snappy-compressed archive files are read transparently
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pmarchive::{
//!     ArchiveContext, ArchiveWriter, Direction, InsituValue, ReadOptions, Record, Timestamp,
//!     ValueSet, Values, WriterConfig,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Write a small archive
//! let mut writer = ArchiveWriter::create("./20240101", WriterConfig::new("web1"))?;
//! for sec in [100, 200, 300] {
//!     writer.append(&Record::new(
//!         Timestamp::from_secs(sec),
//!         vec![ValueSet {
//!             pmid: 42,
//!             values: Values::Insitu(vec![InsituValue { inst: 0, value: 7 }]),
//!         }],
//!     ))?;
//! }
//! writer.close()?;
//!
//! // Read it back from 150 onwards
//! let mut context = ArchiveContext::open(&["./20240101"], ReadOptions::default())?;
//! context.seek(Timestamp::from_secs(150), Direction::Forward)?;
//! for record in context.iter(Direction::Forward) {
//!     println!("{}", record?.timestamp);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`ArchiveWriter`] - Creates an archive and appends records, metadata and index entries
//! - [`ArchiveHandle`] - One open archive, shared between contexts through `Arc`
//! - [`ArchiveContext`] - A reading session over a chain of archives
//! - [`Record`] - One timestamped snapshot of metric values, or a mark record
//!
//! ## Modules
//!
//! - [`record`] - Records, timestamps and payload encoding
//! - [`codec`] - Record framing
//! - [`label`] - Archive labels
//! - [`naming`] - Archive file names and discovery
//! - [`index`] - Temporal index
//! - [`volume`] - Reading single records from a data volume
//! - [`handle`] - Open archives
//! - [`context`] - Reading sessions, archive chains and mark records
//! - [`writer`] - Archive creation
//! - `upload` - Pushing archives to an ingestion endpoint (feature `upload`)
//! - [`error`] - Error types
//!
//! Seeking and end-of-archive resolution are methods on [`ArchiveContext`]
//! and [`ArchiveHandle`].

pub mod codec;
pub mod context;
mod end;
pub mod error;
pub mod handle;
pub mod index;
pub mod label;
pub mod naming;
pub mod record;
mod seek;
#[cfg(feature = "upload")]
pub mod upload;
pub mod volume;
pub mod writer;

// Re-export primary API types at crate root for convenience.
pub use context::{ArchiveContext, ChainState, Direction, ReadOptions};
pub use error::{ArchiveError, CodecError, LabelError, Result};
pub use handle::ArchiveHandle;
pub use index::IndexEntry;
pub use label::ArchiveLabel;
pub use record::{BlockValue, InsituValue, Record, Timestamp, ValueSet, Values};
pub use writer::{ArchiveWriter, WriterConfig};
