//! Linear Core
//!
//! Shared building blocks for the linear tiered log:
//!
//! - [`Record`]: one `(index, data)` entry of an index-keyed append-only stream
//! - [`SegmentDescriptor`]: an immutable, uploaded key range and its remote key
//! - [`segment`]: the canonical `blob-<from>-<to>` naming convention
//! - [`varint`]: length prefixes used by the segment block format
//! - [`Error`]: codec and naming failures

pub mod error;
pub mod record;
pub mod segment;
pub mod varint;

pub use error::{Error, Result};
pub use record::Record;
pub use segment::{Compression, SegmentDescriptor};
