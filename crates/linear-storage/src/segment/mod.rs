//! Segment File Format
//!
//! An immutable file holding a dense run of keys `[first_key, last_key]`.
//! Segments are built locally, uploaded once, and read back through the
//! segment cache.
//!
//! ## Segment File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (64 bytes)                                           │
//! │ - Magic bytes: "LNRB" (4 bytes)                             │
//! │ - Version: 1 (2 bytes)                                      │
//! │ - Compression: None/Lz4 (2 bytes)                           │
//! │ - First key (8 bytes)                                       │
//! │ - Last key (8 bytes)                                        │
//! │ - Record count (8 bytes)                                    │
//! │ - Block count (4 bytes)                                     │
//! │ - Reserved (28 bytes)                                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Block 1 (compressed, ~1MB target before compression)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │ ...                                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Index                                                       │
//! │ - Entry count (4 bytes)                                     │
//! │ - For each block:                                           │
//! │   * First key in block (8 bytes)                            │
//! │   * File position (8 bytes)                                 │
//! │   * Stored length (4 bytes)                                 │
//! │   * Record count (4 bytes)                                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Footer (32 bytes)                                           │
//! │ - Index position (8 bytes)                                  │
//! │ - CRC32 of header, blocks and index (4 bytes)               │
//! │ - Magic bytes: "LNRB" again (4 bytes)                       │
//! │ - Reserved (16 bytes)                                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Block Format (Uncompressed)
//!
//! Keys are dense, so they are not stored: the n-th value of a block has key
//! `first_key + n`.
//!
//! ```text
//! Value 1: length (varint) + bytes
//! Value 2: length (varint) + bytes
//! ...
//! ```
//!
//! ## Usage
//!
//! ### Building a Segment
//! ```ignore
//! let mut builder = SegmentBuilder::create(&path, 100, 50, Compression::Lz4)?;
//! for key in 100..150 {
//!     builder.add(key, &payload(key))?;
//! }
//! let sealed = builder.seal()?;
//! ```
//!
//! ### Reading a Segment
//! ```ignore
//! let reader = SegmentReader::open(&path)?;
//! let value = reader.read(120)?;
//! ```

mod reader;
mod writer;

pub use reader::SegmentReader;
pub use writer::{SealedSegment, SegmentBuilder};

/// Magic bytes for segment files: "LNRB"
pub const SEGMENT_MAGIC: [u8; 4] = *b"LNRB";

/// Version number for the segment format
pub const SEGMENT_VERSION: u16 = 1;

/// Target uncompressed block size (~1MB)
pub const BLOCK_SIZE_TARGET: usize = 1024 * 1024;

/// Segment header size (64 bytes)
pub const HEADER_SIZE: usize = 64;

/// Segment footer size (32 bytes)
pub const FOOTER_SIZE: usize = 32;

/// Size of one block index entry
pub const INDEX_ENTRY_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    /// Key of the first value in the block
    pub first_key: u64,
    /// File position where the block starts
    pub position: u64,
    /// Stored (possibly compressed) length of the block
    pub length: u32,
    /// Number of values in the block
    pub record_count: u32,
}
