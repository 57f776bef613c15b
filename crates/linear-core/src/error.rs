//! Error Types for Linear Core
//!
//! ## Error Categories
//!
//! ### Data Integrity Errors
//! - `InvalidMagic`: Segment file doesn't start or end with the expected magic bytes
//! - `CrcMismatch`: Data corruption detected via checksum
//! - `InvalidSegment`: Malformed segment data (truncated, bad varints, bad index)
//!
//! ### Version/Compatibility Errors
//! - `UnsupportedVersion`: Segment was created by a newer format version
//! - `InvalidCompression`: Unknown compression type ID
//!
//! ### Key Errors
//! - `KeyOutOfRange`: Requested key is not held by the segment
//! - `NonContiguousKey`: Builder was handed a key that breaks the dense sequence
//!
//! ### Naming Errors
//! - `MalformedSegmentName`: An object name does not follow `blob-<from>-<to>`.
//!   Callers listing remote storage treat this as "not a segment" and skip it.
//! - `IndexParseFailure`: The name has the segment shape but a bound cannot be
//!   represented. This means the remote index is corrupt.

use std::num::ParseIntError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(u16),

    #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("Invalid segment: {0}")]
    InvalidSegment(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Key {key} out of segment range [{first}, {last}]")]
    KeyOutOfRange { key: u64, first: u64, last: u64 },

    #[error("Non-contiguous key: expected {expected}, got {got}")]
    NonContiguousKey { expected: u64, got: u64 },

    #[error("Malformed segment name: {0}")]
    MalformedSegmentName(String),

    #[error("Failed to parse {field} index of segment {name}: {source}")]
    IndexParseFailure {
        name: String,
        field: &'static str,
        #[source]
        source: ParseIntError,
    },

    #[error("Inverted range in segment name {name}: {from} > {to}")]
    InvertedRange { name: String, from: u64, to: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;
