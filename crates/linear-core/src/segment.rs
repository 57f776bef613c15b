//! Segment Descriptors and Naming
//!
//! A segment is an immutable file holding a dense, inclusive key range
//! `[from, to]` of one stream. Once uploaded it is never rewritten.
//!
//! ## Naming Convention
//!
//! The final path component of a segment's remote key encodes its range:
//!
//! ```text
//! blob-<from, 20 digits zero padded>-<to, 20 digits zero padded>
//!
//! blob-00000000000000000000-00000000000000000099   covers [0, 99]
//! ```
//!
//! Twenty digits hold any `u64`, so names sort lexically in key order. The
//! index of an archive is rebuilt purely from these names; anything under the
//! prefix that does not match the pattern is not a segment.
//!
//! Remote keys are `<stream>/blobs/<segment name>`.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix of every segment name
pub const SEGMENT_NAME_PREFIX: &str = "blob-";

/// Width of each zero-padded index in a segment name
pub const INDEX_WIDTH: usize = 20;

/// Directory component between the stream name and segment names
pub const SEGMENTS_DIR: &str = "blobs";

/// Descriptor of one uploaded segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// First key in the segment (inclusive)
    pub from: u64,

    /// Last key in the segment (inclusive)
    pub to: u64,

    /// Remote object key
    pub key: String,

    /// Size of the object in bytes
    pub size_bytes: u64,
}

impl SegmentDescriptor {
    pub fn new(from: u64, to: u64, key: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            from,
            to,
            key: key.into(),
            size_bytes,
        }
    }

    /// Whether `index` falls inside `[from, to]`
    pub fn contains(&self, index: u64) -> bool {
        self.from <= index && index <= self.to
    }

    /// Number of records in the segment
    pub fn record_count(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// Canonical segment name for the inclusive range `[from, to]`
pub fn segment_name(from: u64, to: u64) -> String {
    format!(
        "{}{:0width$}-{:0width$}",
        SEGMENT_NAME_PREFIX,
        from,
        to,
        width = INDEX_WIDTH
    )
}

/// Remote object key of a segment of `stream`
pub fn segment_key(stream: &str, from: u64, to: u64) -> String {
    format!("{}/{}/{}", stream, SEGMENTS_DIR, segment_name(from, to))
}

/// Remote prefix under which all segments of `stream` live
pub fn segments_prefix(stream: &str) -> String {
    format!("{}/{}", stream, SEGMENTS_DIR)
}

/// Parse a segment name back into its inclusive `(from, to)` range.
///
/// Returns `MalformedSegmentName` when the name does not have the
/// `blob-<20 digits>-<20 digits>` shape, and `IndexParseFailure` when it does
/// but a bound does not fit in a `u64`.
pub fn parse_segment_name(name: &str) -> Result<(u64, u64)> {
    let malformed = || Error::MalformedSegmentName(name.to_string());

    let rest = name.strip_prefix(SEGMENT_NAME_PREFIX).ok_or_else(malformed)?;
    let (from_digits, to_digits) = rest.split_once('-').ok_or_else(malformed)?;

    let well_formed = |digits: &str| {
        digits.len() == INDEX_WIDTH && digits.bytes().all(|b| b.is_ascii_digit())
    };
    if !well_formed(from_digits) || !well_formed(to_digits) {
        return Err(malformed());
    }

    let parse = |digits: &str, field: &'static str| {
        digits
            .parse::<u64>()
            .map_err(|source| Error::IndexParseFailure {
                name: name.to_string(),
                field,
                source,
            })
    };
    let from = parse(from_digits, "from")?;
    let to = parse(to_digits, "to")?;

    if from > to {
        return Err(Error::InvertedRange {
            name: name.to_string(),
            from,
            to,
        });
    }

    Ok((from, to))
}

/// Compression type for segment blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum Compression {
    None = 0,
    #[default]
    Lz4 = 1,
}

impl TryFrom<u16> for Compression {
    type Error = Error;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            _ => Err(Error::InvalidCompression(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_name_is_zero_padded() {
        assert_eq!(
            segment_name(0, 99),
            "blob-00000000000000000000-00000000000000000099"
        );
        assert_eq!(
            segment_name(u64::MAX, u64::MAX),
            "blob-18446744073709551615-18446744073709551615"
        );
    }

    #[test]
    fn test_segment_names_sort_in_key_order() {
        let mut names = vec![segment_name(100, 199), segment_name(0, 99), segment_name(9, 9)];
        names.sort();
        assert_eq!(
            names,
            vec![segment_name(0, 99), segment_name(9, 9), segment_name(100, 199)]
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        let name = segment_name(45, 54);
        assert_eq!(parse_segment_name(&name).unwrap(), (45, 54));
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        for name in [
            "dataset.json",
            "blob-1-2",
            "blob-00000000000000000000",
            "blob-00000000000000000000-0000000000000000009x",
            "blob-00000000000000000000-00000000000000000099.tmp",
            "xblob-00000000000000000000-00000000000000000099",
        ] {
            assert!(
                matches!(parse_segment_name(name), Err(Error::MalformedSegmentName(_))),
                "{} should be malformed",
                name
            );
        }
    }

    #[test]
    fn test_parse_overflow_is_index_failure() {
        let name = "blob-99999999999999999999-99999999999999999999";
        match parse_segment_name(name) {
            Err(Error::IndexParseFailure { field, .. }) => assert_eq!(field, "from"),
            other => panic!("expected IndexParseFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_inverted_range() {
        let name = "blob-00000000000000000010-00000000000000000005";
        assert!(matches!(
            parse_segment_name(name),
            Err(Error::InvertedRange { from: 10, to: 5, .. })
        ));
    }

    #[test]
    fn test_segment_key_layout() {
        assert_eq!(
            segment_key("events", 0, 9),
            "events/blobs/blob-00000000000000000000-00000000000000000009"
        );
        assert_eq!(segments_prefix("events"), "events/blobs");
    }

    #[test]
    fn test_descriptor_contains() {
        let d = SegmentDescriptor::new(50, 99, "s/blobs/x", 10);
        assert!(d.contains(50));
        assert!(d.contains(99));
        assert!(!d.contains(49));
        assert!(!d.contains(100));
        assert_eq!(d.record_count(), 50);
    }

    #[test]
    fn test_compression_try_from() {
        assert_eq!(Compression::try_from(0).unwrap(), Compression::None);
        assert_eq!(Compression::try_from(1).unwrap(), Compression::Lz4);
        assert!(matches!(
            Compression::try_from(7),
            Err(Error::InvalidCompression(7))
        ));
    }
}
