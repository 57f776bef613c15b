//! Record Data Structure
//!
//! A record is one entry of an index-keyed stream: a `u64` index and an opaque
//! payload. Within a stream indices are unique and strictly increasing, and a
//! sealed segment holds a dense run of them with no gaps.
//!
//! ```ignore
//! let record = Record::new(42, Bytes::from_static(b"payload"));
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single record in a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Position of this record in the stream
    pub index: u64,

    /// Payload
    pub data: Bytes,
}

impl Record {
    pub fn new(index: u64, data: Bytes) -> Self {
        Self { index, data }
    }

    /// Estimate the size of this record in bytes
    pub fn estimated_size(&self) -> usize {
        8 + self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimated_size() {
        let record = Record::new(7, Bytes::from_static(b"abcd"));
        assert_eq!(record.estimated_size(), 12);
    }

    #[test]
    fn test_serde_roundtrip() {
        let record = Record::new(3, Bytes::from_static(b"xyz"));
        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
