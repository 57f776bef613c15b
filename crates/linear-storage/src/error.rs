//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### Index Errors
//! - `IndexParseFailure` (via `Core`): a remote object has the segment name
//!   shape but an unrepresentable bound. Fatal to `Archive::open`.
//! - Malformed names are never surfaced; open skips them.
//!
//! ### Remote Errors
//! - `Remote`: list, get or put against the object store failed
//!
//! ### Archive Errors
//! - `EmptyLog`: append was asked to seal a log that holds nothing
//! - `LocalRecordRead`: the local log could not produce a record being archived
//! - `SegmentRead`: a cached segment could not produce a planned record
//! - `CallbackAborted`: the read callback returned an error
//!
//! ### Cache Errors
//! - `CapacityExceeded`: a single entry is larger than the whole cache
//! - `Shared`: a load error observed through a deduplicated load
//!
//! ### Head Log Errors
//! - `IndexNotIncreasing`, `IndexGap`, `IndexOutOfRange`, `NotFound`
//!
//! ## Usage
//!
//! All storage operations return `Result<T>` which is aliased to
//! `Result<T, Error>`.

use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] linear_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Remote {operation} of {key} failed: {source}")]
    Remote {
        operation: &'static str,
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("Entry of {size} bytes exceeds cache capacity of {max_size} bytes")]
    CapacityExceeded { size: u64, max_size: u64 },

    #[error("Local log is empty, nothing to archive")]
    EmptyLog,

    #[error("Failed to read record {index} from local log: {source}")]
    LocalRecordRead {
        index: u64,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to read record {index} from segment {segment}: {source}")]
    SegmentRead {
        index: u64,
        segment: String,
        #[source]
        source: linear_core::Error,
    },

    #[error("Failed to process record {index} from segment {segment}: {source}")]
    CallbackAborted {
        index: u64,
        segment: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Index {got} does not follow last index {last}")]
    IndexNotIncreasing { last: u64, got: u64 },

    #[error("Gap before index {got}, expected {expected}")]
    IndexGap { expected: u64, got: u64 },

    #[error("Index {0} is reserved")]
    IndexOutOfRange(u64),

    #[error("Record {0} not found")]
    NotFound(u64),

    #[error("Corrupted head log record at offset {position}")]
    CorruptedLog { position: u64 },

    #[error("Dataset already exists: {0}")]
    DatasetExists(String),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("{} errors while closing: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),

    #[error(transparent)]
    Shared(Arc<Error>),

    /// Free-form failure raised by a caller-supplied callback
    #[error("{0}")]
    Callback(String),
}

impl Error {
    /// Wrap an object store failure with the operation and key it concerned
    pub fn remote(operation: &'static str, key: impl Into<String>, source: object_store::Error) -> Self {
        Error::Remote {
            operation,
            key: key.into(),
            source,
        }
    }

    /// Recover the owned error when this caller is the last holder of a
    /// shared load error, so variants stay matchable.
    pub(crate) fn unshare(err: Arc<Error>) -> Self {
        Arc::try_unwrap(err).unwrap_or_else(Error::Shared)
    }

    /// Look through `Shared` wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
