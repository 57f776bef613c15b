//! Local Log Abstraction
//!
//! The archive seals whatever a local, append-only, index-keyed log holds.
//! Any log that can report its bounds and produce records by index can be
//! archived; [`HeadLog`](crate::head::HeadLog) is the file-backed
//! implementation used by datasets.
//!
//! Contract:
//! - indices are strictly increasing with no gaps (`append` enforces this)
//! - `first_index`/`last_index` are `None` while the log is empty
//! - `read` of an index outside the held range is `NotFound`

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

#[async_trait]
pub trait LocalLog: Send + Sync {
    /// Index of the oldest held record
    async fn first_index(&self) -> Option<u64>;

    /// Index of the newest held record
    async fn last_index(&self) -> Option<u64>;

    /// Append the record for `index`, which must directly follow the last one
    async fn append(&self, index: u64, data: Bytes) -> Result<()>;

    /// Read the record stored for `index`
    async fn read(&self, index: u64) -> Result<Bytes>;
}
