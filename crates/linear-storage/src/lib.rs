//! Linear Storage Layer
//!
//! Tiered storage for index-keyed streams: recent records live in a local
//! head log, older ones in immutable segments on S3-compatible object
//! storage, with a bounded local cache of segment files in between.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐
//! │  Producers  │
//! └──────┬──────┘
//!        │ append(index, data)
//!        ▼
//! ┌─────────────────┐
//! │ HeadLog         │  local, CRC-framed, append-only
//! └────────┬────────┘
//!          │ seal (size or age limit)
//!          ▼
//! ┌─────────────────┐      ┌──────────────────┐
//! │ Archive         │─────►│  Object store    │
//! │ - Sorted index  │ put  │  <name>/blobs/.. │
//! │ - Read planner  │◄─────│                  │
//! └────────┬────────┘ get  └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ SegmentCache    │  LRU of local segment files + open readers
//! └─────────────────┘
//! ```
//!
//! ## Main Components
//!
//! - [`LruCache`]: byte-bounded LRU with singleflight loading
//! - [`SegmentBuilder`] / [`SegmentReader`]: block-compressed segment files
//! - [`SegmentCache`]: disk-backed segment cache, safe against eviction races
//! - [`Archive`]: remote segments of one stream, `append` and ranged `read`
//! - [`HeadLog`]: the unarchived tail of a stream
//! - [`Dataset`]: head log and archive behind one append/read API
//!
//! ## Usage Example
//!
//! ```ignore
//! use linear_storage::{ArchiveOptions, Dataset, DatasetConfig, SegmentCache};
//! use object_store::memory::InMemory;
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemory::new());
//! let cache = Arc::new(SegmentCache::open("./data/cache", 1 << 30).await?);
//! let options = ArchiveOptions::default();
//!
//! let dataset = Dataset::create("events", DatasetConfig::default(), store, cache, options).await?;
//! dataset.append(0, "hello".into()).await?;
//! dataset.archive_now().await?;
//!
//! dataset.read(0, 1, |index, data| {
//!     println!("{index}: {data:?}");
//!     Ok(())
//! }).await?;
//! ```

pub mod archive;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod error;
pub mod head;
pub mod log;
pub mod lru;
pub mod segment;

pub use archive::{Archive, ReadStep, SegmentIndex};
pub use cache::{CacheStats, SegmentCache};
pub use config::{ArchiveOptions, DatasetConfig};
pub use dataset::{Dataset, DatasetInfo};
pub use error::{Error, Result};
pub use head::{HeadConfig, HeadLog};
pub use log::LocalLog;
pub use lru::LruCache;
pub use segment::{SealedSegment, SegmentBuilder, SegmentReader};
