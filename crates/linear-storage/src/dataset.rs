//! Dataset - Head Log Plus Archive
//!
//! A dataset is a named, index-keyed stream. New records land in a local
//! [`HeadLog`]; once the head grows past `max_archive_size` bytes or its
//! oldest record is older than `max_archive_time_ms`, the head is sealed into
//! a segment, uploaded by the [`Archive`], and purged.
//!
//! ## Layout
//!
//! ```text
//! remote:  <name>/dataset.json          DatasetConfig
//!          <name>/blobs/blob-<from>-<to>
//! local:   <data_dir>/<name>/head/      HeadLog files
//!          <data_dir>/<name>/blobs/     segments being built
//! ```
//!
//! ## Reads
//!
//! `read(from, count)` serves indices below the head's first index from the
//! archive and the rest from the head, in ascending order. Like the archive,
//! it stops early at the first index nothing holds.

use bytes::Bytes;
use linear_core::SegmentDescriptor;
use linear_observability::metrics;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::archive::{validate_name, Archive};
use crate::cache::SegmentCache;
use crate::config::{ArchiveOptions, DatasetConfig};
use crate::error::{Error, Result};
use crate::head::{HeadConfig, HeadLog};

/// Name of the remote object holding a dataset's configuration
pub const DATASET_CONFIG_FILE: &str = "dataset.json";

const HEAD_DIR: &str = "head";

/// Summary of a dataset, as served over HTTP
#[derive(Debug, Clone, Serialize)]
pub struct DatasetInfo {
    pub name: String,
    pub config: DatasetConfig,
    pub first_index: Option<u64>,
    pub last_index: Option<u64>,
    pub head_records: usize,
    pub head_bytes: u64,
    pub archived_segments: usize,
}

pub struct Dataset {
    name: String,
    config: DatasetConfig,
    head: HeadLog,
    archive: Archive,

    /// Keeps seal-then-purge atomic with respect to other archivers
    archive_lock: tokio::sync::Mutex<()>,
}

impl Dataset {
    /// Create a new dataset and store its configuration remotely.
    ///
    /// `options.local_dir` is the data root; the dataset works in
    /// `<local_dir>/<name>/`.
    pub async fn create(
        name: &str,
        config: DatasetConfig,
        object_store: Arc<dyn ObjectStore>,
        cache: Arc<SegmentCache>,
        options: ArchiveOptions,
    ) -> Result<Self> {
        validate_name(name)?;

        let location = config_location(name);
        match object_store.head(&location).await {
            Ok(_) => return Err(Error::DatasetExists(name.to_string())),
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(Error::remote("head", location.to_string(), e)),
        }

        let body = serde_json::to_vec_pretty(&config)?;
        object_store
            .put(&location, Bytes::from(body))
            .await
            .map_err(|e| Error::remote("put", location.to_string(), e))?;

        info!(
            dataset = name,
            max_archive_size = config.max_archive_size,
            max_archive_time_ms = config.max_archive_time_ms,
            "Dataset created"
        );

        Self::open_with(name, config, object_store, cache, options).await
    }

    /// Open an existing dataset
    pub async fn open(
        name: &str,
        object_store: Arc<dyn ObjectStore>,
        cache: Arc<SegmentCache>,
        options: ArchiveOptions,
    ) -> Result<Self> {
        validate_name(name)?;

        let location = config_location(name);
        let body = match object_store.get(&location).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| Error::remote("get", location.to_string(), e))?,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::DatasetNotFound(name.to_string()))
            }
            Err(e) => return Err(Error::remote("get", location.to_string(), e)),
        };
        let config: DatasetConfig = serde_json::from_slice(&body)?;

        Self::open_with(name, config, object_store, cache, options).await
    }

    async fn open_with(
        name: &str,
        config: DatasetConfig,
        object_store: Arc<dyn ObjectStore>,
        cache: Arc<SegmentCache>,
        options: ArchiveOptions,
    ) -> Result<Self> {
        let local_dir: PathBuf = options.local_dir.join(name);
        let head = HeadLog::open(HeadConfig::new(local_dir.join(HEAD_DIR))).await?;
        let archive = Archive::open(
            name,
            object_store,
            cache,
            ArchiveOptions {
                local_dir,
                ..options
            },
        )
        .await?;

        Ok(Self {
            name: name.to_string(),
            config,
            head,
            archive,
            archive_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Append one record to the head
    pub async fn append(&self, index: u64, data: Bytes) -> Result<()> {
        self.head.append(index, &data).await?;
        metrics::RECORDS_APPENDED_TOTAL
            .with_label_values(&[&self.name])
            .inc();
        Ok(())
    }

    /// Append consecutive records; all or none are appended
    pub async fn append_batch(&self, records: &[(u64, Bytes)]) -> Result<()> {
        self.head.append_batch(records).await?;
        metrics::RECORDS_APPENDED_TOTAL
            .with_label_values(&[&self.name])
            .inc_by(records.len() as u64);
        Ok(())
    }

    /// Deliver records `[from, from + count)` in ascending order from the
    /// archive and then the head. Returns the number delivered.
    pub async fn read<C>(&self, from: u64, count: u64, mut callback: C) -> Result<u64>
    where
        C: FnMut(u64, Bytes) -> Result<()> + Send,
    {
        let end = from.saturating_add(count);
        let mut next = from;
        let mut from_head = 0u64;

        while next < end {
            match self.head.first_index().await {
                Some(first) if next >= first => match self.head.read(next).await {
                    Ok(data) => {
                        callback(next, data)?;
                        next += 1;
                        from_head += 1;
                    }
                    Err(Error::NotFound(_)) => {
                        // Purged by a concurrent archive: continue from the archive
                        if self.head.first_index().await.map_or(true, |f| f > next) {
                            continue;
                        }
                        break;
                    }
                    Err(e) => return Err(e),
                },
                head_first => {
                    let limit = head_first.map_or(end, |first| first.min(end));
                    let wanted = limit - next;
                    let delivered = self.archive.read(next, wanted, &mut callback).await?;
                    next += delivered;
                    if delivered < wanted {
                        break;
                    }
                }
            }
        }

        if from_head > 0 {
            metrics::RECORDS_READ_TOTAL
                .with_label_values(&[&self.name, "head"])
                .inc_by(from_head);
        }

        Ok(next - from)
    }

    /// Seal the head into a segment and purge what was archived.
    ///
    /// Returns `None` when the head is empty.
    pub async fn archive_now(&self) -> Result<Option<SegmentDescriptor>> {
        let _guard = self.archive_lock.lock().await;

        let descriptor = match self.archive.append(&self.head).await {
            Ok(descriptor) => descriptor,
            Err(Error::EmptyLog) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.head.purge_through(descriptor.to).await?;

        Ok(Some(descriptor))
    }

    /// Whether the head has outgrown its size or age limit
    pub async fn should_archive(&self) -> bool {
        if self.head.is_empty().await {
            return false;
        }
        if self.head.size_bytes().await >= self.config.max_archive_size {
            return true;
        }
        self.head
            .oldest_age()
            .await
            .is_some_and(|age| age >= self.config.max_archive_time())
    }

    /// Run the archiver in the background until `shutdown` flips or its
    /// sender is dropped
    pub fn spawn_archiver(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = (self.config.max_archive_time() / 4)
            .clamp(Duration::from_millis(50), Duration::from_secs(5));

        tokio::spawn(async move {
            info!(
                dataset = %self.name,
                interval_ms = interval.as_millis() as u64,
                "Archiver started"
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if !self.should_archive().await {
                    continue;
                }

                match self.archive_now().await {
                    Ok(Some(descriptor)) => debug!(
                        dataset = %self.name,
                        from = descriptor.from,
                        to = descriptor.to,
                        "Archiver sealed head"
                    ),
                    Ok(None) => {}
                    Err(e) => error!(
                        dataset = %self.name,
                        error = %e,
                        "Archiving failed"
                    ),
                }
            }

            info!(dataset = %self.name, "Archiver stopped");
        })
    }

    pub async fn info(&self) -> DatasetInfo {
        let archived = self.archive.covered_range();
        let head_first = self.head.first_index().await;
        let head_last = self.head.last_index().await;

        let first_index = match (archived, head_first) {
            (Some((first, _)), _) => Some(first),
            (None, head) => head,
        };
        let last_index = head_last.or(archived.map(|(_, last)| last));

        DatasetInfo {
            name: self.name.clone(),
            config: self.config.clone(),
            first_index,
            last_index,
            head_records: self.head.len().await,
            head_bytes: self.head.size_bytes().await,
            archived_segments: self.archive.segments().len(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn head(&self) -> &HeadLog {
        &self.head
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }
}

fn config_location(name: &str) -> ObjectPath {
    ObjectPath::from(format!("{}/{}", name, DATASET_CONFIG_FILE))
}
