//! Segment Cache with LRU Eviction
//!
//! A bounded, disk-backed working set of remote segments. Each resident
//! segment is a local file plus an open [`SegmentReader`]; the total size of
//! the files is bounded by the cache's byte budget.
//!
//! ## How It Works
//!
//! ```text
//! with_segment("events/blobs/blob-..0-..99", fetch, use)
//!         ↓
//! Local file: <cache_dir>/events%2Fblobs%2Fblob-..0-..99
//!         ↓
//!     RESIDENT? ────YES──→ read lock entry ──→ use(reader)
//!         │
//!         NO (one caller loads, the others wait for it)
//!         ↓
//! File already on disk? ──NO──→ fetch(local path)
//!         ↓
//! stat size, open reader, insert (evicting LRU segments)
//!         ↓
//! read lock entry ──→ use(reader)
//! ```
//!
//! ## Eviction Safety
//!
//! A reader obtained from the cache may be in use by one task while another
//! task's insertion evicts it. Every entry carries its own read/write lock:
//!
//! - `use` runs while holding the entry's read lock
//! - eviction takes the write lock, latches `evicted`, closes the reader and
//!   deletes the file
//!
//! Eviction therefore waits for in-progress reads, and a caller that acquires
//! the read lock after eviction sees `evicted` and retries the lookup, which
//! loads the segment again. The retry is internal; callers never see the race.
//!
//! `use` must not call back into the same cache: eviction runs under the
//! cache's global lock and waits for the entry lock held by `use`.
//!
//! ## Restarts
//!
//! `open()` scans the cache directory and registers every segment file it
//! finds as a warm entry, without contacting remote storage. Leftover partial
//! downloads are deleted.
//!
//! ## Local File Names
//!
//! Remote keys contain `/`, so they are percent-escaped into a single file
//! name: every byte outside `[A-Za-z0-9_-]` becomes `%XX`. The mapping is
//! injective, so distinct keys never share a file.

use linear_observability::metrics;
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lru::LruCache;
use crate::segment::SegmentReader;

/// Suffix of in-progress downloads inside the cache directory
pub const PARTIAL_SUFFIX: &str = ".partial";

/// A cached segment: local file, open reader and eviction latch
pub struct SyncedSegment {
    path: PathBuf,
    state: RwLock<SegmentState>,
}

struct SegmentState {
    reader: Option<SegmentReader>,
    evicted: bool,
}

impl SyncedSegment {
    fn new(path: PathBuf, reader: SegmentReader) -> Self {
        Self {
            path,
            state: RwLock::new(SegmentState {
                reader: Some(reader),
                evicted: false,
            }),
        }
    }

    /// Latch `evicted` and close the reader once in-progress reads finish
    fn retire(&self) {
        let mut state = self.state.write();
        state.evicted = true;
        if let Some(reader) = state.reader.take() {
            reader.close();
        }
    }

    /// Retire the entry and delete its local file
    fn evict(&self) {
        self.retire();
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(
                path = ?self.path,
                error = %e,
                "Failed to delete evicted segment"
            );
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_evicted(&self) -> bool {
        self.state.read().evicted
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub entry_count: usize,
    pub utilization_pct: f64,
}

/// Disk-backed LRU cache of segment files
pub struct SegmentCache {
    /// Directory where cached segments are stored
    cache_dir: PathBuf,

    lru: LruCache<String, Arc<SyncedSegment>>,
}

impl SegmentCache {
    /// Open the cache rooted at `cache_dir`, holding at most `max_size` bytes,
    /// and register every segment already on disk.
    pub async fn open(cache_dir: impl AsRef<Path>, max_size: u64) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&cache_dir).await?;

        let lru = LruCache::new(max_size, |key: &String, segment: &Arc<SyncedSegment>| {
            segment.evict();
            metrics::CACHE_EVICTIONS_TOTAL.inc();
            debug!(key = %key, path = ?segment.path(), "Evicted segment from cache");
        });

        let cache = Self { cache_dir, lru };
        cache.reconcile().await?;
        Ok(cache)
    }

    /// Register the files found in the cache directory as warm entries
    async fn reconcile(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.cache_dir).await?;
        let mut warm = 0usize;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();

            if name.ends_with(PARTIAL_SUFFIX) {
                debug!(path = ?path, "Removing partial download");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = ?path, error = %e, "Failed to remove partial download");
                }
                continue;
            }

            let Some(key) = unescape_key(&name) else {
                warn!(path = ?path, "Skipping file with unrecognized name in cache directory");
                continue;
            };

            let max_size = self.lru.max_size();
            let loaded = self
                .lru
                .get_or_load(key.clone(), || open_local(path.clone(), max_size))
                .await;

            match loaded {
                Ok(_) => warm += 1,
                Err(e) => {
                    warn!(
                        key = %key,
                        path = ?path,
                        error = %e,
                        "Failed to load cached segment, removing"
                    );
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }

        metrics::CACHE_SIZE_BYTES.set(self.lru.current_size() as i64);
        debug!(
            dir = ?self.cache_dir,
            entries = warm,
            size = self.lru.current_size(),
            "Segment cache opened"
        );

        Ok(())
    }

    /// Run `use_segment` against the segment stored under `key`.
    ///
    /// On a miss the segment is materialized by `fetch(local_path)` (unless a
    /// readable file is already there) and inserted. Concurrent callers for the
    /// same key share one load. `use_segment` runs while the entry is pinned
    /// against eviction.
    pub async fn with_segment<F, Fut, U, T>(&self, key: &str, fetch: F, use_segment: U) -> Result<T>
    where
        F: Fn(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
        U: FnOnce(&SegmentReader) -> Result<T>,
    {
        let path = self.local_path(key);
        let max_size = self.lru.max_size();

        loop {
            let mut missed = false;
            let segment = self
                .lru
                .get_or_load(key.to_string(), || {
                    missed = true;
                    load(path.clone(), fetch(path.clone()), max_size)
                })
                .await?;

            if missed {
                metrics::CACHE_MISSES_TOTAL.inc();
                metrics::CACHE_SIZE_BYTES.set(self.lru.current_size() as i64);
            } else {
                metrics::CACHE_HITS_TOTAL.inc();
            }

            let state = segment.state.read();
            let reader = match (&state.reader, state.evicted) {
                (Some(reader), false) => reader,
                _ => {
                    debug!(key = %key, "Segment evicted before use, retrying");
                    continue;
                }
            };

            return use_segment(reader);
        }
    }

    /// Move a freshly built segment at `built` into the cache as `key`
    pub async fn adopt(&self, key: &str, built: &Path) -> Result<()> {
        if self.lru.contains(&key.to_string()) {
            tokio::fs::remove_file(built).await?;
            return Ok(());
        }

        let path = self.local_path(key);
        if tokio::fs::rename(built, &path).await.is_err() {
            // Different filesystem
            tokio::fs::copy(built, &path).await?;
            tokio::fs::remove_file(built).await?;
        }

        let max_size = self.lru.max_size();
        let adopted = self
            .lru
            .get_or_load(key.to_string(), || open_local(path.clone(), max_size))
            .await;
        if let Err(e) = adopted {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        metrics::CACHE_SIZE_BYTES.set(self.lru.current_size() as i64);
        debug!(key = %key, path = ?path, "Adopted built segment into cache");
        Ok(())
    }

    /// Retire every resident entry. Files stay on disk for the next `open`.
    pub fn close(&self) -> Result<()> {
        self.lru.close(|_, segment| {
            segment.retire();
            Ok(())
        })?;
        metrics::CACHE_SIZE_BYTES.set(0);
        Ok(())
    }

    /// Local file path for `key`
    pub fn local_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(escape_key(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lru.contains(&key.to_string())
    }

    /// Resident keys, most recently used first
    pub fn keys(&self) -> Vec<String> {
        self.lru.keys()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn stats(&self) -> CacheStats {
        let current_size = self.lru.current_size();
        let max_size = self.lru.max_size();

        CacheStats {
            current_size,
            max_size,
            entry_count: self.lru.len(),
            utilization_pct: if max_size > 0 {
                (current_size as f64 / max_size as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}

/// Loader for a miss: reuse a readable local file or fetch a fresh one
async fn load<Fut>(path: PathBuf, fetch: Fut, max_size: u64) -> Result<(Arc<SyncedSegment>, u64)>
where
    Fut: Future<Output = Result<()>>,
{
    if tokio::fs::try_exists(&path).await? {
        match open_local(path.clone(), max_size).await {
            Ok(loaded) => return Ok(loaded),
            // A fresh copy would be just as large
            Err(e @ Error::CapacityExceeded { .. }) => {
                tokio::fs::remove_file(&path).await?;
                return Err(e);
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Discarding unreadable cached segment");
                tokio::fs::remove_file(&path).await?;
            }
        }
    }

    fetch.await?;

    let opened = open_local(path.clone(), max_size).await;
    if opened.is_err() {
        let _ = tokio::fs::remove_file(&path).await;
    }
    opened
}

/// Stat and open a segment file that is already on local disk
async fn open_local(path: PathBuf, max_size: u64) -> Result<(Arc<SyncedSegment>, u64)> {
    let size = tokio::fs::metadata(&path).await?.len();
    if size > max_size {
        return Err(Error::CapacityExceeded { size, max_size });
    }

    let reader = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || SegmentReader::open(path))
            .await
            .map_err(std::io::Error::other)??
    };

    Ok((Arc::new(SyncedSegment::new(path, reader)), size))
}

/// Path used while a download of `path` is in progress
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Percent-escape a remote key into a single file name
pub fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{:02X}", byte));
        }
    }
    escaped
}

/// Inverse of [`escape_key`]. Returns `None` for names `escape_key` cannot
/// produce.
pub fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut raw = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            raw.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            raw.push(bytes[i]);
            i += 1;
        }
    }

    let key = String::from_utf8(raw).ok()?;
    (escape_key(&key) == name).then_some(key)
}
