//! Archive - Remote Segments of One Stream
//!
//! The archive owns the sorted index of every segment uploaded for a named
//! stream. It seals the contents of a local log into a new segment, uploads
//! it, and answers ranged reads by planning which segments hold the range and
//! reading them through the [`SegmentCache`].
//!
//! ## Remote Layout
//!
//! ```text
//! <stream>/blobs/blob-00000000000000000000-00000000000000000099
//! <stream>/blobs/blob-00000000000000000100-00000000000000000149
//! ```
//!
//! The index is rebuilt at `open()` purely by listing `<stream>/blobs/` and
//! parsing object names. Objects that are not segments, nested deeper than
//! the prefix, or named with `from > to` are skipped; a segment name whose
//! bounds cannot be parsed aborts the open.
//!
//! ## Read Planning
//!
//! ```text
//! index:  [0 ........ 49] [50 ........ 99]
//! read(45, 10)
//!  step 1: blob-0-49   keys 45..=49
//!  step 2: blob-50-99  keys 50..=54
//! ```
//!
//! Walking from the segment that contains `from`, each step takes as much of
//! the remaining range as the segment holds. A gap or the end of the index
//! ends the plan early; the read then delivers fewer records than asked for,
//! and returns how many it delivered.
//!
//! ## Concurrency
//!
//! The index is an immutable snapshot behind a read/write lock. Readers clone
//! the `Arc` and drop the lock before any I/O. `append` calls are serialized
//! by their own async mutex and never block readers. A successful append
//! swaps in a new snapshot that includes the uploaded segment, so the
//! appending process reads its own writes.

use bytes::Bytes;
use futures::StreamExt;
use linear_core::segment::{
    parse_segment_name, segment_key, segment_name, segments_prefix, SEGMENTS_DIR,
};
use linear_core::SegmentDescriptor;
use linear_observability::metrics;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::cache::{partial_path, SegmentCache};
use crate::config::ArchiveOptions;
use crate::error::{Error, Result};
use crate::log::LocalLog;
use crate::segment::{SealedSegment, SegmentBuilder};

/// One contiguous run of keys served by one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStep {
    pub from: u64,
    pub count: u64,
    pub key: String,
}

/// Immutable, versioned snapshot of the segments of a stream
#[derive(Debug, Clone, Default)]
pub struct SegmentIndex {
    version: u64,
    segments: Vec<SegmentDescriptor>,
}

impl SegmentIndex {
    pub fn new(mut segments: Vec<SegmentDescriptor>) -> Self {
        segments.sort_by_key(|s| (s.from, s.to));
        Self {
            version: 0,
            segments,
        }
    }

    /// Segments sorted ascending by `(from, to)`
    pub fn segments(&self) -> &[SegmentDescriptor] {
        &self.segments
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Lowest and highest key held by any segment
    pub fn covered_range(&self) -> Option<(u64, u64)> {
        let first = self.segments.first()?.from;
        let last = self.segments.iter().map(|s| s.to).max()?;
        Some((first, last))
    }

    /// Next snapshot with `segment` inserted in order
    pub fn with_segment(&self, segment: SegmentDescriptor) -> Self {
        let mut segments = self.segments.clone();
        if !segments.iter().any(|s| s.key == segment.key) {
            let at = segments.partition_point(|s| (s.from, s.to) <= (segment.from, segment.to));
            segments.insert(at, segment);
        }
        Self {
            version: self.version + 1,
            segments,
        }
    }

    /// Map `[from, from + count)` onto segment reads, in ascending key order
    pub fn plan(&self, from: u64, count: u64) -> Vec<ReadStep> {
        let mut steps = Vec::new();
        if count == 0 {
            return steps;
        }

        let start = self
            .segments
            .iter()
            .position(|s| s.to >= from)
            .unwrap_or(self.segments.len());
        let mut from = from;
        let mut remaining = count;

        for segment in &self.segments[start..] {
            if segment.from > from {
                // Gap: no later segment can hold `from`
                break;
            }
            if !segment.contains(from) {
                continue;
            }

            let available = (segment.to - from).saturating_add(1);
            if remaining <= available {
                steps.push(ReadStep {
                    from,
                    count: remaining,
                    key: segment.key.clone(),
                });
                return steps;
            }

            steps.push(ReadStep {
                from,
                count: available,
                key: segment.key.clone(),
            });
            remaining -= available;
            match segment.to.checked_add(1) {
                Some(next) => from = next,
                None => return steps,
            }
        }

        steps
    }
}

/// The archived, remote part of one stream
pub struct Archive {
    name: String,
    object_store: Arc<dyn ObjectStore>,
    cache: Arc<SegmentCache>,
    options: ArchiveOptions,

    /// Where segments are built before upload
    work_dir: PathBuf,

    index: RwLock<Arc<SegmentIndex>>,

    /// Serializes `append`
    append_lock: tokio::sync::Mutex<()>,
}

impl Archive {
    /// Open the archive of stream `name` and rebuild its index from remote
    /// storage.
    pub async fn open(
        name: &str,
        object_store: Arc<dyn ObjectStore>,
        cache: Arc<SegmentCache>,
        options: ArchiveOptions,
    ) -> Result<Self> {
        validate_name(name)?;

        let work_dir = options.local_dir.join(SEGMENTS_DIR);
        tokio::fs::create_dir_all(&work_dir).await?;

        let segments = list_segments(object_store.as_ref(), name).await?;
        let index = SegmentIndex::new(segments);

        info!(
            stream = name,
            segments = index.len(),
            range = ?index.covered_range(),
            "Archive opened"
        );

        Ok(Self {
            name: name.to_string(),
            object_store,
            cache,
            options,
            work_dir,
            index: RwLock::new(Arc::new(index)),
            append_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Re-list remote storage and swap in a fresh index snapshot
    pub async fn refresh(&self) -> Result<()> {
        let segments = list_segments(self.object_store.as_ref(), &self.name).await?;
        let mut index = self.index.write();
        let version = index.version() + 1;
        *index = Arc::new(SegmentIndex {
            version,
            ..SegmentIndex::new(segments)
        });
        Ok(())
    }

    /// Seal everything `log` holds into one segment and upload it.
    ///
    /// The log is not modified; purging the archived range is up to the
    /// caller. A failure at any step leaves no remote object behind.
    pub async fn append(&self, log: &dyn LocalLog) -> Result<SegmentDescriptor> {
        let _guard = self.append_lock.lock().await;

        let (first, last) = match (log.first_index().await, log.last_index().await) {
            (Some(first), Some(last)) if first <= last => (first, last),
            _ => return Err(Error::EmptyLog),
        };

        let name = segment_name(first, last);
        let key = segment_key(&self.name, first, last);
        let build_path = self.work_dir.join(&name);

        // A failed build or upload leaves the local file behind; the next
        // append of the same range truncates it.
        let sealed = self.build(log, &build_path, first, last).await?;
        self.upload(&build_path, &key, sealed.size_bytes).await?;

        let descriptor = SegmentDescriptor::new(first, last, key.clone(), sealed.size_bytes);
        {
            let mut index = self.index.write();
            *index = Arc::new(index.with_segment(descriptor.clone()));
        }

        if let Err(e) = self.cache.adopt(&key, &build_path).await {
            warn!(
                stream = %self.name,
                key = %key,
                error = %e,
                "Failed to move built segment into cache"
            );
        }

        metrics::SEGMENTS_UPLOADED_TOTAL
            .with_label_values(&[&self.name])
            .inc();
        metrics::SEGMENT_BYTES_UPLOADED_TOTAL
            .with_label_values(&[&self.name])
            .inc_by(sealed.size_bytes);

        info!(
            stream = %self.name,
            from = first,
            to = last,
            size = sealed.size_bytes,
            key = %key,
            "Archived segment"
        );

        Ok(descriptor)
    }

    async fn build(
        &self,
        log: &dyn LocalLog,
        path: &Path,
        first: u64,
        last: u64,
    ) -> Result<SealedSegment> {
        let count_hint = (last - first).saturating_add(1);
        let mut builder = SegmentBuilder::create(path, first, count_hint, self.options.compression)?;

        for index in first..=last {
            let data = log
                .read(index)
                .await
                .map_err(|e| Error::LocalRecordRead {
                    index,
                    source: Box::new(e),
                })?;
            builder.add(index, &data)?;
        }

        Ok(builder.seal()?)
    }

    async fn upload(&self, path: &Path, key: &str, size: u64) -> Result<()> {
        let location = ObjectPath::from(key);

        metrics::REMOTE_REQUESTS_TOTAL
            .with_label_values(&["put"])
            .inc();
        let start = Instant::now();

        let result = if size >= self.options.multipart_threshold {
            self.upload_multipart(path, &location).await
        } else {
            match tokio::fs::read(path).await {
                Ok(data) => self
                    .object_store
                    .put(&location, Bytes::from(data))
                    .await
                    .map(|_| ())
                    .map_err(|e| Error::remote("put", key, e)),
                Err(e) => Err(e.into()),
            }
        };

        match &result {
            Ok(()) => {
                metrics::REMOTE_LATENCY
                    .with_label_values(&["put"])
                    .observe(start.elapsed().as_secs_f64());
                debug!(key = %key, size, "Uploaded segment");
            }
            Err(_) => {
                metrics::REMOTE_ERRORS_TOTAL
                    .with_label_values(&["put"])
                    .inc();
            }
        }

        result
    }

    /// Stream the segment file through a multipart upload, aborting it on
    /// failure so no partial object is left behind
    async fn upload_multipart(&self, path: &Path, location: &ObjectPath) -> Result<()> {
        let (multipart_id, mut writer) = self
            .object_store
            .put_multipart(location)
            .await
            .map_err(|e| Error::remote("put", location.to_string(), e))?;

        let part_size = self.options.multipart_part_size.max(1);
        let written = async {
            let mut file = tokio::fs::File::open(path).await?;
            let mut chunk = vec![0u8; part_size];
            loop {
                let n = file.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                writer.write_all(&chunk[..n]).await?;
            }
            writer.shutdown().await
        }
        .await;

        if let Err(e) = written {
            if let Err(abort) = self
                .object_store
                .abort_multipart(location, &multipart_id)
                .await
            {
                warn!(
                    key = %location,
                    error = %abort,
                    "Failed to abort multipart upload"
                );
            }
            return Err(Error::remote(
                "put",
                location.to_string(),
                object_store::Error::Generic {
                    store: "multipart",
                    source: Box::new(e),
                },
            ));
        }

        Ok(())
    }

    /// Deliver records `[from, from + count)` in ascending order.
    ///
    /// Stops early, without error, at the first key no segment holds. Returns
    /// the number of records delivered. A callback error aborts the read.
    pub async fn read<C>(&self, from: u64, count: u64, mut callback: C) -> Result<u64>
    where
        C: FnMut(u64, Bytes) -> Result<()> + Send,
    {
        let plan = self.snapshot().plan(from, count);
        let mut delivered = 0u64;

        for step in &plan {
            let fetch = |path: PathBuf| {
                download(Arc::clone(&self.object_store), step.key.clone(), path)
            };

            delivered += self
                .cache
                .with_segment(&step.key, fetch, |reader| {
                    for offset in 0..step.count {
                        let index = step.from + offset;
                        let data = reader.read(index).map_err(|source| Error::SegmentRead {
                            index,
                            segment: step.key.clone(),
                            source,
                        })?;
                        callback(index, data).map_err(|e| Error::CallbackAborted {
                            index,
                            segment: step.key.clone(),
                            source: Box::new(e),
                        })?;
                    }
                    Ok(step.count)
                })
                .await?;
        }

        metrics::RECORDS_READ_TOTAL
            .with_label_values(&[&self.name, "archive"])
            .inc_by(delivered);

        Ok(delivered)
    }

    /// Current index snapshot
    pub fn snapshot(&self) -> Arc<SegmentIndex> {
        Arc::clone(&self.index.read())
    }

    pub fn segments(&self) -> Vec<SegmentDescriptor> {
        self.snapshot().segments().to_vec()
    }

    pub fn covered_range(&self) -> Option<(u64, u64)> {
        self.snapshot().covered_range()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }
}

/// List every segment under `<stream>/blobs/`
async fn list_segments(store: &dyn ObjectStore, stream: &str) -> Result<Vec<SegmentDescriptor>> {
    let prefix = ObjectPath::from(segments_prefix(stream));

    metrics::REMOTE_REQUESTS_TOTAL
        .with_label_values(&["list"])
        .inc();
    let start = Instant::now();

    let mut listing = store.list(Some(&prefix));
    let mut segments = Vec::new();

    while let Some(meta) = listing.next().await {
        let meta = meta.map_err(|e| {
            metrics::REMOTE_ERRORS_TOTAL
                .with_label_values(&["list"])
                .inc();
            Error::remote("list", prefix.to_string(), e)
        })?;

        let Some(file_name) = meta.location.filename() else {
            continue;
        };
        // Listing is recursive; only direct children of the prefix are segments
        if meta.location.as_ref() != format!("{}/{}", prefix, file_name) {
            debug!(key = %meta.location, "Skipping object nested below the segment prefix");
            continue;
        }

        match parse_segment_name(file_name) {
            Ok((from, to)) => segments.push(SegmentDescriptor::new(
                from,
                to,
                meta.location.to_string(),
                meta.size as u64,
            )),
            Err(linear_core::Error::MalformedSegmentName(_)) => {
                debug!(key = %meta.location, "Skipping object that is not a segment");
            }
            Err(e @ linear_core::Error::InvertedRange { .. }) => {
                warn!(key = %meta.location, error = %e, "Skipping segment with inverted range");
            }
            Err(e) => return Err(e.into()),
        }
    }

    metrics::REMOTE_LATENCY
        .with_label_values(&["list"])
        .observe(start.elapsed().as_secs_f64());

    Ok(segments)
}

/// GET `key` and stream it to `path` through a partial file
async fn download(store: Arc<dyn ObjectStore>, key: String, path: PathBuf) -> Result<()> {
    metrics::REMOTE_REQUESTS_TOTAL
        .with_label_values(&["get"])
        .inc();
    let start = Instant::now();
    let partial = partial_path(&path);

    let result = async {
        let location = ObjectPath::from(key.as_str());
        let mut stream = store
            .get(&location)
            .await
            .map_err(|e| Error::remote("get", &key, e))?
            .into_stream();

        let mut file = tokio::fs::File::create(&partial).await?;
        let mut size = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::remote("get", &key, e))?;
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&partial, &path).await?;
        Ok::<u64, Error>(size)
    }
    .await;

    match result {
        Ok(size) => {
            metrics::REMOTE_LATENCY
                .with_label_values(&["get"])
                .observe(start.elapsed().as_secs_f64());
            debug!(key = %key, size, "Downloaded segment");
            Ok(())
        }
        Err(e) => {
            metrics::REMOTE_ERRORS_TOTAL
                .with_label_values(&["get"])
                .inc();
            let _ = tokio::fs::remove_file(&partial).await;
            Err(e)
        }
    }
}

/// Stream names become a path component both remotely and locally
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}
