//! Open datasets of one server process
//!
//! Datasets are opened lazily on first use and stay open until shutdown.
//! Every open dataset gets a background archiver; all archivers share one
//! shutdown signal.
//!
//! The name map only hands out a per-name slot; opening or creating the
//! dataset runs on that slot with the map unlocked, so a slow remote call for
//! one dataset does not hold up requests for the others. Concurrent callers
//! for the same name wait on the same slot and share one open.

use linear_storage::{
    ArchiveOptions, Dataset, DatasetConfig, Error, Result, SegmentCache,
};
use object_store::ObjectStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::info;

type Slot = Arc<OnceCell<Arc<Dataset>>>;

pub struct DatasetRegistry {
    object_store: Arc<dyn ObjectStore>,
    cache: Arc<SegmentCache>,
    options: ArchiveOptions,
    datasets: Mutex<HashMap<String, Slot>>,
    archivers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl DatasetRegistry {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        cache: Arc<SegmentCache>,
        options: ArchiveOptions,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            object_store,
            cache,
            options,
            datasets: Mutex::new(HashMap::new()),
            archivers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Create a dataset and keep it open
    pub async fn create(&self, name: &str, config: DatasetConfig) -> Result<Arc<Dataset>> {
        let slot = self.slot(name).await;
        if slot.initialized() {
            return Err(Error::DatasetExists(name.to_string()));
        }

        let created = AtomicBool::new(false);
        let result = slot
            .get_or_try_init(|| {
                let created = &created;
                async move {
                    let dataset = Dataset::create(
                        name,
                        config,
                        self.object_store.clone(),
                        self.cache.clone(),
                        self.options.clone(),
                    )
                    .await?;
                    created.store(true, Ordering::Relaxed);
                    Ok::<_, Error>(self.track(dataset).await)
                }
            })
            .await
            .cloned();

        match result {
            // Another caller opened it first
            Ok(_) if !created.load(Ordering::Relaxed) => {
                Err(Error::DatasetExists(name.to_string()))
            }
            Ok(dataset) => Ok(dataset),
            Err(e) => {
                self.release(name, &slot).await;
                Err(e)
            }
        }
    }

    /// Get an open dataset, opening it on first use
    pub async fn get(&self, name: &str) -> Result<Arc<Dataset>> {
        let slot = self.slot(name).await;

        let result = slot
            .get_or_try_init(|| async move {
                let dataset = Dataset::open(
                    name,
                    self.object_store.clone(),
                    self.cache.clone(),
                    self.options.clone(),
                )
                .await?;
                Ok::<_, Error>(self.track(dataset).await)
            })
            .await
            .cloned();

        if result.is_err() {
            self.release(name, &slot).await;
        }
        result
    }

    /// Slot for `name`, inserted empty on first request
    async fn slot(&self, name: &str) -> Slot {
        let mut datasets = self.datasets.lock().await;
        datasets.entry(name.to_string()).or_default().clone()
    }

    /// Forget a slot whose open failed, unless it has been filled meanwhile
    async fn release(&self, name: &str, slot: &Slot) {
        let mut datasets = self.datasets.lock().await;
        if let Some(current) = datasets.get(name) {
            if Arc::ptr_eq(current, slot) && !current.initialized() {
                datasets.remove(name);
            }
        }
    }

    async fn track(&self, dataset: Dataset) -> Arc<Dataset> {
        let dataset = Arc::new(dataset);
        let handle = dataset.clone().spawn_archiver(self.shutdown.subscribe());
        self.archivers.lock().await.push(handle);
        dataset
    }

    /// Stop every archiver and close the segment cache
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);

        let handles: Vec<_> = self.archivers.lock().await.drain(..).collect();
        info!(archivers = handles.len(), "Stopping archivers");
        for handle in handles {
            let _ = handle.await;
        }

        self.cache.close()
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }
}
