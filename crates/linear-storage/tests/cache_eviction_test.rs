//! Segment cache behavior under concurrent use and eviction

use futures::future::{BoxFuture, FutureExt};
use linear_core::Compression;
use linear_storage::{Result, SegmentBuilder, SegmentCache};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tempfile::TempDir;

const RECORDS: u64 = 20;

fn write_segment(path: &Path, first: u64) {
    let mut builder = SegmentBuilder::create(path, first, RECORDS, Compression::Lz4).unwrap();
    for key in first..first + RECORDS {
        builder.add(key, format!("{:08}", key).as_bytes()).unwrap();
    }
    builder.seal().unwrap();
}

fn segment_size() -> u64 {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sample");
    write_segment(&path, 0);
    std::fs::metadata(&path).unwrap().len()
}

fn fetch_segment(
    first: u64,
    calls: Arc<AtomicUsize>,
) -> impl Fn(PathBuf) -> BoxFuture<'static, Result<()>> {
    move |path: PathBuf| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            write_segment(&path, first);
            Ok(())
        }
        .boxed()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reader_survives_concurrent_eviction() {
    let dir = TempDir::new().unwrap();
    // Room for exactly one segment
    let cache = Arc::new(SegmentCache::open(dir.path(), segment_size()).await.unwrap());
    let calls_a = Arc::new(AtomicUsize::new(0));
    let calls_b = Arc::new(AtomicUsize::new(0));

    let path_a = cache.local_path("s/blobs/a");
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let reader_task = {
        let cache = Arc::clone(&cache);
        let fetch = fetch_segment(0, Arc::clone(&calls_a));
        tokio::spawn(async move {
            cache
                .with_segment("s/blobs/a", fetch, move |reader| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    // Still readable although another load evicted the entry
                    Ok(reader.read(7)?)
                })
                .await
        })
    };

    tokio::task::spawn_blocking(move || entered_rx.recv().unwrap())
        .await
        .unwrap();
    assert!(path_a.exists());

    let loader_task = {
        let cache = Arc::clone(&cache);
        let fetch = fetch_segment(100, Arc::clone(&calls_b));
        tokio::spawn(async move {
            cache
                .with_segment("s/blobs/b", fetch, |reader| Ok(reader.read(105)?))
                .await
        })
    };

    // The loader must wait for the reader before deleting the file
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(path_a.exists());
    assert!(!loader_task.is_finished());

    release_tx.send(()).unwrap();

    let value = reader_task.await.unwrap().unwrap();
    assert_eq!(&value[..], b"00000007");
    let value = loader_task.await.unwrap().unwrap();
    assert_eq!(&value[..], b"00000105");

    assert!(!path_a.exists());
    assert!(!cache.contains("s/blobs/a"));
    assert!(cache.contains("s/blobs/b"));

    // Using the evicted key again loads it again
    let value = cache
        .with_segment("s/blobs/a", fetch_segment(0, Arc::clone(&calls_a)), |reader| {
            Ok(reader.read(3)?)
        })
        .await
        .unwrap();
    assert_eq!(&value[..], b"00000003");
    assert_eq!(calls_a.load(Ordering::SeqCst), 2);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_share_one_fetch() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(SegmentCache::open(dir.path(), 1024 * 1024).await.unwrap());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..16u64 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tasks.push(tokio::spawn(async move {
            let fetch = move |path: PathBuf| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    write_segment(&path, 0);
                    Ok(())
                }
            };
            cache
                .with_segment("s/blobs/shared", fetch, |reader| Ok(reader.read(i)?))
                .await
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let value = task.await.unwrap().unwrap();
        assert_eq!(value, format!("{:08}", i).into_bytes());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_churn_under_small_budget() {
    let dir = TempDir::new().unwrap();
    // Two segments fit at a time, eight keys compete
    let cache = Arc::new(SegmentCache::open(dir.path(), segment_size() * 2).await.unwrap());

    let mut tasks = Vec::new();
    for worker in 0..8u64 {
        let cache = Arc::clone(&cache);
        tasks.push(tokio::spawn(async move {
            for round in 0..20u64 {
                let segment = (worker + round) % 8;
                let first = segment * 100;
                let key = format!("s/blobs/{}", segment);
                let fetch = fetch_segment(first, Arc::new(AtomicUsize::new(0)));
                let value = cache
                    .with_segment(&key, fetch, |reader| Ok(reader.read(first + round % RECORDS)?))
                    .await
                    .unwrap();
                assert_eq!(value, format!("{:08}", first + round % RECORDS).into_bytes());
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert!(cache.stats().current_size <= segment_size() * 2);
    assert!(cache.keys().len() <= 2);
}
