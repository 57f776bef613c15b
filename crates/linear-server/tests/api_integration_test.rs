//! Integration tests for the linear REST API
//!
//! Builds the real router over an in-memory object store and a temporary
//! data directory, then sends requests via tower::ServiceExt.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use linear_core::Record;
use linear_server::handlers::{decode_records, encode_records};
use linear_server::{create_router, AppState, DatasetRegistry};
use linear_storage::{ArchiveOptions, SegmentCache};
use tempfile::TempDir;
use tower::ServiceExt;

async fn test_app() -> (axum::Router, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let object_store =
        Arc::new(object_store::memory::InMemory::new()) as Arc<dyn object_store::ObjectStore>;
    let cache = Arc::new(
        SegmentCache::open(temp_dir.path().join("cache"), 10 * 1024 * 1024)
            .await
            .unwrap(),
    );
    let options = ArchiveOptions {
        local_dir: temp_dir.path().join("datasets"),
        ..Default::default()
    };

    let registry = Arc::new(DatasetRegistry::new(object_store, cache, options));
    (create_router(AppState { registry }), temp_dir)
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: impl Into<Body>) -> (StatusCode, Bytes) {
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

async fn create(app: &axum::Router, name: &str) {
    let (status, _) = send(app, "PUT", &format!("/api/datasets/{}", name), Body::empty()).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_health_check() {
    let (app, _dir) = test_app().await;
    let (status, body) = send(&app, "GET", "/health", Body::empty()).await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    linear_observability::init();
    let (app, _dir) = test_app().await;
    create(&app, "events").await;
    send(&app, "POST", "/api/datasets/events/records/0", "a").await;
    let (status, _) = send(&app, "POST", "/api/datasets/events/archive", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/plain; version=0.0.4"
    );
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("linear_cache_size_bytes"));
    assert!(text.contains("linear_segments_uploaded_total"));
}

#[tokio::test]
async fn test_create_dataset() {
    let (app, _dir) = test_app().await;

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/datasets/events")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"max_archive_size": 4096}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(status, StatusCode::CREATED);
    let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["name"], "events");
    assert!(info["first_index"].is_null());
    assert_eq!(info["config"]["max_archive_size"], 4096);
    assert_eq!(info["config"]["max_archive_time_ms"], 600_000);

    let (status, _) = send(&app, "PUT", "/api/datasets/events", Body::empty()).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_dataset() {
    let (app, _dir) = test_app().await;

    let (status, body) = send(&app, "GET", "/api/datasets/missing", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_invalid_dataset_name() {
    let (app, _dir) = test_app().await;
    let (status, _) = send(&app, "PUT", "/api/datasets/has%20space", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_append_and_read_record() {
    let (app, _dir) = test_app().await;
    create(&app, "events").await;

    let (status, _) = send(&app, "POST", "/api/datasets/events/records/0", "first").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, "POST", "/api/datasets/events/records/1", "second").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, "GET", "/api/datasets/events/records/1", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"second");

    let (status, _) = send(&app, "GET", "/api/datasets/events/records/2", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_append_ordering_errors() {
    let (app, _dir) = test_app().await;
    create(&app, "events").await;

    send(&app, "POST", "/api/datasets/events/records/0", "a").await;

    let (status, _) = send(&app, "POST", "/api/datasets/events/records/0", "again").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, "POST", "/api/datasets/events/records/5", "gap").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_append_largest_index_is_rejected() {
    let (app, _dir) = test_app().await;
    create(&app, "events").await;

    let uri = format!("/api/datasets/events/records/{}", u64::MAX);
    let (status, _) = send(&app, "POST", &uri, "x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", "/api/datasets/events/records/0", "a").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_batch_append_and_ranged_read() {
    let (app, _dir) = test_app().await;
    create(&app, "events").await;

    let records: Vec<Record> = (0..20)
        .map(|i| Record::new(i, Bytes::from(format!("record-{}", i))))
        .collect();
    let (status, _) = send(
        &app,
        "POST",
        "/api/datasets/events/records",
        encode_records(&records),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, "GET", "/api/datasets/events/records/5/10", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decode_records(body).unwrap(), records[5..15].to_vec());

    // Truncated at the end of the stream
    let (_, body) = send(&app, "GET", "/api/datasets/events/records/15/100", Body::empty()).await;
    assert_eq!(decode_records(body).unwrap().len(), 5);
}

#[tokio::test]
async fn test_malformed_batch_is_rejected() {
    let (app, _dir) = test_app().await;
    create(&app, "events").await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/datasets/events/records",
        Bytes::from_static(&[0u8; 10]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_archive_and_read_across_tiers() {
    let (app, _dir) = test_app().await;
    create(&app, "events").await;

    let (status, _) = send(&app, "POST", "/api/datasets/events/archive", Body::empty()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let first: Vec<Record> = (0..10)
        .map(|i| Record::new(i, Bytes::from(format!("old-{}", i))))
        .collect();
    send(&app, "POST", "/api/datasets/events/records", encode_records(&first)).await;

    let (status, body) = send(&app, "POST", "/api/datasets/events/archive", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    let descriptor: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(descriptor["from"], 0);
    assert_eq!(descriptor["to"], 9);

    let second: Vec<Record> = (10..15)
        .map(|i| Record::new(i, Bytes::from(format!("new-{}", i))))
        .collect();
    send(&app, "POST", "/api/datasets/events/records", encode_records(&second)).await;

    let (_, body) = send(&app, "GET", "/api/datasets/events/records/5/10", Body::empty()).await;
    let read = decode_records(body).unwrap();
    let indices: Vec<u64> = read.iter().map(|r| r.index).collect();
    assert_eq!(indices, (5..15).collect::<Vec<_>>());
    assert_eq!(read[0].data, Bytes::from("old-5"));
    assert_eq!(read[9].data, Bytes::from("new-14"));

    let (_, body) = send(&app, "GET", "/api/datasets/events", Body::empty()).await;
    let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["first_index"], 0);
    assert_eq!(info["last_index"], 14);
    assert_eq!(info["archived_segments"], 1);
    assert_eq!(info["head_records"], 5);
}

#[tokio::test]
async fn test_read_count_limit() {
    let (app, _dir) = test_app().await;
    create(&app, "events").await;

    let (status, _) = send(
        &app,
        "GET",
        "/api/datasets/events/records/0/1000000",
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
