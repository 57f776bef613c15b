//! Prometheus metrics for the linear storage engine.
//!
//! All metrics live in [`REGISTRY`] and are created lazily. [`init`] registers
//! them exactly once; it is safe to call from several places.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Segment Cache Metrics
    // ============================================================================

    /// Segment cache hits (entry was resident or another caller was loading it)
    pub static ref CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "linear_cache_hits_total",
        "Total segment cache hits"
    ).expect("metric can be created");

    /// Segment cache misses (this caller ran the loader)
    pub static ref CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "linear_cache_misses_total",
        "Total segment cache misses"
    ).expect("metric can be created");

    /// Segments evicted under size pressure
    pub static ref CACHE_EVICTIONS_TOTAL: IntCounter = IntCounter::new(
        "linear_cache_evictions_total",
        "Total segments evicted from the cache"
    ).expect("metric can be created");

    /// Bytes currently held by the segment cache
    pub static ref CACHE_SIZE_BYTES: IntGauge = IntGauge::new(
        "linear_cache_size_bytes",
        "Current segment cache size in bytes"
    ).expect("metric can be created");

    // ============================================================================
    // Remote Storage Metrics
    // ============================================================================

    /// Remote requests by operation type
    pub static ref REMOTE_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linear_remote_requests_total", "Total remote object store requests"),
        &["operation"] // get, put, list
    ).expect("metric can be created");

    /// Remote errors by operation type
    pub static ref REMOTE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linear_remote_errors_total", "Total remote object store errors"),
        &["operation"]
    ).expect("metric can be created");

    /// Remote request latency
    pub static ref REMOTE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("linear_remote_latency_seconds", "Remote request latency in seconds")
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["operation"]
    ).expect("metric can be created");

    // ============================================================================
    // Archive Metrics
    // ============================================================================

    /// Segments sealed and uploaded
    pub static ref SEGMENTS_UPLOADED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linear_segments_uploaded_total", "Total segments uploaded"),
        &["stream"]
    ).expect("metric can be created");

    /// Bytes of sealed segments uploaded
    pub static ref SEGMENT_BYTES_UPLOADED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linear_segment_bytes_uploaded_total", "Total segment bytes uploaded"),
        &["stream"]
    ).expect("metric can be created");

    // ============================================================================
    // Dataset Metrics
    // ============================================================================

    /// Records appended to the head
    pub static ref RECORDS_APPENDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linear_records_appended_total", "Total records appended"),
        &["stream"]
    ).expect("metric can be created");

    /// Records delivered to readers, by tier
    pub static ref RECORDS_READ_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("linear_records_read_total", "Total records read"),
        &["stream", "tier"] // head, archive
    ).expect("metric can be created");
}

/// Register every metric with [`REGISTRY`]
pub fn init() {
    INIT.call_once(|| {
        // Segment cache
        REGISTRY
            .register(Box::new(CACHE_HITS_TOTAL.clone()))
            .expect("cache_hits_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_MISSES_TOTAL.clone()))
            .expect("cache_misses_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_EVICTIONS_TOTAL.clone()))
            .expect("cache_evictions_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_SIZE_BYTES.clone()))
            .expect("cache_size_bytes can be registered");

        // Remote storage
        REGISTRY
            .register(Box::new(REMOTE_REQUESTS_TOTAL.clone()))
            .expect("remote_requests_total can be registered");
        REGISTRY
            .register(Box::new(REMOTE_ERRORS_TOTAL.clone()))
            .expect("remote_errors_total can be registered");
        REGISTRY
            .register(Box::new(REMOTE_LATENCY.clone()))
            .expect("remote_latency can be registered");

        // Archive
        REGISTRY
            .register(Box::new(SEGMENTS_UPLOADED_TOTAL.clone()))
            .expect("segments_uploaded_total can be registered");
        REGISTRY
            .register(Box::new(SEGMENT_BYTES_UPLOADED_TOTAL.clone()))
            .expect("segment_bytes_uploaded_total can be registered");

        // Dataset
        REGISTRY
            .register(Box::new(RECORDS_APPENDED_TOTAL.clone()))
            .expect("records_appended_total can be registered");
        REGISTRY
            .register(Box::new(RECORDS_READ_TOTAL.clone()))
            .expect("records_read_total can be registered");
    });
}

/// Content type of [`render`] output
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Encode every registered metric in the Prometheus text format
pub fn render() -> prometheus::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}
