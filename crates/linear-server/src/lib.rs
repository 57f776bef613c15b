//! Linear HTTP Server
//!
//! Exposes datasets over a small REST API:
//!
//! ```text
//! PUT  /api/datasets/:name                        create (JSON DatasetConfig body)
//! GET  /api/datasets/:name                        info
//! POST /api/datasets/:name/records/:index         append one record (raw body)
//! POST /api/datasets/:name/records                append a framed batch
//! GET  /api/datasets/:name/records/:index         read one record (raw body)
//! GET  /api/datasets/:name/records/:index/:count  read a framed batch
//! POST /api/datasets/:name/archive                seal the head now
//! GET  /health
//! GET  /metrics
//! ```

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub mod config;
pub mod handlers;
pub mod registry;

pub use config::{ConfigError, ServerConfig, StorageBackend};
pub use registry::DatasetRegistry;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DatasetRegistry>,
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route(
            "/datasets/:name",
            get(handlers::get_dataset).put(handlers::create_dataset),
        )
        .route("/datasets/:name/records", post(handlers::append_records))
        .route(
            "/datasets/:name/records/:index",
            get(handlers::read_record).post(handlers::append_record),
        )
        .route(
            "/datasets/:name/records/:index/:count",
            get(handlers::read_records),
        )
        .route("/datasets/:name/archive", post(handlers::archive_dataset))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
}
