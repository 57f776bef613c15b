//! Linear Observability
//!
//! Prometheus metrics for the storage engine, rendered in the text
//! exposition format for scraping.
//!
//! # Usage
//!
//! ```no_run
//! use linear_observability::metrics;
//!
//! // Register every metric with the global registry
//! metrics::init();
//!
//! // Body of a GET /metrics response
//! let body = metrics::render().unwrap();
//! ```

pub mod metrics;

pub use metrics::{init, render, CONTENT_TYPE, REGISTRY};
