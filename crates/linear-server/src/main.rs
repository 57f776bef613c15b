//! Linear Server
//!
//! Serves datasets over HTTP, with head logs and the segment cache on local
//! disk and archived segments in S3 (or a local directory for development).
//!
//! ## Configuration
//!
//! See [`linear_server::config`] for every environment variable.
//!
//! ## Usage
//!
//! ```bash
//! # Local development
//! export USE_LOCAL_STORAGE=1
//! cargo run -p linear-server
//!
//! # S3
//! export LINEAR_BUCKET=my-bucket
//! export AWS_REGION=us-east-1
//! cargo run -p linear-server --release
//! ```

use linear_server::{create_router, AppState, DatasetRegistry, ServerConfig};
use linear_storage::SegmentCache;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    linear_observability::init();

    let config = ServerConfig::from_env()?;
    info!(
        addr = %config.addr,
        data_dir = ?config.data_dir,
        cache_size = config.cache_size,
        storage = ?config.storage,
        "Starting linear server"
    );

    let object_store = config.storage.build()?;
    let cache = Arc::new(SegmentCache::open(config.cache_dir(), config.cache_size).await?);
    let registry = Arc::new(DatasetRegistry::new(
        object_store,
        cache,
        config.archive_options(),
    ));

    let app = create_router(AppState {
        registry: registry.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!(addr = %config.addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    registry.shutdown().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
