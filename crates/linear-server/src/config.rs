//! Server configuration from the environment
//!
//! - `LINEAR_ADDR`: listen address (default: `0.0.0.0:8080`)
//! - `LINEAR_DATA_DIR`: root for head logs, segment builds and the segment
//!   cache (default: `./data`)
//! - `LINEAR_CACHE_SIZE`: segment cache budget in bytes (default: 1GiB)
//! - `LINEAR_COMPRESSION`: `lz4` or `none` for new segments (default: `lz4`)
//! - `LINEAR_BUCKET`: S3 bucket (default: `linear-data`)
//! - `USE_LOCAL_STORAGE`: use the local filesystem instead of S3 (any value)
//! - `LOCAL_STORAGE_PATH`: path for local storage (default: `./data/storage`)
//!
//! S3 credentials and endpoint come from the usual `AWS_*` variables.

use linear_core::Compression;
use linear_storage::ArchiveOptions;
use object_store::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Failed to create object store: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where segments and dataset configs are stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Local(PathBuf),
    S3 { bucket: String },
}

impl StorageBackend {
    pub fn build(&self) -> Result<Arc<dyn ObjectStore>, ConfigError> {
        match self {
            StorageBackend::Local(path) => {
                std::fs::create_dir_all(path)?;
                Ok(Arc::new(
                    object_store::local::LocalFileSystem::new_with_prefix(path)?,
                ))
            }
            StorageBackend::S3 { bucket } => {
                let s3 = object_store::aws::AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .build()?;
                Ok(Arc::new(s3))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub data_dir: PathBuf,
    pub cache_size: u64,
    pub compression: Compression,
    pub storage: StorageBackend,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let addr = lookup("LINEAR_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let data_dir = PathBuf::from(lookup("LINEAR_DATA_DIR").unwrap_or_else(|| "./data".to_string()));

        let cache_size = match lookup("LINEAR_CACHE_SIZE") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                name: "LINEAR_CACHE_SIZE",
                value,
            })?,
            None => 1024 * 1024 * 1024, // 1GiB
        };

        let compression = match lookup("LINEAR_COMPRESSION").as_deref() {
            None | Some("lz4") => Compression::Lz4,
            Some("none") => Compression::None,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "LINEAR_COMPRESSION",
                    value: other.to_string(),
                })
            }
        };

        let storage = if lookup("USE_LOCAL_STORAGE").is_some() {
            StorageBackend::Local(PathBuf::from(
                lookup("LOCAL_STORAGE_PATH").unwrap_or_else(|| "./data/storage".to_string()),
            ))
        } else {
            StorageBackend::S3 {
                bucket: lookup("LINEAR_BUCKET").unwrap_or_else(|| "linear-data".to_string()),
            }
        };

        Ok(Self {
            addr,
            data_dir,
            cache_size,
            compression,
            storage,
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Archive options rooted at `<data_dir>/datasets`
    pub fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions {
            local_dir: self.data_dir.join("datasets"),
            compression: self.compression,
            ..Default::default()
        }
    }
}
