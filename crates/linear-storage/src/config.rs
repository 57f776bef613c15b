//! Storage Configuration
//!
//! ## ArchiveOptions
//!
//! Controls how an archive builds and uploads segments:
//!
//! - **local_dir**: Working directory for segment builds (default: `./data`)
//! - **compression**: Block compression for new segments (default: LZ4)
//! - **multipart_threshold**: Segments at least this large are uploaded with
//!   a multipart upload (default: 16MB)
//! - **multipart_part_size**: Chunk size fed to the multipart writer (default: 8MB)
//!
//! ## DatasetConfig
//!
//! Controls when a dataset seals its head into a new segment. It is stored
//! next to the segments as `<name>/dataset.json`:
//!
//! - **max_archive_size**: Seal once the head holds this many bytes (default: 64MB)
//! - **max_archive_time_ms**: Seal once the oldest unarchived record is this
//!   old (default: 10 minutes)
//!
//! ## Usage
//!
//! ```ignore
//! use linear_storage::{ArchiveOptions, DatasetConfig};
//!
//! let options = ArchiveOptions {
//!     local_dir: "/var/lib/linear".into(),
//!     ..Default::default()
//! };
//!
//! let config: DatasetConfig = serde_json::from_str(r#"{"max_archive_size": 1048576}"#)?;
//! assert_eq!(config.max_archive_time_ms, 600_000);
//! ```

use linear_core::Compression;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveOptions {
    /// Working directory for segment builds
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,

    /// Block compression for newly built segments
    #[serde(default)]
    pub compression: Compression,

    /// Use a multipart upload for segments at least this large
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,

    /// Chunk size for multipart uploads
    #[serde(default = "default_multipart_part_size")]
    pub multipart_part_size: usize,
}

fn default_local_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_multipart_threshold() -> u64 {
    16 * 1024 * 1024 // 16MB
}

fn default_multipart_part_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            local_dir: default_local_dir(),
            compression: Compression::default(),
            multipart_threshold: default_multipart_threshold(),
            multipart_part_size: default_multipart_part_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Seal the head once it holds this many bytes
    #[serde(default = "default_max_archive_size")]
    pub max_archive_size: u64,

    /// Seal the head once its oldest record is this old
    #[serde(default = "default_max_archive_time_ms")]
    pub max_archive_time_ms: u64,
}

fn default_max_archive_size() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_max_archive_time_ms() -> u64 {
    10 * 60 * 1000 // 10 minutes
}

impl DatasetConfig {
    pub fn max_archive_time(&self) -> Duration {
        Duration::from_millis(self.max_archive_time_ms)
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            max_archive_size: default_max_archive_size(),
            max_archive_time_ms: default_max_archive_time_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_config_defaults_from_empty_json() {
        let config: DatasetConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DatasetConfig::default());
        assert_eq!(config.max_archive_time(), Duration::from_secs(600));
    }

    #[test]
    fn test_archive_options_partial_json() {
        let options: ArchiveOptions =
            serde_json::from_str(r#"{"compression": "none", "multipart_threshold": 10}"#).unwrap();
        assert_eq!(options.compression, Compression::None);
        assert_eq!(options.multipart_threshold, 10);
        assert_eq!(options.multipart_part_size, 8 * 1024 * 1024);
        assert_eq!(options.local_dir, PathBuf::from("./data"));
    }
}
