//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum size of a single uploaded chunk in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Maximum size of a complete file in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_max_chunk_size() -> u64 {
    crate::DEFAULT_MAX_CHUNK_SIZE
}

fn default_max_file_size() -> u64 {
    crate::DEFAULT_MAX_FILE_SIZE
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_chunk_size: default_max_chunk_size(),
            max_file_size: default_max_file_size(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    /// Largest request body the router accepts.
    ///
    /// Multipart framing adds a little overhead on top of the file itself.
    pub fn body_limit(&self) -> usize {
        let limit = self.max_file_size.max(self.max_chunk_size) + 64 * 1024;
        usize::try_from(limit).unwrap_or(usize::MAX)
    }
}

/// Filesystem locations for artifacts and chunk scratch space.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding stored artifacts.
    #[serde(default = "default_files_path")]
    pub files_path: PathBuf,
    /// Scratch directory holding in-progress chunked uploads.
    #[serde(default = "default_chunks_path")]
    pub chunks_path: PathBuf,
}

fn default_files_path() -> PathBuf {
    PathBuf::from("./data/files")
}

fn default_chunks_path() -> PathBuf {
    PathBuf::from("./data/chunks")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            files_path: default_files_path(),
            chunks_path: default_chunks_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.files_path == self.chunks_path {
            return Err("storage.files_path and storage.chunks_path must differ".to_string());
        }
        if self.files_path.starts_with(&self.chunks_path)
            || self.chunks_path.starts_with(&self.files_path)
        {
            return Err(
                "storage.files_path and storage.chunks_path must not be nested".to_string(),
            );
        }
        Ok(())
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Path of the JSON record file.
    #[serde(default = "default_metadata_path")]
    pub path: PathBuf,
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("./data/metadata.json")
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Compression algorithm applied to artifacts when a client asks for it.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionConfig {
    /// Never compress, even when requested.
    None,
    /// Gzip at level 6.
    #[default]
    Gzip,
    /// Zstd at level 3.
    Zstd,
}

impl CompressionConfig {
    /// Content-type recorded for artifacts compressed with this algorithm.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::None => "application/octet-stream",
            Self::Gzip => "application/gzip",
            Self::Zstd => "application/zstd",
        }
    }

    /// Stored filename suffix for artifacts compressed with this algorithm.
    pub fn extension(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Zstd => ".zst",
        }
    }

    /// Recover the algorithm from a recorded content-type.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            "application/gzip" | "application/x-gzip" => Some(Self::Gzip),
            "application/zstd" => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Upload session and artifact policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Age after which an unfinished session is evicted (default: 24 hours).
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Interval between eviction sweeps (default: 1 hour).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Maximum number of chunks a session may declare.
    #[serde(default = "default_max_chunks_per_upload")]
    pub max_chunks_per_upload: u32,
    /// Compression algorithm used when a client requests compression.
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Uploads smaller than this many bytes are stored uncompressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: u64,
    /// Number of symbols in generated share codes.
    #[serde(default = "default_code_length")]
    pub code_length: usize,
    /// Serve the raw stored bytes when a compressed artifact cannot be
    /// decoded, instead of failing the download (default: true).
    #[serde(default = "default_best_effort_decompression")]
    pub best_effort_decompression: bool,
}

fn default_retention_secs() -> u64 {
    86400 // 24 hours
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_max_chunks_per_upload() -> u32 {
    crate::DEFAULT_MAX_CHUNKS_PER_UPLOAD
}

fn default_compression_threshold() -> u64 {
    crate::COMPRESSION_THRESHOLD
}

fn default_code_length() -> usize {
    crate::DEFAULT_CODE_LENGTH
}

fn default_best_effort_decompression() -> bool {
    true
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_chunks_per_upload: default_max_chunks_per_upload(),
            compression: CompressionConfig::default(),
            compression_threshold: default_compression_threshold(),
            code_length: default_code_length(),
            best_effort_decompression: default_best_effort_decompression(),
        }
    }
}

impl UploadConfig {
    /// Get the session retention window as a Duration.
    pub fn retention(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.retention_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    /// Get the sweep interval, never zero.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Validate upload policy.
    pub fn validate(&self) -> Result<(), String> {
        if self.retention_secs == 0 {
            return Err("uploads.retention_secs must be greater than zero".to_string());
        }
        if self.max_chunks_per_upload == 0 {
            return Err("uploads.max_chunks_per_upload must be greater than zero".to_string());
        }
        if !(4..=crate::code::MAX_CODE_LENGTH).contains(&self.code_length) {
            return Err(format!(
                "uploads.code_length must be between 4 and {}",
                crate::code::MAX_CODE_LENGTH
            ));
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage locations.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Upload policy.
    #[serde(default)]
    pub uploads: UploadConfig,
}

impl AppConfig {
    /// Create a test configuration rooted at `root`.
    ///
    /// **For testing only.** Metrics are disabled and limits are small.
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            server: ServerConfig {
                metrics_enabled: false,
                max_chunk_size: 1024 * 1024,
                max_file_size: 8 * 1024 * 1024,
                ..Default::default()
            },
            storage: StorageConfig {
                files_path: root.join("files"),
                chunks_path: root.join("chunks"),
            },
            metadata: MetadataConfig {
                path: root.join("metadata.json"),
            },
            uploads: UploadConfig::default(),
        }
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> crate::Result<()> {
        self.storage.validate().map_err(crate::Error::Config)?;
        self.uploads.validate().map_err(crate::Error::Config)?;
        if self.server.max_chunk_size == 0 || self.server.max_file_size == 0 {
            return Err(crate::Error::Config(
                "server size limits must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_config_defaults() {
        let config = UploadConfig::default();
        assert_eq!(config.retention(), Duration::hours(24));
        assert_eq!(config.sweep_interval(), std::time::Duration::from_secs(3600));
        assert_eq!(config.compression, CompressionConfig::Gzip);
        assert_eq!(config.compression_threshold, 10 * 1024);
        assert!(config.best_effort_decompression);
    }

    #[test]
    fn test_upload_config_deserialize_partial() {
        let json = r#"{"retention_secs": 60, "compression": "zstd"}"#;
        let config: UploadConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.retention_secs, 60);
        assert_eq!(config.compression, CompressionConfig::Zstd);
        assert_eq!(config.code_length, crate::DEFAULT_CODE_LENGTH);
    }

    #[test]
    fn test_sweep_interval_never_zero() {
        let config = UploadConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.sweep_interval(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_retention_saturates() {
        let config = UploadConfig {
            retention_secs: u64::MAX,
            ..Default::default()
        };
        assert!(config.retention().is_positive());
    }

    #[test]
    fn test_storage_config_rejects_same_or_nested_paths() {
        let same = StorageConfig {
            files_path: PathBuf::from("/data"),
            chunks_path: PathBuf::from("/data"),
        };
        assert!(same.validate().is_err());

        let nested = StorageConfig {
            files_path: PathBuf::from("/data"),
            chunks_path: PathBuf::from("/data/chunks"),
        };
        assert!(nested.validate().is_err());

        assert!(StorageConfig::default().validate().is_ok());
    }

    #[test]
    fn test_compression_content_type_roundtrip() {
        for c in [CompressionConfig::Gzip, CompressionConfig::Zstd] {
            assert_eq!(CompressionConfig::from_content_type(c.content_type()), Some(c));
        }
        assert_eq!(CompressionConfig::from_content_type("text/plain"), None);
    }

    #[test]
    fn test_app_config_validate_code_length() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());
        config.uploads.code_length = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_for_testing_is_valid() {
        let config = AppConfig::for_testing(std::path::Path::new("/tmp/courier-test"));
        assert!(config.validate().is_ok());
        assert!(!config.server.metrics_enabled);
    }
}
