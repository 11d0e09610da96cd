//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("code already in use: {0}")]
    AlreadyExists(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("no unused code found after {attempts} attempts")]
    CodeSpaceExhausted { attempts: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record file is malformed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
