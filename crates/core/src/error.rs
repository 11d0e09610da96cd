//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),

    #[error("invalid upload parameters: {0}")]
    InvalidParams(String),

    #[error("invalid share code: {0}")]
    InvalidCode(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
