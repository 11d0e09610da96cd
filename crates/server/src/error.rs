//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use courier_metadata::MetadataError;
use courier_storage::StorageError;
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Always false.
    pub success: bool,
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_group: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_chunks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("unknown upload session: {0}")]
    UnknownSession(String),

    #[error("chunk {0} is empty")]
    EmptyChunk(u32),

    #[error("incomplete upload: received {received} of {expected} chunks")]
    IncompleteUpload { received: u32, expected: u32 },

    #[error("chunk {0} is missing from storage; upload it again")]
    MissingChunk(u32),

    #[error("assembly failed: {0}")]
    AssemblyFailed(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("stored artifact is missing for code {0}")]
    ArtifactMissing(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("code {code} is a group of {file_count} files")]
    IsGroup { code: String, file_count: usize },

    #[error("chunk exceeds the maximum size of {limit} bytes")]
    OversizeChunk { limit: u64 },

    #[error("file exceeds the maximum size of {limit} bytes")]
    OversizeFile { limit: u64 },

    #[error("failed to decompress stored artifact: {0}")]
    DecompressionFailed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "invalid_params",
            Self::UnknownSession(_) => "unknown_session",
            Self::EmptyChunk(_) => "empty_chunk",
            Self::IncompleteUpload { .. } => "incomplete_upload",
            Self::MissingChunk(_) => "missing_chunk",
            Self::AssemblyFailed(_) => "assembly_failed",
            Self::FileNotFound(_) => "file_not_found",
            Self::ArtifactMissing(_) => "artifact_missing",
            Self::NotFound(_) => "not_found",
            Self::IsGroup { .. } => "is_group",
            Self::OversizeChunk { .. } => "oversize_chunk",
            Self::OversizeFile { .. } => "oversize_file",
            Self::DecompressionFailed(_) => "decompression_failed",
            Self::Internal(_) => "internal_error",
            Self::Storage(_) => "storage_error",
            Self::Metadata(e) => match e {
                MetadataError::FileNotFound(_) => "file_not_found",
                MetadataError::InvalidParams(_) => "invalid_params",
                _ => "metadata_error",
            },
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidParams(_)
            | Self::UnknownSession(_)
            | Self::EmptyChunk(_)
            | Self::IncompleteUpload { .. }
            | Self::IsGroup { .. } => StatusCode::BAD_REQUEST,
            Self::MissingChunk(_) => StatusCode::CONFLICT,
            Self::FileNotFound(_) | Self::ArtifactMissing(_) | Self::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::OversizeChunk { .. } | Self::OversizeFile { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Self::AssemblyFailed(_)
            | Self::DecompressionFailed(_)
            | Self::Internal(_)
            | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Metadata(e) => match e {
                MetadataError::FileNotFound(_) => StatusCode::NOT_FOUND,
                MetadataError::InvalidParams(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn to_body(&self) -> ErrorResponse {
        let mut body = ErrorResponse {
            success: false,
            code: self.code().to_string(),
            message: self.to_string(),
            is_group: None,
            file_count: None,
            received_chunks: None,
            total_chunks: None,
            chunk_index: None,
        };
        match self {
            Self::IsGroup { file_count, .. } => {
                body.is_group = Some(true);
                body.file_count = Some(*file_count);
            }
            Self::IncompleteUpload { received, expected } => {
                body.received_chunks = Some(*received);
                body.total_chunks = Some(*expected);
            }
            Self::MissingChunk(index) | Self::EmptyChunk(index) => {
                body.chunk_index = Some(*index);
            }
            _ => {}
        }
        body
    }
}

impl From<courier_core::Error> for ApiError {
    fn from(e: courier_core::Error) -> Self {
        Self::InvalidParams(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }
        (status, Json(self.to_body())).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
