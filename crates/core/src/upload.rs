//! Upload session identifiers, declared parameters, and wire types.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum length of a client-supplied upload id.
pub const MAX_UPLOAD_ID_LEN: usize = 128;

/// Identifier of an upload session.
///
/// Ids double as directory names in the chunk scratch area, so only
/// `[A-Za-z0-9_-]` is accepted.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UploadId(String);

impl UploadId {
    /// Generate a new server-issued upload id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a client-supplied upload id.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.is_empty() || s.len() > MAX_UPLOAD_ID_LEN {
            return Err(crate::Error::InvalidUploadId(format!(
                "length must be between 1 and {MAX_UPLOAD_ID_LEN}, got {}",
                s.len()
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(crate::Error::InvalidUploadId(format!(
                "only ASCII letters, digits, '-' and '_' are allowed: {s:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for UploadId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<UploadId> for String {
    fn from(id: UploadId) -> Self {
        id.0
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters a client declares when opening an upload session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionParams {
    /// Original filename.
    pub filename: String,
    /// Number of chunks the client will send.
    pub total_chunks: u32,
    /// Total size of the file in bytes.
    pub total_size: u64,
    /// Declared content-type.
    pub content_type: String,
}

impl SessionParams {
    /// Validate declared parameters.
    pub fn validate(&self) -> crate::Result<()> {
        if self.filename.trim().is_empty() {
            return Err(crate::Error::InvalidParams(
                "filename is required".to_string(),
            ));
        }
        if self.total_chunks == 0 {
            return Err(crate::Error::InvalidParams(
                "totalChunks must be greater than zero".to_string(),
            ));
        }
        if self.total_size == 0 {
            return Err(crate::Error::InvalidParams(
                "fileSize must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Content-type used when a client does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Request to open an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    /// Client-chosen session id; the server issues one when absent.
    #[serde(default)]
    pub upload_id: Option<String>,
    /// Original filename.
    #[serde(default)]
    pub filename: Option<String>,
    /// Number of chunks. Signed so that negative input is reported as
    /// invalid rather than rejected by the JSON decoder.
    pub total_chunks: i64,
    /// Total file size in bytes.
    pub file_size: i64,
    /// Declared content-type.
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl InitUploadRequest {
    /// Convert into validated session parameters.
    pub fn to_params(&self) -> crate::Result<SessionParams> {
        let total_chunks = u32::try_from(self.total_chunks)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                crate::Error::InvalidParams(format!(
                    "totalChunks must be a positive integer, got {}",
                    self.total_chunks
                ))
            })?;
        let total_size = u64::try_from(self.file_size)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                crate::Error::InvalidParams(format!(
                    "fileSize must be a positive integer, got {}",
                    self.file_size
                ))
            })?;
        let params = SessionParams {
            filename: self.filename.clone().unwrap_or_default(),
            total_chunks,
            total_size,
            content_type: self
                .mime_type
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        };
        params.validate()?;
        Ok(params)
    }
}

/// Response to opening (or resuming) an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub success: bool,
    pub upload_id: String,
    /// Chunks already held for this session (non-zero only on resume).
    pub received_chunks: u32,
    pub total_chunks: u32,
}

/// Response to a chunk upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub success: bool,
    pub received_chunks: u32,
    pub total_chunks: u32,
    /// Set when the chunk index had already been received.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

/// Response describing the progress of an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgressResponse {
    pub success: bool,
    pub upload_id: String,
    pub received_chunks: u32,
    pub total_chunks: u32,
    /// Indices not yet received, ascending.
    pub missing_chunks: Vec<u32>,
}

/// Request to assemble a completed upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub upload_id: String,
    #[serde(default)]
    pub compress: bool,
}

/// Response to a finished upload, chunked or single-shot.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResultResponse {
    pub success: bool,
    /// Share code for the stored file.
    pub code: String,
    pub filename: String,
    /// Size of the stored artifact in bytes.
    pub size: u64,
    /// Size before compression; only present when compressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    pub compressed: bool,
    /// Original size divided by stored size; only present when compressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
}
