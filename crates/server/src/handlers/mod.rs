//! HTTP request handlers.

pub mod downloads;
pub mod groups;
pub mod health;
pub mod uploads;

pub use downloads::*;
pub use groups::*;
pub use health::*;
pub use uploads::*;

use crate::error::{ApiError, ApiResult};
use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use courier_metadata::FileRecord;
use serde::Serialize;
use time::OffsetDateTime;

/// Unwrap a JSON body, reporting malformed input as invalid parameters.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::InvalidParams(e.body_text()))
}

/// Map a multipart read failure. `too_large` builds the error used when the
/// body limit was hit.
pub(crate) fn multipart_error(
    e: MultipartError,
    too_large: impl FnOnce() -> ApiError,
) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        too_large()
    } else {
        ApiError::InvalidParams(format!("malformed multipart body: {}", e.body_text()))
    }
}

/// A file as listed in download and group responses.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub code: String,
    pub filename: String,
    /// Size of the file as downloaded.
    pub size: u64,
    pub mime_type: String,
    pub compressed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&FileRecord> for FileSummary {
    fn from(record: &FileRecord) -> Self {
        Self {
            code: record.code.clone(),
            filename: record.filename.clone(),
            size: record.original_size,
            mime_type: record.served_mime_type().to_string(),
            compressed: record.compressed,
            created_at: record.created_at,
        }
    }
}
