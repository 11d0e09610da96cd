//! Retrieval handlers.

use crate::error::{ApiError, ApiResult};
use crate::handlers::FileSummary;
use crate::retrieval::Resolved;
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use axum::response::{IntoResponse, Response};
use courier_metadata::{FileRepo, GroupRecord, MetadataStore};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use time::OffsetDateTime;

/// Characters left unescaped in an RFC 5987 `filename*` value.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Metadata for a single file code.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfoResponse {
    pub success: bool,
    pub is_group: bool,
    #[serde(flatten)]
    pub file: FileSummary,
    /// Size of the stored artifact.
    pub stored_size: u64,
}

/// Metadata for a group code.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfoResponse {
    pub success: bool,
    pub is_group: bool,
    pub group_code: String,
    pub name: String,
    pub file_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub files: Vec<FileSummary>,
}

/// Member records of a group, in group order.
///
/// Members whose records have disappeared are skipped.
pub(crate) async fn group_members(
    metadata: &dyn MetadataStore,
    group: &GroupRecord,
) -> ApiResult<Vec<FileSummary>> {
    let mut files = Vec::with_capacity(group.files.len());
    for code in &group.files {
        match metadata.get_file(code).await? {
            Some(record) => files.push(FileSummary::from(&record)),
            None => {
                tracing::warn!(group = %group.code, code = %code, "Group member has no file record")
            }
        }
    }
    Ok(files)
}

/// GET /api/download/{code} - Describe a file or group without its bytes.
#[tracing::instrument(skip(state))]
pub async fn get_download_info(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Response> {
    match state.retrieval.resolve(&code).await? {
        Resolved::File(record) => Ok(Json(FileInfoResponse {
            success: true,
            is_group: false,
            stored_size: record.size,
            file: FileSummary::from(&record),
        })
        .into_response()),
        Resolved::Group(group) => {
            let files = group_members(state.metadata.as_ref(), &group).await?;
            Ok(Json(GroupInfoResponse {
                success: true,
                is_group: true,
                group_code: group.code,
                name: group.name,
                file_count: group.file_count,
                created_at: group.created_at,
                files,
            })
            .into_response())
        }
    }
}

/// GET /api/file/{code} - Stream a file, decoding it if it was stored
/// compressed.
#[tracing::instrument(skip(state))]
pub async fn get_file(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Response> {
    let download = state.retrieval.resolve_and_stream(&code).await?;

    let content_type = HeaderValue::from_str(&download.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&content_disposition(&download.record.filename))
        .map_err(|e| ApiError::Internal(format!("invalid Content-Disposition: {e}")))?;

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, content_type),
            (CONTENT_LENGTH, HeaderValue::from(download.content_length)),
            (CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(download.body),
    )
        .into_response())
}

/// `attachment` disposition for `filename`.
///
/// Names that are not plain printable ASCII get an ASCII fallback plus an
/// RFC 5987 `filename*` parameter carrying the UTF-8 name.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() || c == ' ') && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if fallback == filename {
        format!("attachment; filename=\"{filename}\"")
    } else {
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            utf8_percent_encode(filename, ATTR_CHAR)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_ascii() {
        assert_eq!(
            content_disposition("report 2024.pdf"),
            "attachment; filename=\"report 2024.pdf\""
        );
    }

    #[test]
    fn test_content_disposition_non_ascii() {
        assert_eq!(
            content_disposition("résumé.pdf"),
            "attachment; filename=\"r_sum_.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"
        );
    }

    #[test]
    fn test_content_disposition_escapes_quotes() {
        let value = content_disposition("a\"b.txt");
        assert!(value.starts_with("attachment; filename=\"a_b.txt\""));
        assert!(value.ends_with("filename*=UTF-8''a%22b.txt"));
    }
}
