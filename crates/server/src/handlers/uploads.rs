//! Upload handlers: chunked sessions and single-shot uploads.

use crate::error::{ApiError, ApiResult};
use crate::handlers::{json_body, multipart_error};
use crate::state::AppState;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, Path, State};
use bytes::BytesMut;
use courier_core::upload::DEFAULT_CONTENT_TYPE;
use courier_core::UploadId;
use courier_core::upload::{
    ChunkUploadResponse, CompleteUploadRequest, InitUploadRequest, InitUploadResponse,
    UploadProgressResponse, UploadResultResponse,
};
use courier_metadata::FileRecord;
use futures::TryStreamExt;

/// Filename recorded when a single-shot upload does not name its file.
const FALLBACK_FILENAME: &str = "upload";

fn upload_result(record: &FileRecord) -> UploadResultResponse {
    UploadResultResponse {
        success: true,
        code: record.code.clone(),
        filename: record.filename.clone(),
        size: record.size,
        original_size: record.compressed.then_some(record.original_size),
        compressed: record.compressed,
        compression_ratio: record.compression_ratio,
    }
}

/// Keep only the last path component of a client-supplied filename.
fn display_filename(raw: &str) -> String {
    raw.rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// POST /api/upload/init - Open or resume a chunked upload session.
#[tracing::instrument(skip(state, body))]
pub async fn init_upload(
    State(state): State<AppState>,
    body: Result<Json<InitUploadRequest>, JsonRejection>,
) -> ApiResult<Json<InitUploadResponse>> {
    let req = json_body(body)?;
    let mut params = req.to_params()?;
    params.filename = display_filename(&params.filename);
    params.validate()?;

    let upload_id = req
        .upload_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .map(UploadId::parse)
        .transpose()?;

    let outcome = state.registry.init(upload_id, params).await?;
    tracing::debug!(
        upload_id = %outcome.upload_id,
        resumed = outcome.resumed,
        received = outcome.received_chunks,
        "Upload session ready"
    );

    Ok(Json(InitUploadResponse {
        success: true,
        upload_id: outcome.upload_id.to_string(),
        received_chunks: outcome.received_chunks,
        total_chunks: outcome.total_chunks,
    }))
}

/// POST /api/upload/chunk - Store one chunk of a session.
///
/// Multipart fields: `uploadId`, `chunkIndex`, and the `chunk` file. The
/// chunk is buffered whole, so its size is bounded by
/// `server.max_chunk_size`.
#[tracing::instrument(skip(state, multipart))]
pub async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<ChunkUploadResponse>> {
    let mut multipart =
        multipart.map_err(|e| ApiError::InvalidParams(e.body_text()))?;
    let limit = state.config.server.max_chunk_size;
    let too_large = || ApiError::OversizeChunk { limit };

    let mut upload_id = None;
    let mut chunk_index = None;
    let mut chunk = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, too_large))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("uploadId") => {
                let text = field.text().await.map_err(|e| multipart_error(e, too_large))?;
                upload_id = Some(UploadId::parse(text.trim())?);
            }
            Some("chunkIndex") => {
                let text = field.text().await.map_err(|e| multipart_error(e, too_large))?;
                let index = text.trim().parse::<u32>().map_err(|_| {
                    ApiError::InvalidParams(format!("chunkIndex must be a non-negative integer, got {text:?}"))
                })?;
                chunk_index = Some(index);
            }
            Some("chunk") => {
                let mut buf = BytesMut::new();
                while let Some(part) = field.chunk().await.map_err(|e| multipart_error(e, too_large))? {
                    if (buf.len() + part.len()) as u64 > limit {
                        return Err(too_large());
                    }
                    buf.extend_from_slice(&part);
                }
                chunk = Some(buf.freeze());
            }
            _ => {}
        }
    }

    let upload_id =
        upload_id.ok_or_else(|| ApiError::InvalidParams("uploadId is required".to_string()))?;
    let index =
        chunk_index.ok_or_else(|| ApiError::InvalidParams("chunkIndex is required".to_string()))?;
    let chunk = chunk.ok_or_else(|| ApiError::InvalidParams("chunk file is required".to_string()))?;

    let outcome = state.registry.accept_chunk(&upload_id, index, chunk).await?;
    Ok(Json(ChunkUploadResponse {
        success: true,
        received_chunks: outcome.received_chunks,
        total_chunks: outcome.total_chunks,
        duplicate: outcome.duplicate,
    }))
}

/// GET /api/upload/{upload_id} - Report which chunks a session still needs.
#[tracing::instrument(skip(state))]
pub async fn get_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<UploadProgressResponse>> {
    let upload_id = UploadId::parse(&upload_id)?;
    let progress = state.registry.progress(&upload_id)?;

    Ok(Json(UploadProgressResponse {
        success: true,
        upload_id: progress.upload_id.to_string(),
        received_chunks: progress.received_chunks,
        total_chunks: progress.total_chunks,
        missing_chunks: progress.missing,
    }))
}

/// POST /api/upload/complete - Assemble a session into a stored file.
#[tracing::instrument(skip(state, body))]
pub async fn complete_upload(
    State(state): State<AppState>,
    body: Result<Json<CompleteUploadRequest>, JsonRejection>,
) -> ApiResult<Json<UploadResultResponse>> {
    let req = json_body(body)?;
    let upload_id = UploadId::parse(&req.upload_id)?;

    let record = state.assembler.complete(&upload_id, req.compress).await?;
    Ok(Json(upload_result(&record)))
}

/// POST /api/upload - Store a whole file in one request.
///
/// Multipart fields: the `file` itself and an optional `optimized` flag
/// asking for compression.
#[tracing::instrument(skip(state, multipart))]
pub async fn upload_file(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<UploadResultResponse>> {
    let mut multipart =
        multipart.map_err(|e| ApiError::InvalidParams(e.body_text()))?;
    let limit = state.config.server.max_file_size;
    let too_large = || ApiError::OversizeFile { limit };

    let mut staged = None;
    let mut optimized = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, too_large))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") if staged.is_none() => {
                let filename = field
                    .file_name()
                    .map(display_filename)
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| FALLBACK_FILENAME.to_string());
                let content_type = field
                    .content_type()
                    .filter(|ct| !ct.trim().is_empty())
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_string();
                let body = field.map_err(move |e| multipart_error(e, too_large));
                let body = state.assembler.stage(body).await?;
                staged = Some((body, filename, content_type));
            }
            Some("optimized") => {
                let text = field.text().await.map_err(|e| multipart_error(e, too_large))?;
                optimized = parse_flag(&text);
            }
            _ => {}
        }
    }

    let Some((body, filename, content_type)) = staged else {
        return Err(ApiError::InvalidParams("no file uploaded".to_string()));
    };
    let record = state
        .assembler
        .store_whole(body, &filename, &content_type, optimized)
        .await?;
    Ok(Json(upload_result(&record)))
}
