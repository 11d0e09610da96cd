//! Group handlers.

use crate::error::{ApiError, ApiResult};
use crate::handlers::downloads::group_members;
use crate::handlers::{FileSummary, json_body};
use crate::metrics::GROUPS_CREATED;
use crate::state::AppState;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use courier_core::ShareCode;
use courier_metadata::GroupRepo;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Request to group existing files under one code.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub group_name: Option<String>,
}

/// Response to group creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupResponse {
    pub success: bool,
    pub group_code: String,
    pub name: String,
    pub file_count: usize,
    pub files: Vec<FileSummary>,
}

/// Group lookup response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResponse {
    pub success: bool,
    pub group_code: String,
    pub name: String,
    pub file_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub files: Vec<FileSummary>,
}

/// POST /api/group - Create a group over existing file codes.
#[tracing::instrument(skip(state, body))]
pub async fn create_group(
    State(state): State<AppState>,
    body: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> ApiResult<Json<CreateGroupResponse>> {
    let req = json_body(body)?;
    let codes = req
        .file_ids
        .iter()
        .map(|id| {
            ShareCode::parse(id)
                .map(ShareCode::into_string)
                .map_err(|_| ApiError::FileNotFound(id.clone()))
        })
        .collect::<ApiResult<Vec<_>>>()?;

    let (group, members) = courier_metadata::create_group(
        state.metadata.as_ref(),
        state.config.uploads.code_length,
        codes,
        req.group_name,
    )
    .await?;
    GROUPS_CREATED.inc();
    tracing::info!(code = %group.code, file_count = group.file_count, "Group created");

    Ok(Json(CreateGroupResponse {
        success: true,
        group_code: group.code,
        name: group.name,
        file_count: group.file_count,
        files: members.iter().map(FileSummary::from).collect(),
    }))
}

/// GET /api/group/{code} - Describe a group and its member files.
#[tracing::instrument(skip(state))]
pub async fn get_group(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<GroupResponse>> {
    let not_found = || ApiError::NotFound(format!("no group for code {code:?}"));
    let parsed = ShareCode::parse(&code).map_err(|_| not_found())?;
    let group = state
        .metadata
        .get_group(parsed.as_str())
        .await?
        .ok_or_else(not_found)?;
    let files = group_members(state.metadata.as_ref(), &group).await?;

    Ok(Json(GroupResponse {
        success: true,
        group_code: group.code,
        name: group.name,
        file_count: group.file_count,
        created_at: group.created_at,
        files,
    }))
}
