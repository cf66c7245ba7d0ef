use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiResult, AppState};
use crate::backup::restore::RestorePreview;
use crate::backup::{
    Admission, BackupError, BackupRecord, RestoreOptions, RestoreRequest, RestoreScope,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreviewRequest {
    pub scope: RestoreScope,
    pub target: Option<String>,
    pub options: RestoreOptions,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitRestoreBody {
    #[serde(default)]
    pub scope: RestoreScope,
    pub target: Option<String>,
    #[serde(default)]
    pub options: RestoreOptions,
    pub accepted_preview_digest: Option<String>,
}

pub async fn get_backup(
    State(state): State<AppState>,
    Path(backup_id): Path<Uuid>,
) -> ApiResult<Json<BackupRecord>> {
    Ok(Json(state.storage.index().get(backup_id).await?))
}

/// Side-effect free: nothing is cached or written
pub async fn preview_restore(
    State(state): State<AppState>,
    Path(backup_id): Path<Uuid>,
    body: Option<Json<PreviewRequest>>,
) -> ApiResult<Json<RestorePreview>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let preview = state
        .restores
        .preview(
            backup_id,
            &request.scope,
            request.target.as_deref(),
            &request.options,
        )
        .await?;
    Ok(Json(preview))
}

pub async fn submit_restore(
    State(state): State<AppState>,
    Path(backup_id): Path<Uuid>,
    Json(body): Json<SubmitRestoreBody>,
) -> ApiResult<(StatusCode, Json<Admission>)> {
    let request = RestoreRequest {
        backup_id,
        scope: body.scope,
        target: body.target,
        options: body.options,
        accepted_preview_digest: body.accepted_preview_digest,
    };
    let admission = state.orchestrator.submit_restore(request).await?;
    Ok((StatusCode::ACCEPTED, Json(admission)))
}

pub async fn get_restore(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Response> {
    match state.orchestrator.get_restore_job(job_id) {
        Ok(job) => Ok(Json(job).into_response()),
        Err(BackupError::NotFound { .. }) => {
            Ok(Json(state.orchestrator.logged_job(job_id).await?).into_response())
        }
        Err(e) => Err(e.into()),
    }
}
