use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{ApiResult, AppState};
use crate::backup::{Admission, BackupError, BackupJob, BackupPolicy, Trigger};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubmitBackupRequest {
    /// Schedule id for scheduled triggers; manual when absent
    pub schedule_id: Option<String>,
}

pub async fn list_policies(State(state): State<AppState>) -> Json<Vec<BackupPolicy>> {
    Json(state.policies.list().await)
}

/// Submit a backup job for a policy
pub async fn submit_backup(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
    body: Option<Json<SubmitBackupRequest>>,
) -> ApiResult<(StatusCode, Json<Admission>)> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let trigger = match request.schedule_id {
        Some(schedule_id) => Trigger::Scheduled { schedule_id },
        None => Trigger::Manual,
    };
    let admission = state.orchestrator.submit_backup(&policy_id, trigger).await?;
    let status = match admission {
        Admission::Rejected { .. } => StatusCode::OK,
        _ => StatusCode::ACCEPTED,
    };
    Ok((status, Json(admission)))
}

pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<BackupJob>> {
    Json(state.orchestrator.list_jobs())
}

/// A live job, or its job-log summary once it has left memory
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Response> {
    match state.orchestrator.get_job(job_id) {
        Ok(job) => Ok(Json(job).into_response()),
        Err(BackupError::NotFound { .. }) => {
            Ok(Json(state.orchestrator.logged_job(job_id).await?).into_response())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.orchestrator.cancel(job_id).await?;
    Ok(Json(json!({ "job_id": job_id, "cancellation_requested": true })))
}

pub async fn pause_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.orchestrator.pause(job_id)?;
    Ok(Json(json!({ "job_id": job_id, "status": "paused" })))
}

pub async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.orchestrator.resume(job_id)?;
    Ok(Json(json!({ "job_id": job_id, "status": "running" })))
}
