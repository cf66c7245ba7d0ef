use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiResult, AppState};
use crate::backup::BackupError;
use crate::backup::retention::RetentionAction;
use crate::storage::replication::ProviderStatus;
use crate::storage::{ConnectionTestResult, ProviderConfig};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RetentionQuery {
    pub dry_run: bool,
}

/// Evaluate retention for one policy, or only plan it with `?dry_run=true`
pub async fn evaluate_retention(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
    Query(query): Query<RetentionQuery>,
) -> ApiResult<Json<Value>> {
    if query.dry_run {
        let plan = state.retention.dry_run(&policy_id).await?;
        return Ok(Json(json!({
            "policy_id": policy_id,
            "dry_run": true,
            "kept": plan.with_action(RetentionAction::Keep),
            "archived": plan.with_action(RetentionAction::Archive),
            "deleted": plan.with_action(RetentionAction::Delete),
            "compressed": plan.with_action(RetentionAction::Compress),
        })));
    }

    let outcome = state.retention.evaluate(&policy_id).await?;
    state
        .metrics
        .retention_deleted_total
        .inc_by(outcome.deleted.len() as u64);
    state
        .metrics
        .retention_archived_total
        .inc_by(outcome.archived.len() as u64);
    Ok(Json(serde_json::to_value(outcome).map_err(BackupError::from)?))
}

pub async fn list_providers(State(state): State<AppState>) -> ApiResult<Json<Vec<ProviderStatus>>> {
    Ok(Json(state.storage.list_providers().await?))
}

/// Test the connection of an unregistered provider configuration
pub async fn test_connection(
    State(state): State<AppState>,
    Json(config): Json<ProviderConfig>,
) -> ApiResult<Json<ConnectionTestResult>> {
    config.validate()?;
    Ok(Json(state.storage.test_connection(&config).await))
}
