pub mod jobs_api;
pub mod restore_api;
pub mod storage_api;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::backup::{BackupError, JobOrchestrator, PolicyStore, RestoreEngine, RetentionEngine};
use crate::monitoring::{BackupMetrics, HealthChecker, HealthStatus};
use crate::storage::StorageManager;

/// Application state for the web API
#[derive(Clone)]
pub struct AppState {
    pub policies: Arc<PolicyStore>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub restores: Arc<RestoreEngine>,
    pub retention: Arc<RetentionEngine>,
    pub storage: Arc<StorageManager>,
    pub health: Arc<HealthChecker>,
    pub metrics: Arc<BackupMetrics>,
}

/// Engine errors rendered as `{"error": {"code", "message"}}`
#[derive(Debug)]
pub struct ApiError(pub BackupError);

impl From<BackupError> for ApiError {
    fn from(error: BackupError) -> Self {
        ApiError(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            BackupError::NotFound { .. } => StatusCode::NOT_FOUND,
            BackupError::ConfigInvalid { .. } => StatusCode::BAD_REQUEST,
            BackupError::PreviewRequired { .. }
            | BackupError::InvalidTransition { .. }
            | BackupError::RetentionConflict { .. } => StatusCode::CONFLICT,
            BackupError::ConcurrencyLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            BackupError::ProviderUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BackupError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        }));
        (self.status(), body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Create the main API router
pub fn create_api_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/metrics", get(metrics))
        // Policies and backup jobs
        .route("/api/policies", get(jobs_api::list_policies))
        .route("/api/policies/:id/jobs", post(jobs_api::submit_backup))
        .route("/api/policies/:id/retention", post(storage_api::evaluate_retention))
        .route("/api/jobs", get(jobs_api::list_jobs))
        .route("/api/jobs/:id", get(jobs_api::get_job))
        .route("/api/jobs/:id/cancel", post(jobs_api::cancel_job))
        .route("/api/jobs/:id/pause", post(jobs_api::pause_job))
        .route("/api/jobs/:id/resume", post(jobs_api::resume_job))
        // Records and restores
        .route("/api/backups/:id", get(restore_api::get_backup))
        .route(
            "/api/backups/:id/restore/preview",
            post(restore_api::preview_restore),
        )
        .route("/api/backups/:id/restore", post(restore_api::submit_restore))
        .route("/api/restores/:id", get(restore_api::get_restore))
        // Storage providers
        .route("/api/providers", get(storage_api::list_providers))
        .route("/api/providers/test", post(storage_api::test_connection))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Response {
    match state.health.check_system_health().await {
        Ok(health) => {
            let status = match health.status {
                HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::OK,
            };
            (
                status,
                Json(json!({
                    "status": health.status,
                    "service": "backup-core",
                    "version": env!("CARGO_PKG_VERSION"),
                    "details": health,
                })),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "Unhealthy", "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let not_found = ApiError(BackupError::NotFound {
            entity: "job",
            id: "x".to_string(),
        });
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError(BackupError::PreviewRequired {
                message: "stale".to_string()
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(BackupError::unavailable("s3", "down")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
