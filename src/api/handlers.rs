//! Job API endpoint handlers
//!
//! Thin wrappers over [`Dispatcher`]: each handler maps one trigger
//! operation onto the response envelope.

use crate::api::types::*;
use crate::db::JobKind;
use crate::error::{AppError, ErrorResponse, Result};
use crate::worker::Dispatcher;
use axum::{
    extract::{Json, Path, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared state for API handlers
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
}

impl ApiState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: AppError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("API error: {}", err);
    } else {
        warn!("API request rejected: {}", err);
    }
    let message = err.to_string();
    (
        status,
        Json(ApiResponse::error_with_data(&message, ErrorResponse::from(err))),
    )
        .into_response()
}

fn respond<T: Serialize>(ok: StatusCode, result: Result<T>) -> Response {
    match result {
        Ok(data) => (ok, Json(ApiResponse::success_with_data(data))).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Health Check
// ============================================================================

/// Health check endpoint - GET /api/v1/health
pub async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::<Empty>::success_with_message("IPS Analyzer API is running"))
}

// ============================================================================
// Jobs
// ============================================================================

/// Submit a job - POST /api/v1/jobs
pub async fn submit_job(
    AxumState(state): AxumState<Arc<ApiState>>,
    Json(request): Json<SubmitJobRequest>,
) -> Response {
    info!("Received job submission: kind={}", request.kind);

    let result = request
        .kind
        .parse::<JobKind>()
        .and_then(|kind| state.dispatcher.submit(kind, &request.params));
    respond(StatusCode::ACCEPTED, result)
}

/// Job status - GET /api/v1/jobs/:id
pub async fn get_job(
    AxumState(state): AxumState<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    respond(StatusCode::OK, state.dispatcher.status(&id))
}

/// Persisted candidates, best first - GET /api/v1/jobs/:id/candidates
pub async fn get_candidates(
    AxumState(state): AxumState<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    respond(StatusCode::OK, state.dispatcher.candidates(&id))
}

/// Cancel a pending or running job - POST /api/v1/jobs/:id/cancel
pub async fn cancel_job(
    AxumState(state): AxumState<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    info!("Cancel requested for job {}", id);
    respond(StatusCode::OK, state.dispatcher.cancel(&id))
}

// ============================================================================
// Triggers
// ============================================================================

/// Run the oldest pending job - POST /api/v1/jobs/process-next
pub async fn process_next(AxumState(state): AxumState<Arc<ApiState>>) -> Response {
    let result = state
        .dispatcher
        .process_next_pending()
        .await
        .map(|job_id| TriggerResult { job_id });
    respond(StatusCode::OK, result)
}

/// Run the oldest stuck pending job - POST /api/v1/jobs/recover
pub async fn recover_stuck(AxumState(state): AxumState<Arc<ApiState>>) -> Response {
    let result = state
        .dispatcher
        .recover_stuck()
        .await
        .map(|job_id| TriggerResult { job_id });
    respond(StatusCode::OK, result)
}
