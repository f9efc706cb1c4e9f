//! # API Handlers
//!
//! Thin axum wrappers over [`JobCoordinator`]. Handlers that only touch the
//! store run on the blocking pool, since rusqlite calls may wait out the
//! busy timeout.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use sca_core::{FaultResultView, FilterDescriptor, Job, JobId, JobStatus, Page, PageRequest};

use crate::jobs::{CancelOutcome, CoordinatorError, JobCoordinator, SubmitRequest};
use crate::solver::ResolveError;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn reject(err: CoordinatorError) -> (StatusCode, Json<ApiError>) {
    let status = match &err {
        CoordinatorError::JobNotFound(_) => StatusCode::NOT_FOUND,
        CoordinatorError::Dataset(ResolveError::NotFound(_)) => StatusCode::NOT_FOUND,
        CoordinatorError::Dataset(ResolveError::InvalidReference(_)) => StatusCode::BAD_REQUEST,
        CoordinatorError::InvalidFilter(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::Duplicate(_) => StatusCode::CONFLICT,
        CoordinatorError::Dataset(_) | CoordinatorError::QueueClosed | CoordinatorError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    (
        status,
        Json(ApiError {
            error: err.to_string(),
        }),
    )
}

/// Run a synchronous coordinator call off the async workers.
async fn blocking<T, F>(state: &AppState, call: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&JobCoordinator) -> Result<T, CoordinatorError> + Send + 'static,
{
    let coordinator = state.coordinator.clone();
    match tokio::task::spawn_blocking(move || call(&coordinator)).await {
        Ok(result) => result.map_err(reject),
        Err(err) => {
            tracing::error!(error = %err, "blocking store call panicked");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError {
                    error: "internal error".into(),
                }),
            ))
        }
    }
}

// =============================================================================
// Jobs
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let job_id = state.coordinator.submit(request).await.map_err(reject)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<JobId>,
) -> ApiResult<Json<StatusResponse>> {
    let status = blocking(&state, move |c| c.status(job_id)).await?;
    Ok(Json(StatusResponse { job_id, status }))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<JobId>,
) -> ApiResult<Json<Job>> {
    blocking(&state, move |c| c.job(job_id)).await.map(Json)
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub outcome: CancelOutcome,
}

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<JobId>,
) -> ApiResult<Json<CancelResponse>> {
    let outcome = blocking(&state, move |c| c.on_cancel_signal(job_id)).await?;
    Ok(Json(CancelResponse { job_id, outcome }))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResultQuery {
    #[serde(default)]
    pub filters: Vec<FilterDescriptor>,
    #[serde(default)]
    pub page: PageRequest,
}

pub async fn query_results(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<JobId>,
    Json(query): Json<ResultQuery>,
) -> ApiResult<Json<Page<FaultResultView>>> {
    let page = blocking(&state, move |c| c.results(job_id, &query.filters, &query.page)).await?;
    Ok(Json(page))
}

pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<JobId>,
) -> ApiResult<StatusCode> {
    blocking(&state, move |c| c.delete(job_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: usize,
}

pub async fn delete_all_jobs(State(state): State<Arc<AppState>>) -> ApiResult<Json<CountResponse>> {
    let count = blocking(&state, |c| c.delete_all()).await?;
    Ok(Json(CountResponse { count }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub job_ids: Vec<JobId>,
    #[serde(default = "default_invalidated_status")]
    pub status: JobStatus,
}

fn default_invalidated_status() -> JobStatus {
    JobStatus::NotDone
}

pub async fn invalidate_jobs(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InvalidateRequest>,
) -> ApiResult<Json<CountResponse>> {
    let count = blocking(&state, move |c| c.set_status(&request.job_ids, request.status)).await?;
    Ok(Json(CountResponse { count }))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub running_jobs: usize,
    pub pending_cancels: usize,
    pub event_subscribers: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (running_jobs, pending_cancels) = state.coordinator.in_flight();
    Json(HealthResponse {
        status: "ok".into(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        running_jobs,
        pending_cancels,
        event_subscribers: state.events.subscriber_count(),
    })
}
