//! HTTP API over the job service, plus the local webhook echo receiver.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use riskwatch_core::{JobPatch, JobService, NewJob, TriggerOutcome};
use riskwatch_shared::{Job, JobId, JobStatus, RiskwatchError, Run};

/// Default page size for `GET /jobs/:id/runs`.
const DEFAULT_RUN_LIMIT: u32 = 50;

#[derive(Clone)]
pub(crate) struct AppState {
    pub jobs: Arc<JobService>,
}

/// Build the management API router.
pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(create_job).get(list_jobs))
        .route(
            "/jobs/:id",
            get(get_job).patch(update_job).delete(delete_job),
        )
        .route("/jobs/:id/runs", get(list_runs))
        .route("/jobs/:id/run", post(trigger_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for `riskwatch listen`: accepts any JSON POST and logs it.
pub(crate) fn echo_router() -> Router {
    Router::new()
        .route("/", post(echo))
        .route("/*path", post(echo))
        .layer(TraceLayer::new_for_http())
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Wraps [`RiskwatchError`] for conversion into an HTTP response.
pub(crate) struct ApiError(RiskwatchError);

impl From<RiskwatchError> for ApiError {
    fn from(err: RiskwatchError) -> Self {
        Self(err)
    }
}

pub(crate) fn status_for(err: &RiskwatchError) -> StatusCode {
    match err {
        RiskwatchError::JobNotFound { .. } => StatusCode::NOT_FOUND,
        RiskwatchError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_id(raw: &str) -> ApiResult<JobId> {
    raw.parse()
        .map_err(|_| ApiError(RiskwatchError::job_not_found(raw)))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<NewJob>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let job = state.jobs.create(body).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListJobsQuery {
    status: Option<String>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    Ok(Json(state.jobs.list(status).await?))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    let id = parse_id(&id)?;
    Ok(Json(state.jobs.get(&id).await?))
}

async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<JobPatch>,
) -> ApiResult<Json<Job>> {
    let id = parse_id(&id)?;
    Ok(Json(state.jobs.update(&id, patch).await?))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_id(&id)?;
    state.jobs.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListRunsQuery {
    limit: Option<u32>,
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    let id = parse_id(&id)?;
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT);
    Ok(Json(state.jobs.list_runs(&id, limit).await?))
}

async fn trigger_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = parse_id(&id)?;
    let outcome: TriggerOutcome = state.jobs.trigger(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": outcome }))))
}

async fn echo(Json(payload): Json<Value>) -> &'static str {
    info!(%payload, "webhook received");
    "ok"
}
