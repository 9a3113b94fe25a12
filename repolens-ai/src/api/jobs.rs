//! Job trigger and status handlers
//!
//! POST /repositories/:id/analyze, GET /repositories/:id/jobs,
//! GET /jobs/:id, POST /jobs/:id/cancel

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::page_limit;
use super::repositories::load_or_404;
use crate::error::{ApiError, ApiResult};
use crate::models::{AnalysisJob, AnalyzerKind, JobState};
use crate::services::TriggerRequest;
use crate::AppState;

/// POST /repositories/:id/analyze request; the body is optional
#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeRequest {
    /// Analyzer names; omitted or empty runs the configured defaults
    #[serde(default)]
    pub analyzers: Option<Vec<String>>,
    #[serde(default)]
    pub incremental: bool,
}

/// POST /repositories/:id/analyze response
#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub job_id: Uuid,
    pub repository_id: Uuid,
    pub state: JobState,
    pub analyzers: Vec<AnalyzerKind>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub limit: Option<u32>,
}

fn parse_analyze_request(body: &[u8]) -> ApiResult<TriggerRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(TriggerRequest::default());
    }

    let request: AnalyzeRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))?;

    let analyzers = request
        .analyzers
        .map(|names| {
            names
                .iter()
                .map(|n| n.parse::<AnalyzerKind>().map_err(ApiError::BadRequest))
                .collect::<ApiResult<Vec<_>>>()
        })
        .transpose()?;

    Ok(TriggerRequest {
        analyzers,
        incremental: request.incremental,
    })
}

/// POST /repositories/:id/analyze
///
/// 202 with the queued job; 409 `ALREADY_IN_PROGRESS` while another job for
/// the repository is active.
pub async fn trigger_analysis(
    State(state): State<AppState>,
    Path(repository_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<AnalyzeResponse>)> {
    let request = parse_analyze_request(&body)?;
    let job = state.orchestrator.trigger(repository_id, request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AnalyzeResponse {
            job_id: job.job_id,
            repository_id: job.repository_id,
            state: job.state,
            analyzers: job.analyzers,
            created_at: job.created_at,
        }),
    ))
}

/// GET /repositories/:id/jobs, most recent first
pub async fn list_jobs(
    State(state): State<AppState>,
    Path(repository_id): Path<Uuid>,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Json<Vec<AnalysisJob>>> {
    load_or_404(&state, repository_id).await?;
    let jobs = state
        .orchestrator
        .list_jobs(repository_id, page_limit(query.limit))
        .await?;
    Ok(Json(jobs))
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<AnalysisJob>> {
    Ok(Json(state.orchestrator.job_status(job_id).await?))
}

/// POST /jobs/:id/cancel
///
/// 202; a running job stops at its next checkpoint.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<AnalysisJob>)> {
    let job = state.orchestrator.cancel(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/repositories/:id/analyze", post(trigger_analysis))
        .route("/repositories/:id/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
}
