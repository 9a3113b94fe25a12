//! Repository registry handlers
//!
//! POST /repositories, GET /repositories, GET /repositories/:id

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::{AnalysisJob, Repository};
use crate::AppState;

/// POST /repositories request
#[derive(Debug, Deserialize)]
pub struct RegisterRepositoryRequest {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub external_id: Option<i64>,
}

/// GET /repositories/:id response
#[derive(Debug, Serialize)]
pub struct RepositoryDetail {
    #[serde(flatten)]
    pub repository: Repository,
    pub active_job: Option<AnalysisJob>,
    pub last_insight_at: Option<DateTime<Utc>>,
}

/// POST /repositories
///
/// Idempotent on `owner/name`: 201 when created, 200 when already known.
pub async fn register_repository(
    State(state): State<AppState>,
    Json(request): Json<RegisterRepositoryRequest>,
) -> ApiResult<(StatusCode, Json<Repository>)> {
    let slug = format!("{}/{}", request.owner.trim(), request.name.trim());
    let (owner, name) = Repository::parse_slug(&slug)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid repository: {}", slug)))?;

    let (repository, created) =
        db::repositories::upsert_repository(&state.db, owner, name, request.external_id).await?;

    if created {
        tracing::info!(
            repository_id = %repository.repository_id,
            repository = %repository.slug(),
            "Repository registered"
        );
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(repository)))
}

/// GET /repositories
pub async fn list_repositories(State(state): State<AppState>) -> ApiResult<Json<Vec<Repository>>> {
    Ok(Json(db::repositories::list_repositories(&state.db).await?))
}

/// GET /repositories/:id
pub async fn get_repository(
    State(state): State<AppState>,
    Path(repository_id): Path<Uuid>,
) -> ApiResult<Json<RepositoryDetail>> {
    let repository = load_or_404(&state, repository_id).await?;
    let active_job = db::jobs::active_job_for_repository(&state.db, repository_id).await?;
    let last_insight_at = db::insights::last_generated_at(&state.db, repository_id).await?;

    Ok(Json(RepositoryDetail {
        repository,
        active_job,
        last_insight_at,
    }))
}

pub(crate) async fn load_or_404(state: &AppState, repository_id: Uuid) -> ApiResult<Repository> {
    db::repositories::load_repository(&state.db, repository_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Repository not found: {}", repository_id)))
}

pub fn repository_routes() -> Router<AppState> {
    Router::new()
        .route("/repositories", get(list_repositories).post(register_repository))
        .route("/repositories/:id", get(get_repository))
}
