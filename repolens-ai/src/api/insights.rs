//! Insight read handlers, served through the cache
//!
//! GET /repositories/:id/insights, GET /repositories/:id/summary,
//! GET /leaderboard
//!
//! Responses carry `x-cache: hit|miss`. Per-repository entries are dropped
//! when a job for that repository finishes; the leaderboard is dropped when
//! any job finishes. Write-backs are stamped so a read racing a job's
//! completion never re-caches the pre-job result.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::page_limit;
use super::repositories::load_or_404;
use crate::db;
use crate::db::insights::{InsightSummary, LeaderboardEntry};
use crate::error::{ApiError, ApiResult};
use crate::models::{AnalyzerKind, Insight, InsightFilter};
use crate::services::cache::{insights_key, leaderboard_key, summary_key, Scope};
use crate::AppState;

const CACHE_HEADER: &str = "x-cache";

type Cached<T> = ([(&'static str, &'static str); 1], Json<T>);

fn cached<T>(hit: bool, value: T) -> Cached<T> {
    ([(CACHE_HEADER, if hit { "hit" } else { "miss" })], Json(value))
}

/// GET /repositories/:id/insights query
#[derive(Debug, Default, Deserialize)]
pub struct InsightQuery {
    pub analyzer: Option<String>,
    pub min_confidence: Option<f64>,
    pub tag: Option<String>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub include_superseded: bool,
}

impl InsightQuery {
    fn into_filter(self) -> ApiResult<InsightFilter> {
        let analyzer = self
            .analyzer
            .map(|a| a.parse::<AnalyzerKind>().map_err(ApiError::BadRequest))
            .transpose()?;

        if let Some(c) = self.min_confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(ApiError::BadRequest(format!(
                    "min_confidence must be between 0 and 1, got {}",
                    c
                )));
            }
        }

        Ok(InsightFilter {
            analyzer,
            min_confidence: self.min_confidence,
            tag: self.tag.filter(|t| !t.is_empty()),
            limit: self.limit.map(|l| page_limit(Some(l))),
            include_superseded: self.include_superseded,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<u32>,
}

/// GET /repositories/:id/insights
///
/// Ordered by confidence, then recency.
pub async fn list_insights(
    State(state): State<AppState>,
    Path(repository_id): Path<Uuid>,
    Query(query): Query<InsightQuery>,
) -> ApiResult<Cached<Vec<Insight>>> {
    let filter = query.into_filter()?;
    let key = insights_key(repository_id, &filter);

    if let Some(insights) = state.cache.get_as::<Vec<Insight>>(&key).await {
        return Ok(cached(true, insights));
    }

    load_or_404(&state, repository_id).await?;
    let stamp = state.cache.stamp(Scope::Repository(repository_id)).await;
    let insights = db::insights::query_insights(&state.db, repository_id, &filter).await?;
    state
        .cache
        .set_as_if_current(key, &insights, state.cache.default_ttl(), stamp)
        .await;

    Ok(cached(false, insights))
}

/// GET /repositories/:id/summary
pub async fn get_summary(
    State(state): State<AppState>,
    Path(repository_id): Path<Uuid>,
) -> ApiResult<Cached<InsightSummary>> {
    let key = summary_key(repository_id);
    if let Some(summary) = state.cache.get_as::<InsightSummary>(&key).await {
        return Ok(cached(true, summary));
    }

    load_or_404(&state, repository_id).await?;
    let stamp = state.cache.stamp(Scope::Repository(repository_id)).await;
    let summary = db::insights::summarize(&state.db, repository_id).await?;
    state
        .cache
        .set_as_if_current(key, &summary, state.cache.default_ttl(), stamp)
        .await;

    Ok(cached(false, summary))
}

/// GET /leaderboard
///
/// Ranks every repository, so any repository's job invalidates it.
pub async fn get_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> ApiResult<Cached<Vec<LeaderboardEntry>>> {
    let limit = page_limit(query.limit);
    let key = leaderboard_key(limit);

    if let Some(board) = state.cache.get_as::<Vec<LeaderboardEntry>>(&key).await {
        return Ok(cached(true, board));
    }

    let stamp = state.cache.stamp(Scope::Global).await;
    let board = db::insights::leaderboard(&state.db, limit).await?;
    state
        .cache
        .set_as_if_current(key, &board, state.cache.default_ttl(), stamp)
        .await;

    Ok(cached(false, board))
}

pub fn insight_routes() -> Router<AppState> {
    Router::new()
        .route("/repositories/:id/insights", get(list_insights))
        .route("/repositories/:id/summary", get(get_summary))
        .route("/leaderboard", get(get_leaderboard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_to_filter() {
        let filter = InsightQuery {
            analyzer: Some("security".into()),
            min_confidence: Some(0.5),
            tag: Some(String::new()),
            limit: Some(9_999),
            include_superseded: false,
        }
        .into_filter()
        .unwrap();

        assert_eq!(filter.analyzer, Some(AnalyzerKind::Security));
        assert_eq!(filter.tag, None);
        assert_eq!(filter.limit, Some(super::super::MAX_LIMIT));
    }

    #[test]
    fn test_invalid_query_rejected() {
        let bad_confidence = InsightQuery {
            min_confidence: Some(1.5),
            ..Default::default()
        };
        assert!(matches!(bad_confidence.into_filter(), Err(ApiError::BadRequest(_))));

        let bad_analyzer = InsightQuery {
            analyzer: Some("vibes".into()),
            ..Default::default()
        };
        assert!(bad_analyzer.into_filter().is_err());
    }
}
