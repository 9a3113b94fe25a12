//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use repolens_common::events::Channel;
use serde::Serialize;

use crate::services::CacheStats;
use crate::{AppState, SERVICE_NAME};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the job store is unreachable
    pub status: String,
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    pub uptime_seconds: u64,
    /// Jobs queued or running; `None` when the store could not be read
    pub active_jobs: Option<i64>,
    pub global_subscribers: usize,
    pub dropped_subscribers: u64,
    pub cache: CacheStats,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let active_jobs = match state.orchestrator.active_jobs().await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not count active jobs");
            None
        }
    };

    Json(HealthResponse {
        status: if active_jobs.is_some() { "ok" } else { "degraded" }.to_string(),
        module: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        active_jobs,
        global_subscribers: state.broadcaster.subscriber_count(Channel::Global),
        dropped_subscribers: state.broadcaster.dropped_total(),
        cache: state.cache.stats().await,
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
