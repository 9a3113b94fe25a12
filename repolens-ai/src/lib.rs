//! repolens-ai library interface
//!
//! Repository ingestion and analysis service. Exposes the building blocks
//! (rate limiter, fetcher, normalizer, analyzers, orchestrator, stores) and
//! the HTTP router for the binary and for integration tests.

pub mod analyzers;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use repolens_common::events::EventBroadcaster;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::analyzers::AnalyzerRegistry;
use crate::config::ServiceConfig;
use crate::services::{CacheService, Fetcher, Orchestrator, RateLimiter, SourceApi};

/// Service name used in logs, health and SSE
pub const SERVICE_NAME: &str = "repolens-ai";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub orchestrator: Orchestrator,
    pub cache: Arc<CacheService>,
    pub broadcaster: EventBroadcaster,
    pub config: Arc<ServiceConfig>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Wire every service from configuration around `api`
    ///
    /// The rate limiter, cache and broadcaster are created here once and
    /// shared by all jobs for the lifetime of the process.
    pub fn new(db: SqlitePool, config: ServiceConfig, api: Arc<dyn SourceApi>) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let fetcher = Fetcher::new(api, limiter, &config.fetch);
        let cache = Arc::new(CacheService::new(config.cache.default_ttl()));
        let broadcaster = EventBroadcaster::new(
            config.broadcast.subscriber_queue,
            config.broadcast.global_queue,
        );

        let orchestrator = Orchestrator::new(
            db.clone(),
            fetcher,
            AnalyzerRegistry::with_defaults(),
            Arc::clone(&cache),
            broadcaster.clone(),
            &config.pipeline,
        );

        Self {
            db,
            orchestrator,
            cache,
            broadcaster,
            config: Arc::new(config),
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::repository_routes())
        .merge(api::job_routes())
        .merge(api::insight_routes())
        .merge(api::event_routes())
        .merge(api::queue_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
