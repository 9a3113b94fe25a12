//! HTTP API handlers for repolens-ai
//!
//! REST for repositories, jobs, insights and queue topics; SSE for live
//! job events.

pub mod events;
pub mod health;
pub mod insights;
pub mod jobs;
pub mod queue;
pub mod repositories;

pub use events::event_routes;
pub use health::health_routes;
pub use insights::insight_routes;
pub use jobs::job_routes;
pub use queue::queue_routes;
pub use repositories::repository_routes;

/// Default page size for list endpoints
pub const DEFAULT_LIMIT: u32 = 50;
/// Largest page size any list endpoint returns
pub const MAX_LIMIT: u32 = 500;

/// Requested limit, defaulted and capped
pub(crate) fn page_limit(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}
