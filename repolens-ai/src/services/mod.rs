//! Ingestion and analysis services
//!
//! Leaves first: rate limiter → GitHub transport → fetcher → normalizer;
//! analyzer pipeline, cache, orchestrator and scheduler build on them.

pub mod cache;
pub mod fetcher;
pub mod github_api;
pub mod normalizer;
pub mod orchestrator;
pub mod pipeline;
pub mod rate_limiter;
pub mod scheduler;

pub use cache::{CacheService, CacheStats, Invalidation, Scope, Stamp};
pub use fetcher::{FetchCursor, FetchError, FetchedPage, Fetcher};
pub use github_api::{GithubApi, Page, PageRequest, QuotaInfo, SourceApi, TransportError};
pub use normalizer::normalize;
pub use orchestrator::{Orchestrator, OrchestratorError, RecoveryReport, TriggerRequest};
pub use pipeline::{AnalyzerPipeline, AnalyzerReport, PipelineError, PipelineOutcome, PipelineSink};
pub use rate_limiter::{Permit, RateLimitError, RateLimiter};
pub use scheduler::{Scheduler, TickReport};
