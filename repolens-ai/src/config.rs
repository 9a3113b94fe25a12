//! Configuration for repolens-ai
//!
//! Loaded from `repolens-ai.toml`; every field has a default so a missing
//! file yields a working configuration. Secrets resolve ENV → TOML.

use repolens_common::config::LoggingConfig;
use repolens_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::AnalyzerKind;

/// Environment variable overriding `[github] token`
pub const GITHUB_TOKEN_ENV: &str = "REPOLENS_GITHUB_TOKEN";
/// Environment variable overriding `root_folder`
pub const ROOT_FOLDER_ENV: &str = "REPOLENS_ROOT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub root_folder: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Personal access token; `REPOLENS_GITHUB_TOKEN` takes priority
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token: None,
            user_agent: None,
            request_timeout_secs: default_request_timeout_secs(),
            per_page: default_per_page(),
        }
    }
}

/// Token bucket parameters (upstream published quota)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,
    /// Burst capacity; defaults to the full quota window
    #[serde(default)]
    pub burst: Option<u32>,
    /// Longest a caller may wait for a permit before `RateLimitExceeded`
    #[serde(default = "default_max_suspend_secs")]
    pub max_suspend_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_hour: default_requests_per_hour(),
            burst: None,
            max_suspend_secs: default_max_suspend_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn burst_capacity(&self) -> u32 {
        self.burst.unwrap_or(self.requests_per_hour)
    }

    pub fn max_suspend(&self) -> Duration {
        Duration::from_secs(self.max_suspend_secs)
    }
}

/// Retry and pagination policy for the fetcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Hard cap on pages per resource kind
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_pages: default_max_pages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Concurrent jobs (one worker per active job)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Progress share of the fetch + normalize stage
    #[serde(default = "default_fetch_slice_percent")]
    pub fetch_slice_percent: u8,
    /// Analyzers run when a trigger names none
    #[serde(default = "default_analyzers")]
    pub default_analyzers: Vec<AnalyzerKind>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fetch_slice_percent: default_fetch_slice_percent(),
            default_analyzers: default_analyzers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    #[serde(default = "default_global_queue")]
    pub global_queue: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: default_subscriber_queue(),
            global_queue: default_global_queue(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// 0 disables scheduled runs
    #[serde(default)]
    pub interval_secs: u64,
    /// `owner/name` slugs analyzed on every tick
    #[serde(default)]
    pub repositories: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1:5740".to_string()
}
fn default_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_per_page() -> u32 {
    100
}
fn default_requests_per_hour() -> u32 {
    5000
}
fn default_max_suspend_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_max_pages() -> u32 {
    20
}
fn default_workers() -> usize {
    4
}
fn default_fetch_slice_percent() -> u8 {
    20
}
fn default_analyzers() -> Vec<AnalyzerKind> {
    AnalyzerKind::ALL.to_vec()
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_subscriber_queue() -> usize {
    64
}
fn default_global_queue() -> usize {
    256
}

impl ServiceConfig {
    /// Reject values the services cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.requests_per_hour == 0 {
            return Err(Error::Config("rate_limit.requests_per_hour must be >= 1".into()));
        }
        if self.rate_limit.burst_capacity() == 0 {
            return Err(Error::Config("rate_limit.burst must be >= 1".into()));
        }
        if self.fetch.max_attempts == 0 {
            return Err(Error::Config("fetch.max_attempts must be >= 1".into()));
        }
        if self.fetch.max_pages == 0 {
            return Err(Error::Config("fetch.max_pages must be >= 1".into()));
        }
        if self.fetch.base_backoff_ms > self.fetch.max_backoff_ms {
            return Err(Error::Config(
                "fetch.base_backoff_ms must not exceed fetch.max_backoff_ms".into(),
            ));
        }
        if self.pipeline.fetch_slice_percent > 100 {
            return Err(Error::Config("pipeline.fetch_slice_percent must be 0-100".into()));
        }
        if self.pipeline.workers == 0 {
            return Err(Error::Config("pipeline.workers must be >= 1".into()));
        }
        if self.pipeline.default_analyzers.is_empty() {
            return Err(Error::Config("pipeline.default_analyzers must not be empty".into()));
        }
        if !(1..=100).contains(&self.github.per_page) {
            return Err(Error::Config("github.per_page must be 1-100".into()));
        }
        Ok(())
    }
}

/// Resolve the GitHub token
///
/// **Priority:** ENV → TOML. Unauthenticated access is allowed but gets
/// a much smaller upstream quota.
pub fn resolve_github_token(github: &GithubConfig) -> Option<String> {
    let env_token = std::env::var(GITHUB_TOKEN_ENV)
        .ok()
        .filter(|t| is_valid_token(t));
    let toml_token = github.token.clone().filter(|t| is_valid_token(t));

    if env_token.is_some() && toml_token.is_some() {
        warn!("GitHub token found in both environment and TOML. Using environment (highest priority).");
    }

    match (env_token, toml_token) {
        (Some(token), _) => {
            info!("GitHub token loaded from environment variable");
            Some(token)
        }
        (None, Some(token)) => {
            info!("GitHub token loaded from TOML config");
            Some(token)
        }
        (None, None) => {
            warn!("No GitHub token configured; upstream quota will be limited");
            None
        }
    }
}

/// Non-empty, non-whitespace
pub fn is_valid_token(token: &str) -> bool {
    !token.trim().is_empty()
}
