//! Domain models for repository ingestion and analysis

pub mod dataset;
pub mod insight;
pub mod job;
pub mod repository;

pub use dataset::{
    Commit, Contributor, Issue, ItemState, NormalizedDataset, PullRequest, RawRecord, Release,
    ResourceKind,
};
pub use insight::{AnalyzerKind, Insight, InsightFilter};
pub use job::{AnalysisJob, AnalyzerFailure, JobErrorDetail, JobState, ProgressTracker};
pub use repository::Repository;
