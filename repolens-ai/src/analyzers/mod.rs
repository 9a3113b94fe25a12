//! Analyzer units
//!
//! Each analyzer reads the shared, immutable [`NormalizedDataset`] and
//! produces confidence-scored [`Insight`]s. Analyzers hold no mutable state
//! and know nothing about each other; the pipeline runs them concurrently
//! and isolates their failures.
//!
//! # Analyzers
//! 1. **code_quality** - commit message hygiene, pull request flow
//! 2. **sentiment** - lexicon scoring of issue and pull request text
//! 3. **trend** - commit activity, release cadence, issue balance
//! 4. **contributor** - concentration of contributions (bus factor)
//! 5. **security** - security-related reports and language risk

pub mod code_quality;
pub mod contributor;
pub mod security;
pub mod sentiment;
pub mod trend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AnalyzerKind, Insight, NormalizedDataset, ResourceKind};

pub use code_quality::CodeQualityAnalyzer;
pub use contributor::ContributorAnalyzer;
pub use security::SecurityAnalyzer;
pub use sentiment::SentimentAnalyzer;
pub use trend::TrendAnalyzer;

/// Analyzer failure, tagged with the analyzer kind at the fan-out boundary
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalyzerError {
    /// Required data missing or degraded
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Analysis failed: {0}")]
    Failed(String),

    /// The analyzer task panicked; caught by the pipeline
    #[error("Analyzer panicked: {0}")]
    Panicked(String),
}

/// Per-run identity handed to every analyzer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisContext {
    pub repository_id: Uuid,
    pub job_id: Uuid,
    /// Reference instant for time-windowed heuristics
    pub now: DateTime<Utc>,
}

impl AnalysisContext {
    pub fn new(repository_id: Uuid, job_id: Uuid) -> Self {
        Self {
            repository_id,
            job_id,
            now: Utc::now(),
        }
    }

    /// Start an insight attributed to this run
    pub fn insight(
        &self,
        analyzer: AnalyzerKind,
        title: impl Into<String>,
        confidence: f64,
        payload: serde_json::Value,
    ) -> Insight {
        Insight::new(
            self.repository_id,
            self.job_id,
            analyzer,
            title,
            confidence,
            payload,
        )
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    fn kind(&self) -> AnalyzerKind;

    /// Resource kinds this analyzer reads
    ///
    /// When every one of them is degraded the analyzer is not run.
    fn requires(&self) -> &'static [ResourceKind];

    async fn analyze(
        &self,
        ctx: &AnalysisContext,
        dataset: &NormalizedDataset,
    ) -> Result<Vec<Insight>, AnalyzerError>;
}

/// Analyzer instances by kind
#[derive(Clone)]
pub struct AnalyzerRegistry {
    analyzers: BTreeMap<AnalyzerKind, Arc<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn empty() -> Self {
        Self {
            analyzers: BTreeMap::new(),
        }
    }

    /// All five built-in analyzers
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(CodeQualityAnalyzer));
        registry.register(Arc::new(SentimentAnalyzer));
        registry.register(Arc::new(TrendAnalyzer));
        registry.register(Arc::new(ContributorAnalyzer));
        registry.register(Arc::new(SecurityAnalyzer));
        registry
    }

    /// Add an analyzer, replacing any registered under the same kind
    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>) -> &mut Self {
        self.analyzers.insert(analyzer.kind(), analyzer);
        self
    }

    pub fn get(&self, kind: AnalyzerKind) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<AnalyzerKind> {
        self.analyzers.keys().copied().collect()
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Confidence from sample size: 0 at n = 0, 0.5 at n = `half_at`, → 1
pub(crate) fn sample_confidence(n: usize, half_at: usize) -> f64 {
    let n = n as f64;
    n / (n + half_at.max(1) as f64)
}

/// Round for stable JSON payloads
pub(crate) fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
