//! Insights produced by analyzers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Analyzer unit identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    CodeQuality,
    Sentiment,
    Trend,
    Contributor,
    Security,
}

impl AnalyzerKind {
    pub const ALL: [AnalyzerKind; 5] = [
        AnalyzerKind::CodeQuality,
        AnalyzerKind::Sentiment,
        AnalyzerKind::Trend,
        AnalyzerKind::Contributor,
        AnalyzerKind::Security,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyzerKind::CodeQuality => "code_quality",
            AnalyzerKind::Sentiment => "sentiment",
            AnalyzerKind::Trend => "trend",
            AnalyzerKind::Contributor => "contributor",
            AnalyzerKind::Security => "security",
        }
    }
}

impl fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalyzerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnalyzerKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown analyzer: {}", s))
    }
}

/// A confidence-scored finding for one repository
///
/// Immutable once persisted. A later job supersedes it with new rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub insight_id: Uuid,
    pub repository_id: Uuid,
    pub job_id: Uuid,
    pub analyzer: AnalyzerKind,
    /// Short human-readable headline
    pub title: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub payload: serde_json::Value,
    pub tags: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl Insight {
    /// Create an insight with confidence clamped into [0, 1]
    ///
    /// NaN confidence is stored as 0.
    pub fn new(
        repository_id: Uuid,
        job_id: Uuid,
        analyzer: AnalyzerKind,
        title: impl Into<String>,
        confidence: f64,
        payload: serde_json::Value,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };

        Self {
            insight_id: Uuid::new_v4(),
            repository_id,
            job_id,
            analyzer,
            title: title.into(),
            confidence,
            payload,
            tags: Vec::new(),
            generated_at: Utc::now(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self.tags.sort();
        self.tags.dedup();
        self
    }
}

/// Read-path filter for `GET /repositories/:id/insights`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightFilter {
    pub analyzer: Option<AnalyzerKind>,
    pub min_confidence: Option<f64>,
    pub tag: Option<String>,
    pub limit: Option<u32>,
    /// Include insights replaced by a later job for the same analyzer
    #[serde(default)]
    pub include_superseded: bool,
}

impl InsightFilter {
    /// Stable fragment for cache keys
    pub fn cache_fragment(&self) -> String {
        format!(
            "a={};c={};t={};l={};s={}",
            self.analyzer.map(|a| a.as_str()).unwrap_or("*"),
            self.min_confidence
                .map(|c| format!("{:.3}", c))
                .unwrap_or_else(|| "*".to_string()),
            self.tag.as_deref().unwrap_or("*"),
            self.limit.map(|l| l.to_string()).unwrap_or_else(|| "*".to_string()),
            self.include_superseded
        )
    }
}
