//! Analysis job state machine
//!
//! QUEUED → IN_PROGRESS → {COMPLETED, FAILED, CANCELLED}
//!
//! A queued job may also be cancelled before a worker picks it up.
//! Terminal states have no outgoing transitions.

use super::{AnalyzerKind, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Analysis job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Accepted, waiting for a worker
    Queued,
    /// Fetching, normalizing or analyzing
    InProgress,
    /// Finished; some analyzers or resource kinds may be degraded
    Completed,
    /// Fetch failed entirely, every analyzer failed, or persistence failed
    Failed,
    /// Stopped on request
    Cancelled,
}

impl JobState {
    /// Column value in `analysis_jobs.state`
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(JobState::Queued),
            "IN_PROGRESS" => Some(JobState::InProgress),
            "COMPLETED" => Some(JobState::Completed),
            "FAILED" => Some(JobState::Failed),
            "CANCELLED" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine permits `self → next`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::InProgress)
                | (JobState::Queued, JobState::Cancelled)
                | (JobState::InProgress, JobState::Completed)
                | (JobState::InProgress, JobState::Failed)
                | (JobState::InProgress, JobState::Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-analyzer failure record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerFailure {
    pub analyzer: AnalyzerKind,
    pub error: String,
}

/// Structured, user-visible error detail
///
/// Present on `FAILED` and on `COMPLETED` jobs that ran degraded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobErrorDetail {
    pub message: String,
    pub degraded_kinds: Vec<ResourceKind>,
    pub failed_analyzers: Vec<AnalyzerFailure>,
}

impl JobErrorDetail {
    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.degraded_kinds.is_empty() && self.failed_analyzers.is_empty()
    }

    /// Human-readable summary of degradation, e.g.
    /// "degraded resource kinds: issues; failed analyzers: sentiment"
    pub fn summarize(
        degraded_kinds: &[ResourceKind],
        failed_analyzers: &[AnalyzerFailure],
    ) -> String {
        let mut parts = Vec::new();
        if !degraded_kinds.is_empty() {
            let kinds: Vec<&str> = degraded_kinds.iter().map(|k| k.as_str()).collect();
            parts.push(format!("degraded resource kinds: {}", kinds.join(", ")));
        }
        if !failed_analyzers.is_empty() {
            let names: Vec<&str> = failed_analyzers.iter().map(|f| f.analyzer.as_str()).collect();
            parts.push(format!("failed analyzers: {}", names.join(", ")));
        }
        parts.join("; ")
    }
}

/// Analysis job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub job_id: Uuid,
    pub repository_id: Uuid,
    pub state: JobState,
    /// Analyzers requested at trigger time
    pub analyzers: Vec<AnalyzerKind>,
    /// Fetch only records newer than the repository watermark
    #[serde(default)]
    pub incremental: bool,
    /// 0-100, monotonically non-decreasing
    pub progress_percent: u8,
    pub error_detail: Option<JobErrorDetail>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    /// New queued job
    pub fn new(repository_id: Uuid, analyzers: Vec<AnalyzerKind>) -> Self {
        let mut analyzers = analyzers;
        analyzers.sort();
        analyzers.dedup();

        Self {
            job_id: Uuid::new_v4(),
            repository_id,
            state: JobState::Queued,
            analyzers,
            incremental: false,
            progress_percent: 0,
            error_detail: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Progress computation for one job
///
/// Fetch + normalize contribute a fixed initial slice; the remainder is
/// split evenly across requested analyzers. The reported value never
/// decreases.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    fetch_slice: u8,
    requested: usize,
    completed: usize,
    current: u8,
}

impl ProgressTracker {
    pub fn new(fetch_slice: u8, requested_analyzers: usize) -> Self {
        Self {
            fetch_slice: fetch_slice.min(100),
            requested: requested_analyzers,
            completed: 0,
            current: 0,
        }
    }

    pub fn percent(&self) -> u8 {
        self.current
    }

    /// Fetch + normalize finished
    pub fn fetch_done(&mut self) -> u8 {
        self.raise(self.fetch_slice)
    }

    /// One more analyzer finished (success or isolated failure)
    pub fn analyzer_done(&mut self) -> u8 {
        self.completed = (self.completed + 1).min(self.requested);
        let remaining = 100 - u32::from(self.fetch_slice);
        let analyzed = if self.requested == 0 {
            remaining
        } else {
            remaining * self.completed as u32 / self.requested as u32
        };
        self.raise(self.fetch_slice.saturating_add(analyzed as u8))
    }

    pub fn finish(&mut self) -> u8 {
        self.raise(100)
    }

    fn raise(&mut self, candidate: u8) -> u8 {
        self.current = self.current.max(candidate.min(100));
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::InProgress));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
        assert!(JobState::InProgress.can_transition_to(JobState::Completed));
        assert!(JobState::InProgress.can_transition_to(JobState::Failed));
        assert!(JobState::InProgress.can_transition_to(JobState::Cancelled));
        assert!(!JobState::InProgress.can_transition_to(JobState::Queued));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            JobState::Queued,
            JobState::InProgress,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ];
        for state in all.iter().filter(|s| s.is_terminal()) {
            for next in all {
                assert!(!state.can_transition_to(next), "{} -> {}", state, next);
            }
        }
    }

    #[test]
    fn test_state_column_values() {
        for state in [
            JobState::Queued,
            JobState::InProgress,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
            assert_eq!(
                serde_json::to_string(&state).unwrap(),
                format!("\"{}\"", state.as_str())
            );
        }
        assert_eq!(JobState::parse("RUNNING"), None);
    }

    #[test]
    fn test_new_job_dedups_analyzers() {
        let job = AnalysisJob::new(
            Uuid::new_v4(),
            vec![AnalyzerKind::Trend, AnalyzerKind::Sentiment, AnalyzerKind::Trend],
        );
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.analyzers, vec![AnalyzerKind::Sentiment, AnalyzerKind::Trend]);
    }

    #[test]
    fn test_progress_slices() {
        let mut progress = ProgressTracker::new(20, 4);
        assert_eq!(progress.percent(), 0);
        assert_eq!(progress.fetch_done(), 20);
        assert_eq!(progress.analyzer_done(), 40);
        assert_eq!(progress.analyzer_done(), 60);
        assert_eq!(progress.analyzer_done(), 80);
        assert_eq!(progress.analyzer_done(), 100);
        // Extra completions never overshoot
        assert_eq!(progress.analyzer_done(), 100);
    }

    #[test]
    fn test_progress_monotonic() {
        let mut progress = ProgressTracker::new(20, 3);
        progress.analyzer_done();
        let before = progress.percent();
        // Late fetch_done cannot move progress backwards
        assert!(progress.fetch_done() >= before);
        assert_eq!(progress.finish(), 100);
    }

    #[test]
    fn test_error_summary() {
        let summary = JobErrorDetail::summarize(
            &[ResourceKind::Issues],
            &[AnalyzerFailure {
                analyzer: AnalyzerKind::Sentiment,
                error: "boom".into(),
            }],
        );
        assert_eq!(
            summary,
            "degraded resource kinds: issues; failed analyzers: sentiment"
        );
    }
}
