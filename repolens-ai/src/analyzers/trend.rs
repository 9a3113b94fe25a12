//! Activity trends: commit velocity, release cadence, issue balance

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;

use super::{round3, sample_confidence, AnalysisContext, Analyzer, AnalyzerError};
use crate::models::{AnalyzerKind, Insight, NormalizedDataset, ResourceKind};

/// Length of each comparison window for commit velocity
const WINDOW_DAYS: i64 = 28;
/// Relative change below which velocity counts as stable
const STABLE_BAND: f64 = 0.2;

pub struct TrendAnalyzer;

fn direction(change: f64) -> &'static str {
    if change > STABLE_BAND {
        "growing"
    } else if change < -STABLE_BAND {
        "declining"
    } else {
        "stable"
    }
}

impl TrendAnalyzer {
    fn commit_velocity(&self, ctx: &AnalysisContext, dataset: &NormalizedDataset) -> Option<Insight> {
        if dataset.commits.is_empty() {
            return None;
        }

        let window = Duration::days(WINDOW_DAYS);
        let recent_start = ctx.now - window;
        let previous_start = recent_start - window;

        let recent = dataset
            .commits
            .iter()
            .filter(|c| c.authored_at > recent_start && c.authored_at <= ctx.now)
            .count();
        let previous = dataset
            .commits
            .iter()
            .filter(|c| c.authored_at > previous_start && c.authored_at <= recent_start)
            .count();

        let change = if previous == 0 {
            if recent == 0 {
                0.0
            } else {
                1.0
            }
        } else {
            (recent as f64 - previous as f64) / previous as f64
        };
        let trend = direction(change);

        Some(
            ctx.insight(
                AnalyzerKind::Trend,
                format!(
                    "Commit activity {} ({} in the last {} days, {} before)",
                    trend, recent, WINDOW_DAYS, previous
                ),
                sample_confidence(recent + previous, 20),
                json!({
                    "metric": "commit_velocity",
                    "window_days": WINDOW_DAYS,
                    "recent": recent,
                    "previous": previous,
                    "change": round3(change),
                    "direction": trend,
                }),
            )
            .with_tags(["activity", trend]),
        )
    }

    fn release_cadence(&self, ctx: &AnalysisContext, dataset: &NormalizedDataset) -> Option<Insight> {
        let mut published: Vec<_> = dataset
            .releases
            .iter()
            .filter(|r| !r.prerelease)
            .filter_map(|r| r.published_at)
            .collect();
        if published.len() < 2 {
            return None;
        }
        published.sort_unstable();

        let gaps: Vec<f64> = published
            .windows(2)
            .map(|w| (w[1] - w[0]).num_hours() as f64 / 24.0)
            .collect();
        let average_days = gaps.iter().sum::<f64>() / gaps.len() as f64;
        let days_since_last = published
            .last()
            .map(|last| (ctx.now - *last).num_days())
            .unwrap_or_default();
        let overdue = days_since_last as f64 > 2.0 * average_days;

        let mut tags = vec!["releases"];
        if overdue {
            tags.push("needs-attention");
        }

        Some(
            ctx.insight(
                AnalyzerKind::Trend,
                format!("A release every {:.0} days on average", average_days),
                sample_confidence(gaps.len(), 4),
                json!({
                    "metric": "release_cadence",
                    "releases": published.len(),
                    "average_days_between": round3(average_days),
                    "days_since_last": days_since_last,
                    "overdue": overdue,
                }),
            )
            .with_tags(tags),
        )
    }

    fn issue_balance(&self, ctx: &AnalysisContext, dataset: &NormalizedDataset) -> Option<Insight> {
        if dataset.issues.is_empty() {
            return None;
        }

        let since = ctx.now - Duration::days(WINDOW_DAYS);
        let opened = dataset.issues.iter().filter(|i| i.created_at > since).count();
        let closed = dataset
            .issues
            .iter()
            .filter(|i| i.closed_at.is_some_and(|c| c > since))
            .count();
        let net = opened as i64 - closed as i64;

        Some(
            ctx.insight(
                AnalyzerKind::Trend,
                format!(
                    "Issue backlog {} by {} over {} days",
                    if net > 0 { "grew" } else { "shrank" },
                    net.abs(),
                    WINDOW_DAYS
                ),
                sample_confidence(opened + closed, 10),
                json!({
                    "metric": "issue_balance",
                    "window_days": WINDOW_DAYS,
                    "opened": opened,
                    "closed": closed,
                    "net": net,
                }),
            )
            .with_tags(["issues"]),
        )
    }
}

#[async_trait]
impl Analyzer for TrendAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Trend
    }

    fn requires(&self) -> &'static [ResourceKind] {
        &[ResourceKind::Commits, ResourceKind::Releases, ResourceKind::Issues]
    }

    async fn analyze(
        &self,
        ctx: &AnalysisContext,
        dataset: &NormalizedDataset,
    ) -> Result<Vec<Insight>, AnalyzerError> {
        let insights: Vec<Insight> = [
            self.commit_velocity(ctx, dataset),
            self.release_cadence(ctx, dataset),
            self.issue_balance(ctx, dataset),
        ]
        .into_iter()
        .flatten()
        .collect();

        if insights.is_empty() {
            return Err(AnalyzerError::InsufficientData(
                "no dated activity to trend".to_string(),
            ));
        }
        Ok(insights)
    }
}
