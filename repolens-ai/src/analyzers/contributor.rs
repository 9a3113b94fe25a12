//! Contribution concentration and recent author activity

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;
use std::collections::HashSet;

use super::{round3, sample_confidence, AnalysisContext, Analyzer, AnalyzerError};
use crate::models::{AnalyzerKind, Contributor, Insight, NormalizedDataset, ResourceKind};

const ACTIVE_WINDOW_DAYS: i64 = 90;

pub struct ContributorAnalyzer;

/// Fewest contributors that together account for at least half the work
pub(crate) fn bus_factor(contributors: &[Contributor]) -> usize {
    let mut counts: Vec<u64> = contributors.iter().map(|c| c.contributions).collect();
    counts.sort_unstable_by(|a, b| b.cmp(a));

    let total: u64 = counts.iter().sum();
    if total == 0 {
        return 0;
    }

    let mut covered = 0u64;
    for (i, count) in counts.iter().enumerate() {
        covered += count;
        if covered * 2 >= total {
            return i + 1;
        }
    }
    counts.len()
}

#[async_trait]
impl Analyzer for ContributorAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Contributor
    }

    fn requires(&self) -> &'static [ResourceKind] {
        &[ResourceKind::Contributors, ResourceKind::Commits]
    }

    async fn analyze(
        &self,
        ctx: &AnalysisContext,
        dataset: &NormalizedDataset,
    ) -> Result<Vec<Insight>, AnalyzerError> {
        let mut insights = Vec::new();

        let total: u64 = dataset.contributors.iter().map(|c| c.contributions).sum();
        if total > 0 {
            let factor = bus_factor(&dataset.contributors);
            let top = dataset
                .contributors
                .iter()
                .max_by_key(|c| c.contributions)
                .map(|c| (c.login.as_str(), c.contributions as f64 / total as f64));

            let mut tags = vec!["contributors"];
            if factor <= 1 {
                tags.push("needs-attention");
            }

            insights.push(
                ctx.insight(
                    AnalyzerKind::Contributor,
                    format!(
                        "Bus factor {} across {} contributors",
                        factor,
                        dataset.contributors.len()
                    ),
                    sample_confidence(dataset.contributors.len(), 5),
                    json!({
                        "metric": "bus_factor",
                        "bus_factor": factor,
                        "contributors": dataset.contributors.len(),
                        "total_contributions": total,
                        "top_contributor": top.map(|(login, _)| login),
                        "top_share": top.map(|(_, share)| round3(share)),
                    }),
                )
                .with_tags(tags),
            );
        }

        if !dataset.commits.is_empty() {
            let since = ctx.now - Duration::days(ACTIVE_WINDOW_DAYS);
            let active: HashSet<&str> = dataset
                .commits
                .iter()
                .filter(|c| c.authored_at > since)
                .map(|c| c.author_login.as_deref().unwrap_or(c.author_name.as_str()))
                .filter(|author| !author.is_empty())
                .collect();

            let mut active: Vec<&str> = active.into_iter().collect();
            active.sort_unstable();

            insights.push(
                ctx.insight(
                    AnalyzerKind::Contributor,
                    format!(
                        "{} active authors in the last {} days",
                        active.len(),
                        ACTIVE_WINDOW_DAYS
                    ),
                    sample_confidence(dataset.commits.len(), 20),
                    json!({
                        "metric": "active_authors",
                        "window_days": ACTIVE_WINDOW_DAYS,
                        "authors": active,
                    }),
                )
                .with_tags(["contributors", "activity"]),
            );
        }

        if insights.is_empty() {
            return Err(AnalyzerError::InsufficientData(
                "no contributors or commits".to_string(),
            ));
        }
        Ok(insights)
    }
}
