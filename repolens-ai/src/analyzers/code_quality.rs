//! Code-quality signals from commit and pull request history

use async_trait::async_trait;
use serde_json::json;

use super::{round3, sample_confidence, AnalysisContext, Analyzer, AnalyzerError};
use crate::models::{AnalyzerKind, Insight, NormalizedDataset, ResourceKind};

const CONVENTIONAL_PREFIXES: &[&str] = &[
    "feat", "fix", "docs", "style", "refactor", "perf", "test", "build", "ci", "chore", "revert",
];

/// Summaries that say nothing about the change
const LOW_SIGNAL_SUMMARIES: &[&str] = &["wip", "fix", "update", "changes", "misc", "tmp", "."];

pub struct CodeQualityAnalyzer;

/// `type(scope)!: subject` or `type: subject`
fn is_conventional(summary: &str) -> bool {
    let Some((head, subject)) = summary.split_once(':') else {
        return false;
    };
    let kind = head
        .trim_end_matches('!')
        .split('(')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    CONVENTIONAL_PREFIXES.contains(&kind.as_str()) && !subject.trim().is_empty()
}

fn is_low_signal(summary: &str) -> bool {
    let lowered = summary.trim().to_ascii_lowercase();
    lowered.len() < 8 || LOW_SIGNAL_SUMMARIES.contains(&lowered.as_str())
}

impl CodeQualityAnalyzer {
    fn commit_hygiene(&self, ctx: &AnalysisContext, dataset: &NormalizedDataset) -> Option<Insight> {
        let total = dataset.commits.len();
        if total == 0 {
            return None;
        }

        let conventional = dataset
            .commits
            .iter()
            .filter(|c| is_conventional(c.summary()))
            .count();
        let low_signal = dataset
            .commits
            .iter()
            .filter(|c| is_low_signal(c.summary()))
            .count();
        let with_body = dataset
            .commits
            .iter()
            .filter(|c| c.message.lines().skip(1).any(|l| !l.trim().is_empty()))
            .count();

        let ratio = |n: usize| n as f64 / total as f64;
        let score = (0.5 * ratio(conventional) + 0.3 * (1.0 - ratio(low_signal)) + 0.2 * ratio(with_body))
            .clamp(0.0, 1.0);

        let mut tags = vec!["commits"];
        if ratio(low_signal) > 0.3 {
            tags.push("needs-attention");
        }

        Some(
            ctx.insight(
                AnalyzerKind::CodeQuality,
                format!("Commit message hygiene scores {:.0}/100", score * 100.0),
                sample_confidence(total, 20),
                json!({
                    "metric": "commit_hygiene",
                    "score": round3(score),
                    "commits_sampled": total,
                    "conventional_ratio": round3(ratio(conventional)),
                    "low_signal_ratio": round3(ratio(low_signal)),
                    "with_body_ratio": round3(ratio(with_body)),
                }),
            )
            .with_tags(tags),
        )
    }

    fn review_flow(&self, ctx: &AnalysisContext, dataset: &NormalizedDataset) -> Option<Insight> {
        let total = dataset.pull_requests.len();
        if total == 0 {
            return None;
        }

        let merged: Vec<_> = dataset
            .pull_requests
            .iter()
            .filter_map(|pr| pr.merged_at.map(|m| (m - pr.created_at).num_hours().max(0)))
            .collect();
        let drafts = dataset.pull_requests.iter().filter(|pr| pr.draft).count();
        let merge_rate = merged.len() as f64 / total as f64;
        let median_hours = median(&merged);

        Some(
            ctx.insight(
                AnalyzerKind::CodeQuality,
                match median_hours {
                    Some(h) => format!(
                        "{:.0}% of pull requests merged, median {}h to merge",
                        merge_rate * 100.0,
                        h
                    ),
                    None => "No pull requests merged yet".to_string(),
                },
                sample_confidence(total, 10),
                json!({
                    "metric": "review_flow",
                    "pull_requests_sampled": total,
                    "merge_rate": round3(merge_rate),
                    "median_hours_to_merge": median_hours,
                    "drafts": drafts,
                }),
            )
            .with_tags(["pull-requests"]),
        )
    }
}

fn median(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}

#[async_trait]
impl Analyzer for CodeQualityAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::CodeQuality
    }

    fn requires(&self) -> &'static [ResourceKind] {
        &[ResourceKind::Commits, ResourceKind::PullRequests]
    }

    async fn analyze(
        &self,
        ctx: &AnalysisContext,
        dataset: &NormalizedDataset,
    ) -> Result<Vec<Insight>, AnalyzerError> {
        let insights: Vec<Insight> = [
            self.commit_hygiene(ctx, dataset),
            self.review_flow(ctx, dataset),
        ]
        .into_iter()
        .flatten()
        .collect();

        if insights.is_empty() {
            return Err(AnalyzerError::InsufficientData(
                "no commits or pull requests".to_string(),
            ));
        }
        Ok(insights)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;

    #[test]
    fn test_conventional_detection() {
        assert!(is_conventional("feat: add parser"));
        assert!(is_conventional("fix(io)!: handle EOF"));
        assert!(!is_conventional("Add parser"));
        assert!(!is_conventional("feat:"));
        assert!(!is_conventional("note: something"));
    }

    #[test]
    fn test_low_signal() {
        assert!(is_low_signal("wip"));
        assert!(is_low_signal("Update"));
        assert!(!is_low_signal("Handle empty config files"));
    }

    #[tokio::test]
    async fn test_poor_hygiene_flagged() {
        let mut dataset = healthy_dataset();
        dataset.commits = (0..10)
            .map(|i| commit(&format!("s{}", i), "ada", "wip", i))
            .collect();

        let insights = CodeQualityAnalyzer.analyze(&ctx(), &dataset).await.unwrap();
        let hygiene = insights
            .iter()
            .find(|i| i.payload["metric"] == "commit_hygiene")
            .unwrap();
        assert!(hygiene.tags.contains(&"needs-attention".to_string()));
        assert_eq!(hygiene.payload["low_signal_ratio"], 1.0);
    }

    #[tokio::test]
    async fn test_review_flow_median() {
        let dataset = healthy_dataset();
        let insights = CodeQualityAnalyzer.analyze(&ctx(), &dataset).await.unwrap();
        let flow = insights
            .iter()
            .find(|i| i.payload["metric"] == "review_flow")
            .unwrap();
        // Merged after 1 and 2 days
        assert_eq!(flow.payload["median_hours_to_merge"], 48);
        assert_eq!(flow.payload["pull_requests_sampled"], 3);
    }

    #[tokio::test]
    async fn test_empty_dataset_insufficient() {
        let dataset = NormalizedDataset::default();
        let err = CodeQualityAnalyzer.analyze(&ctx(), &dataset).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::InsufficientData(_)));
    }
}
