//! Lexicon-based sentiment of issue and pull request discussion

use async_trait::async_trait;
use serde_json::json;

use super::{round3, sample_confidence, AnalysisContext, Analyzer, AnalyzerError};
use crate::models::{AnalyzerKind, Insight, NormalizedDataset, ResourceKind};

const POSITIVE: &[&str] = &[
    "thanks", "thank", "great", "awesome", "love", "works", "fixed", "improve", "improved",
    "nice", "excellent", "helpful", "clean", "faster", "appreciate",
];

const NEGATIVE: &[&str] = &[
    "bug", "crash", "crashes", "broken", "fail", "fails", "failure", "error", "slow",
    "regression", "hang", "hangs", "wrong", "annoying", "panic", "unusable", "frustrating",
];

/// Scores within this distance of zero read as neutral
const NEUTRAL_BAND: f64 = 0.15;

pub struct SentimentAnalyzer;

/// `(positive - negative) / (positive + negative)`, `None` without any hit
pub(crate) fn score_text(text: &str) -> Option<f64> {
    let mut positive = 0u32;
    let mut negative = 0u32;
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        if POSITIVE.contains(&word.as_str()) {
            positive += 1;
        } else if NEGATIVE.contains(&word.as_str()) {
            negative += 1;
        }
    }

    let hits = positive + negative;
    (hits > 0).then(|| (f64::from(positive) - f64::from(negative)) / f64::from(hits))
}

fn label(score: f64) -> &'static str {
    if score > NEUTRAL_BAND {
        "positive"
    } else if score < -NEUTRAL_BAND {
        "negative"
    } else {
        "neutral"
    }
}

#[async_trait]
impl Analyzer for SentimentAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Sentiment
    }

    fn requires(&self) -> &'static [ResourceKind] {
        &[ResourceKind::Issues, ResourceKind::PullRequests]
    }

    async fn analyze(
        &self,
        ctx: &AnalysisContext,
        dataset: &NormalizedDataset,
    ) -> Result<Vec<Insight>, AnalyzerError> {
        // (source, number, title, score)
        let mut scored: Vec<(&str, u64, &str, f64)> = Vec::new();
        for issue in &dataset.issues {
            if let Some(s) = score_text(&format!("{} {}", issue.title, issue.body)) {
                scored.push(("issue", issue.number, issue.title.as_str(), s));
            }
        }
        for pr in &dataset.pull_requests {
            if let Some(s) = score_text(&format!("{} {}", pr.title, pr.body)) {
                scored.push(("pull_request", pr.number, pr.title.as_str(), s));
            }
        }

        if scored.is_empty() {
            return Err(AnalyzerError::InsufficientData(
                "no issue or pull request text carries sentiment".to_string(),
            ));
        }

        let average = scored.iter().map(|(_, _, _, s)| s).sum::<f64>() / scored.len() as f64;
        let overall = label(average);

        let mut insights = vec![ctx
            .insight(
                AnalyzerKind::Sentiment,
                format!("Community sentiment is {}", overall),
                sample_confidence(scored.len(), 15),
                json!({
                    "metric": "community_sentiment",
                    "score": round3(average),
                    "label": overall,
                    "threads_scored": scored.len(),
                    "threads_total": dataset.issues.len() + dataset.pull_requests.len(),
                    "partial": dataset.is_degraded(ResourceKind::Issues)
                        || dataset.is_degraded(ResourceKind::PullRequests),
                }),
            )
            .with_tags(["community", overall])];

        scored.sort_by(|a, b| a.3.total_cmp(&b.3));
        let hotspots: Vec<_> = scored
            .iter()
            .filter(|(_, _, _, s)| *s < -NEUTRAL_BAND)
            .take(3)
            .map(|(source, number, title, s)| {
                json!({"source": source, "number": number, "title": title, "score": round3(*s)})
            })
            .collect();

        if !hotspots.is_empty() {
            insights.push(
                ctx.insight(
                    AnalyzerKind::Sentiment,
                    format!("{} threads with strongly negative tone", hotspots.len()),
                    sample_confidence(scored.len(), 15) * 0.8,
                    json!({"metric": "negative_hotspots", "threads": hotspots}),
                )
                .with_tags(["community", "needs-attention"]),
            );
        }

        Ok(insights)
    }
}
