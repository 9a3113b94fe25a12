//! Security signals from issue, pull request and commit text plus the language mix

use async_trait::async_trait;
use serde_json::json;

use super::{round3, sample_confidence, AnalysisContext, Analyzer, AnalyzerError};
use crate::models::{AnalyzerKind, Insight, ItemState, NormalizedDataset, ResourceKind};

const SECURITY_TERMS: &[&str] = &[
    "cve-",
    "vulnerability",
    "vulnerable",
    "security",
    "xss",
    "csrf",
    "sql injection",
    "rce",
    "remote code execution",
    "exploit",
    "secret",
    "leak",
    "overflow",
    "use-after-free",
];

const SECURITY_LABELS: &[&str] = &["security", "vulnerability", "cve"];

/// Languages without memory safety by default
const MEMORY_UNSAFE: &[&str] = &["C", "C++", "Objective-C", "Assembly"];

pub struct SecurityAnalyzer;

pub(crate) fn mentions_security(text: &str) -> bool {
    let lowered = text.to_lowercase();
    SECURITY_TERMS.iter().any(|term| {
        if term.len() <= 3 {
            // Short terms must stand alone ("rce" not "source")
            lowered
                .split(|c: char| !c.is_alphanumeric())
                .any(|w| w == *term)
        } else {
            lowered.contains(term)
        }
    })
}

#[async_trait]
impl Analyzer for SecurityAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Security
    }

    fn requires(&self) -> &'static [ResourceKind] {
        &[
            ResourceKind::Issues,
            ResourceKind::PullRequests,
            ResourceKind::Commits,
            ResourceKind::Languages,
        ]
    }

    async fn analyze(
        &self,
        ctx: &AnalysisContext,
        dataset: &NormalizedDataset,
    ) -> Result<Vec<Insight>, AnalyzerError> {
        let examined =
            dataset.issues.len() + dataset.pull_requests.len() + dataset.commits.len();
        if examined == 0 && dataset.languages.is_empty() {
            return Err(AnalyzerError::InsufficientData(
                "no text or language data to inspect".to_string(),
            ));
        }

        let mut insights = Vec::new();

        if examined > 0 {
            let open_reports: Vec<u64> = dataset
                .issues
                .iter()
                .filter(|i| i.state == ItemState::Open)
                .filter(|i| {
                    i.labels
                        .iter()
                        .any(|l| SECURITY_LABELS.contains(&l.to_lowercase().as_str()))
                        || mentions_security(&format!("{} {}", i.title, i.body))
                })
                .map(|i| i.number)
                .collect();
            let closed_reports = dataset
                .issues
                .iter()
                .filter(|i| i.state == ItemState::Closed)
                .filter(|i| mentions_security(&format!("{} {}", i.title, i.body)))
                .count();
            let fixes = dataset
                .pull_requests
                .iter()
                .filter(|pr| pr.is_merged() && mentions_security(&pr.title))
                .count()
                + dataset
                    .commits
                    .iter()
                    .filter(|c| mentions_security(c.summary()))
                    .count();

            let title = if open_reports.is_empty() {
                "No open security reports".to_string()
            } else {
                format!("{} open security reports", open_reports.len())
            };
            let mut tags = vec!["security"];
            if !open_reports.is_empty() {
                tags.push("needs-attention");
            }

            // Absence of reports says less than their presence
            let base = if open_reports.is_empty() { 0.6 } else { 0.9 };
            insights.push(
                ctx.insight(
                    AnalyzerKind::Security,
                    title,
                    base * sample_confidence(examined, 10),
                    json!({
                        "metric": "security_reports",
                        "open_reports": open_reports,
                        "closed_reports": closed_reports,
                        "security_fixes": fixes,
                        "items_examined": examined,
                        "partial": dataset.is_degraded(ResourceKind::Issues),
                    }),
                )
                .with_tags(tags),
            );
        }

        let total_bytes: u64 = dataset.languages.values().sum();
        if total_bytes > 0 {
            let unsafe_bytes: u64 = dataset
                .languages
                .iter()
                .filter(|(lang, _)| MEMORY_UNSAFE.contains(&lang.as_str()))
                .map(|(_, bytes)| bytes)
                .sum();
            let share = unsafe_bytes as f64 / total_bytes as f64;

            insights.push(
                ctx.insight(
                    AnalyzerKind::Security,
                    format!("{:.0}% of code in memory-unsafe languages", share * 100.0),
                    0.8,
                    json!({
                        "metric": "memory_safety",
                        "unsafe_share": round3(share),
                        "unsafe_bytes": unsafe_bytes,
                        "total_bytes": total_bytes,
                    }),
                )
                .with_tags(["security", "languages"]),
            );
        }

        Ok(insights)
    }
}
