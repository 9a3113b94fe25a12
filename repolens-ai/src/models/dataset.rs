//! Raw upstream records and the normalized dataset handed to analyzers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Category of upstream data fetched per repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Commits,
    Issues,
    PullRequests,
    Contributors,
    Releases,
    Languages,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Commits,
        ResourceKind::Issues,
        ResourceKind::PullRequests,
        ResourceKind::Contributors,
        ResourceKind::Releases,
        ResourceKind::Languages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Commits => "commits",
            ResourceKind::Issues => "issues",
            ResourceKind::PullRequests => "pull_requests",
            ResourceKind::Contributors => "contributors",
            ResourceKind::Releases => "releases",
            ResourceKind::Languages => "languages",
        }
    }

    /// Upstream honours a `since` watermark for this kind
    pub fn supports_since(&self) -> bool {
        matches!(self, ResourceKind::Commits | ResourceKind::Issues)
    }

    /// Upstream returns this kind as a single document rather than pages
    pub fn is_single_document(&self) -> bool {
        matches!(self, ResourceKind::Languages)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind: {}", s))
    }
}

/// One opaque upstream record, tagged with its kind
///
/// Transient: consumed by the normalizer and discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub kind: ResourceKind,
    /// Upstream creation/update time, when the record carries one
    pub source_timestamp: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    /// Platform login, absent for commits by unlinked emails
    pub author_login: Option<String>,
    pub author_name: String,
    pub message: String,
    pub authored_at: DateTime<Utc>,
}

impl Commit {
    /// First line of the message
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: ItemState,
    pub author: Option<String>,
    pub labels: Vec<String>,
    pub comments: u32,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: ItemState,
    pub author: Option<String>,
    pub draft: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
}

impl PullRequest {
    pub fn is_merged(&self) -> bool {
        self.merged_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub login: String,
    pub contributions: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub tag: String,
    pub name: String,
    pub prerelease: bool,
    pub published_at: Option<DateTime<Utc>>,
}

/// Normalizer output for one analysis run of one repository
///
/// Immutable once built; analyzers receive it behind an `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDataset {
    pub repository_id: Uuid,
    /// `owner/name`
    pub repository: String,
    pub commits: Vec<Commit>,
    pub issues: Vec<Issue>,
    pub pull_requests: Vec<PullRequest>,
    pub contributors: Vec<Contributor>,
    pub releases: Vec<Release>,
    /// Language name → bytes of code
    pub languages: BTreeMap<String, u64>,
    /// Kinds whose fetch exhausted its retry budget
    pub degraded: BTreeSet<ResourceKind>,
    /// Records the normalizer could not interpret, per kind
    pub skipped_records: BTreeMap<ResourceKind, usize>,
}

impl NormalizedDataset {
    pub fn is_degraded(&self, kind: ResourceKind) -> bool {
        self.degraded.contains(&kind)
    }

    /// Total normalized entities across all collections
    pub fn len(&self) -> usize {
        self.commits.len()
            + self.issues.len()
            + self.pull_requests.len()
            + self.contributors.len()
            + self.releases.len()
            + self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_round_trip_names() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>(), Ok(kind));
        }
        assert!("wiki".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_resource_kind_serde_matches_as_str() {
        let json = serde_json::to_string(&ResourceKind::PullRequests).unwrap();
        assert_eq!(json, "\"pull_requests\"");
    }

    #[test]
    fn test_commit_summary() {
        let commit = Commit {
            sha: "abc".into(),
            author_login: None,
            author_name: "Dev".into(),
            message: "Fix parser\n\nLonger body".into(),
            authored_at: Utc::now(),
        };
        assert_eq!(commit.summary(), "Fix parser");
    }

    #[test]
    fn test_dataset_degraded() {
        let mut dataset = NormalizedDataset::default();
        assert!(dataset.is_empty());
        dataset.degraded.insert(ResourceKind::Issues);
        assert!(dataset.is_degraded(ResourceKind::Issues));
        assert!(!dataset.is_degraded(ResourceKind::Commits));
    }
}
