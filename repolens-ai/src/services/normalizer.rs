//! Raw upstream records → [`NormalizedDataset`]
//!
//! Pure and stateless. Records that do not match the expected shape are
//! counted in `skipped_records` rather than failing the run; duplicates
//! (same sha / number / login / tag) keep their first occurrence, so
//! overlapping pages from a resumed fetch are harmless.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;
use uuid::Uuid;

use crate::models::{
    Commit, Contributor, Issue, ItemState, NormalizedDataset, PullRequest, RawRecord, Release,
    ResourceKind,
};

#[derive(Deserialize)]
struct UserRef {
    login: String,
}

#[derive(Deserialize)]
struct GitSignature {
    #[serde(default)]
    name: Option<String>,
    date: DateTime<Utc>,
}

#[derive(Deserialize)]
struct CommitDetail {
    author: GitSignature,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct CommitPayload {
    sha: String,
    commit: CommitDetail,
    #[serde(default)]
    author: Option<UserRef>,
}

#[derive(Deserialize)]
struct LabelRef {
    name: String,
}

#[derive(Deserialize)]
struct IssuePayload {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: ItemState,
    #[serde(default)]
    user: Option<UserRef>,
    #[serde(default)]
    labels: Vec<LabelRef>,
    #[serde(default)]
    comments: u32,
    created_at: DateTime<Utc>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct PullPayload {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: ItemState,
    #[serde(default)]
    user: Option<UserRef>,
    #[serde(default)]
    draft: bool,
    created_at: DateTime<Utc>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ContributorPayload {
    login: String,
    contributions: u64,
}

#[derive(Deserialize)]
struct ReleasePayload {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

/// Build the dataset for one analysis run
///
/// `degraded` lists the kinds whose fetch failed; they are carried through
/// unchanged so analyzers can tell "empty" from "unknown".
pub fn normalize<I>(
    repository_id: Uuid,
    repository: &str,
    records: I,
    degraded: BTreeSet<ResourceKind>,
) -> NormalizedDataset
where
    I: IntoIterator<Item = RawRecord>,
{
    let mut dataset = NormalizedDataset {
        repository_id,
        repository: repository.to_string(),
        degraded,
        ..Default::default()
    };
    let mut seen: HashSet<(ResourceKind, String)> = HashSet::new();

    for record in records {
        let kind = record.kind;
        if !apply(&mut dataset, &mut seen, record) {
            *dataset.skipped_records.entry(kind).or_insert(0) += 1;
        }
    }

    if !dataset.skipped_records.is_empty() {
        debug!(
            repository = %repository,
            skipped = ?dataset.skipped_records,
            "Skipped malformed records"
        );
    }
    dataset
}

/// Fold one record into the dataset; `false` when it could not be read
fn apply(
    dataset: &mut NormalizedDataset,
    seen: &mut HashSet<(ResourceKind, String)>,
    record: RawRecord,
) -> bool {
    let kind = record.kind;
    let mut first_seen = |identity: String| seen.insert((kind, identity));

    match kind {
        ResourceKind::Commits => match serde_json::from_value::<CommitPayload>(record.payload) {
            Ok(c) => {
                if first_seen(c.sha.clone()) {
                    dataset.commits.push(Commit {
                        sha: c.sha,
                        author_login: c.author.map(|u| u.login),
                        author_name: c.commit.author.name.unwrap_or_default(),
                        message: c.commit.message,
                        authored_at: c.commit.author.date,
                    });
                }
                true
            }
            Err(_) => false,
        },
        ResourceKind::Issues => match serde_json::from_value::<IssuePayload>(record.payload) {
            Ok(i) => {
                if first_seen(i.number.to_string()) {
                    dataset.issues.push(Issue {
                        number: i.number,
                        title: i.title,
                        body: i.body.unwrap_or_default(),
                        state: i.state,
                        author: i.user.map(|u| u.login),
                        labels: i.labels.into_iter().map(|l| l.name).collect(),
                        comments: i.comments,
                        created_at: i.created_at,
                        closed_at: i.closed_at,
                    });
                }
                true
            }
            Err(_) => false,
        },
        ResourceKind::PullRequests => {
            match serde_json::from_value::<PullPayload>(record.payload) {
                Ok(p) => {
                    if first_seen(p.number.to_string()) {
                        dataset.pull_requests.push(PullRequest {
                            number: p.number,
                            title: p.title,
                            body: p.body.unwrap_or_default(),
                            state: p.state,
                            author: p.user.map(|u| u.login),
                            draft: p.draft,
                            created_at: p.created_at,
                            closed_at: p.closed_at,
                            merged_at: p.merged_at,
                        });
                    }
                    true
                }
                Err(_) => false,
            }
        }
        ResourceKind::Contributors => {
            // Anonymous contributors carry no login and are skipped here
            match serde_json::from_value::<ContributorPayload>(record.payload) {
                Ok(c) => {
                    if first_seen(c.login.clone()) {
                        dataset.contributors.push(Contributor {
                            login: c.login,
                            contributions: c.contributions,
                        });
                    }
                    true
                }
                Err(_) => false,
            }
        }
        ResourceKind::Releases => match serde_json::from_value::<ReleasePayload>(record.payload) {
            Ok(r) => {
                if first_seen(r.tag_name.clone()) {
                    dataset.releases.push(Release {
                        name: r.name.unwrap_or_else(|| r.tag_name.clone()),
                        tag: r.tag_name,
                        prerelease: r.prerelease,
                        published_at: r.published_at,
                    });
                }
                true
            }
            Err(_) => false,
        },
        ResourceKind::Languages => {
            match serde_json::from_value::<BTreeMap<String, u64>>(record.payload) {
                Ok(histogram) => {
                    for (language, bytes) in histogram {
                        *dataset.languages.entry(language).or_insert(0) += bytes;
                    }
                    true
                }
                Err(_) => false,
            }
        }
    }
}
