//! Tracked repository

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A source-control repository registered for analysis
///
/// Mutated only by the orchestrator after a job finishes
/// (watermark and current job reference).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub repository_id: Uuid,
    /// Upstream numeric id, when known
    pub external_id: Option<i64>,
    pub owner: String,
    pub name: String,
    /// Incremental sync watermark: upstream records older than this were already ingested
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Most recent job triggered for this repository
    pub current_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, external_id: Option<i64>) -> Self {
        Self {
            repository_id: Uuid::new_v4(),
            external_id,
            owner: owner.into(),
            name: name.into(),
            last_synced_at: None,
            current_job_id: None,
            created_at: Utc::now(),
        }
    }

    /// `owner/name`
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Split `owner/name` into its parts
    pub fn parse_slug(slug: &str) -> Option<(&str, &str)> {
        let (owner, name) = slug.split_once('/')?;
        let valid = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        (valid(owner) && valid(name)).then_some((owner, name))
    }
}
