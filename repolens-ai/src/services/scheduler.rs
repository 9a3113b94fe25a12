//! Periodic analysis of configured repositories
//!
//! Each tick registers every configured `owner/name` (idempotent) and
//! triggers a job for it. A repository that still has an active job is
//! skipped until the next tick.

use sqlx::SqlitePool;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::orchestrator::{Orchestrator, OrchestratorError, TriggerRequest};
use crate::config::ScheduleConfig;
use crate::db;
use crate::models::Repository;

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub triggered: usize,
    /// Skipped because a job was already active
    pub skipped: usize,
    /// Slugs that failed to parse or to trigger
    pub errors: usize,
}

pub struct Scheduler {
    db: SqlitePool,
    orchestrator: Orchestrator,
    interval: Duration,
    repositories: Vec<String>,
}

impl Scheduler {
    /// `None` when scheduling is disabled or nothing is configured
    pub fn from_config(
        db: SqlitePool,
        orchestrator: Orchestrator,
        config: &ScheduleConfig,
    ) -> Option<Self> {
        if config.interval_secs == 0 || config.repositories.is_empty() {
            return None;
        }
        Some(Self {
            db,
            orchestrator,
            interval: Duration::from_secs(config.interval_secs),
            repositories: config.repositories.clone(),
        })
    }

    /// Run ticks until `shutdown` fires; the first tick is immediate
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                repositories = self.repositories.len(),
                "Scheduler started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.tick().await;
                        debug!(?report, "Scheduler tick");
                    }
                }
            }
            info!("Scheduler stopped");
        })
    }

    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for slug in &self.repositories {
            let Some((owner, name)) = Repository::parse_slug(slug) else {
                warn!(slug = %slug, "Ignoring malformed scheduled repository");
                report.errors += 1;
                continue;
            };

            let repository = match db::repositories::upsert_repository(&self.db, owner, name, None).await {
                Ok((repository, _)) => repository,
                Err(e) => {
                    error!(slug = %slug, error = %e, "Registering scheduled repository failed");
                    report.errors += 1;
                    continue;
                }
            };

            match self
                .orchestrator
                .trigger(repository.repository_id, TriggerRequest::default())
                .await
            {
                Ok(job) => {
                    info!(job_id = %job.job_id, repository = %slug, "Scheduled analysis triggered");
                    report.triggered += 1;
                }
                Err(OrchestratorError::JobConflict { .. }) => {
                    info!(repository = %slug, "Scheduled analysis skipped, job already active");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(repository = %slug, error = %e, "Scheduled trigger failed");
                    report.errors += 1;
                }
            }
        }

        report
    }
}
