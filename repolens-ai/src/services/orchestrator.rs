//! Analysis job orchestrator
//!
//! Owns the job state machine and drives one job end to end:
//!
//! 1. Insert the job (`QUEUED`); the job store rejects a second active job
//!    for the same repository with [`OrchestratorError::JobConflict`].
//! 2. A worker permit is taken and the job moves to `IN_PROGRESS`.
//! 3. Resource kinds are fetched concurrently; a kind whose fetch fails is
//!    recorded as degraded and the run continues on partial data.
//! 4. The normalized dataset is handed to the [`AnalyzerPipeline`]; each
//!    analyzer's insights are persisted as soon as they arrive.
//! 5. The job is finalized, repository caches are invalidated, the event is
//!    mirrored to its queue topic, and only then is it broadcast.
//!
//! Cancellation is cooperative: a per-job [`CancellationToken`] is checked at
//! fetch page boundaries and before each analyzer starts.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use repolens_common::events::{AnalysisEvent, EventBroadcaster};
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cache::CacheService;
use super::fetcher::{FetchCursor, FetchError, Fetcher};
use super::normalizer::normalize;
use super::pipeline::{AnalyzerPipeline, AnalyzerReport, PipelineError, PipelineSink};
use crate::analyzers::{AnalysisContext, AnalyzerRegistry};
use crate::config::PipelineConfig;
use crate::db;
use crate::db::jobs::InsertOutcome;
use crate::models::{
    AnalysisJob, AnalyzerFailure, AnalyzerKind, Insight, JobErrorDetail, JobState,
    ProgressTracker, RawRecord, Repository, ResourceKind,
};

/// Error detail recorded on jobs a previous process left running
pub const INTERRUPTED_MESSAGE: &str = "interrupted by service restart";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Another job for the repository is queued or running
    #[error("Repository {repository} already has an active analysis job")]
    JobConflict {
        repository: String,
        active_job_id: Option<Uuid>,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error(transparent)]
    Persistence(#[from] repolens_common::Error),
}

/// Options for one trigger
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerRequest {
    /// Analyzers to run; `None` or empty selects the configured defaults
    pub analyzers: Option<Vec<AnalyzerKind>>,
    /// Fetch only records newer than the repository's watermark
    pub incremental: bool,
}

/// Outcome of startup recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// In-progress jobs marked failed
    pub failed: usize,
    /// Queued jobs handed to a worker again
    pub resumed: usize,
}

struct Inner {
    db: SqlitePool,
    fetcher: Fetcher,
    pipeline: AnalyzerPipeline,
    cache: Arc<CacheService>,
    broadcaster: EventBroadcaster,
    workers: Arc<Semaphore>,
    cancellation_tokens: RwLock<HashMap<Uuid, CancellationToken>>,
    fetch_slice_percent: u8,
    default_analyzers: Vec<AnalyzerKind>,
}

/// Cheap to clone; clones share workers, tokens and services
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        db: SqlitePool,
        fetcher: Fetcher,
        registry: AnalyzerRegistry,
        cache: Arc<CacheService>,
        broadcaster: EventBroadcaster,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                fetcher,
                pipeline: AnalyzerPipeline::new(registry),
                cache,
                broadcaster,
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                cancellation_tokens: RwLock::new(HashMap::new()),
                fetch_slice_percent: config.fetch_slice_percent.min(100),
                default_analyzers: config.default_analyzers.clone(),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.inner.cache
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.inner.broadcaster
    }

    /// Queue a job for `repository_id` and hand it to a worker
    pub async fn trigger(
        &self,
        repository_id: Uuid,
        request: TriggerRequest,
    ) -> Result<AnalysisJob, OrchestratorError> {
        let repository = db::repositories::load_repository(&self.inner.db, repository_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("Repository not found: {}", repository_id))
            })?;

        let analyzers = match request.analyzers {
            Some(requested) if !requested.is_empty() => requested,
            _ => self.inner.default_analyzers.clone(),
        };
        let job = AnalysisJob::new(repository_id, analyzers).with_incremental(request.incremental);

        match db::jobs::insert_job(&self.inner.db, &job).await? {
            InsertOutcome::Inserted => {}
            InsertOutcome::Conflict { active_job_id } => {
                info!(
                    repository = %repository.slug(),
                    active_job_id = ?active_job_id,
                    "Trigger rejected, analysis already active"
                );
                return Err(OrchestratorError::JobConflict {
                    repository: repository.slug(),
                    active_job_id,
                });
            }
        }

        info!(
            job_id = %job.job_id,
            repository = %repository.slug(),
            analyzers = ?job.analyzers,
            incremental = job.incremental,
            "Analysis job queued"
        );

        self.inner.broadcaster.publish(&AnalysisEvent::JobQueued {
            job_id: job.job_id,
            repository_id,
            repository: repository.slug(),
            analyzers: job.analyzers.iter().map(|a| a.as_str().to_string()).collect(),
            timestamp: Utc::now(),
        });

        self.spawn_worker(job.clone(), repository).await;
        Ok(job)
    }

    /// Request cancellation
    ///
    /// A queued job is cancelled immediately. A running job stops at its
    /// next checkpoint; the returned record may still show `IN_PROGRESS`.
    pub async fn cancel(&self, job_id: Uuid) -> Result<AnalysisJob, OrchestratorError> {
        let job = self.job_status(job_id).await?;
        if job.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                job_id,
                from: job.state,
                to: JobState::Cancelled,
            });
        }

        if let Some(token) = self.inner.cancellation_tokens.read().await.get(&job_id) {
            token.cancel();
        }

        if job.state == JobState::Queued
            && db::jobs::transition_from(
                &self.inner.db,
                job_id,
                &[JobState::Queued],
                JobState::Cancelled,
                None,
            )
            .await?
        {
            info!(job_id = %job_id, "Queued job cancelled before start");
            self.finalize(&job, JobState::Cancelled, &JobErrorDetail::default(), 0)
                .await;
        } else {
            info!(job_id = %job_id, "Cancellation requested for running job");
        }

        self.job_status(job_id).await
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<AnalysisJob, OrchestratorError> {
        db::jobs::load_job(&self.inner.db, job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Job not found: {}", job_id)))
    }

    pub async fn list_jobs(
        &self,
        repository_id: Uuid,
        limit: u32,
    ) -> Result<Vec<AnalysisJob>, OrchestratorError> {
        Ok(db::jobs::list_jobs_for_repository(&self.inner.db, repository_id, limit).await?)
    }

    /// Jobs currently queued or running, across all repositories
    pub async fn active_jobs(&self) -> Result<i64, OrchestratorError> {
        Ok(db::jobs::count_active_jobs(&self.inner.db).await?)
    }

    /// Settle jobs a previous process left unfinished
    ///
    /// Running jobs lost their worker and are failed; queued jobs never
    /// started and are dispatched again with their stored options.
    pub async fn recover_interrupted_jobs(&self) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport::default();

        for job in db::jobs::list_unfinished_jobs(&self.inner.db).await? {
            match job.state {
                JobState::InProgress => {
                    let detail = JobErrorDetail {
                        message: INTERRUPTED_MESSAGE.to_string(),
                        ..Default::default()
                    };
                    if db::jobs::transition(&self.inner.db, job.job_id, JobState::Failed, Some(&detail))
                        .await?
                    {
                        warn!(job_id = %job.job_id, "Interrupted job marked failed");
                        self.finalize(&job, JobState::Failed, &detail, 0).await;
                        report.failed += 1;
                    }
                }
                JobState::Queued => {
                    match db::repositories::load_repository(&self.inner.db, job.repository_id).await? {
                        Some(repository) => {
                            info!(job_id = %job.job_id, repository = %repository.slug(), "Resuming queued job");
                            self.spawn_worker(job, repository).await;
                            report.resumed += 1;
                        }
                        None => {
                            error!(job_id = %job.job_id, "Queued job references a missing repository");
                        }
                    }
                }
                _ => {}
            }
        }

        if report != RecoveryReport::default() {
            info!(failed = report.failed, resumed = report.resumed, "Startup recovery finished");
        }
        Ok(report)
    }

    async fn spawn_worker(&self, job: AnalysisJob, repository: Repository) {
        let token = CancellationToken::new();
        self.inner
            .cancellation_tokens
            .write()
            .await
            .insert(job.job_id, token.clone());

        let this = self.clone();
        tokio::spawn(async move {
            let job_id = job.job_id;
            // One worker per active job; the permit is held for the whole run
            let permit = match Arc::clone(&this.inner.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(job_id = %job_id, "Worker pool closed, job not started");
                    return;
                }
            };

            if let Err(e) = this.run_job(&job, &repository, &token).await {
                error!(job_id = %job_id, error = %e, "Analysis job aborted");
                this.fail_aborted(&job, &e).await;
            }

            drop(permit);
            this.inner.cancellation_tokens.write().await.remove(&job_id);
        });
    }

    async fn run_job(
        &self,
        job: &AnalysisJob,
        repository: &Repository,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let job_id = job.job_id;
        let slug = repository.slug();

        if !db::jobs::transition(&self.inner.db, job_id, JobState::InProgress, None).await? {
            // Cancelled while waiting for a worker
            debug!(job_id = %job_id, "Job no longer queued, skipping");
            return Ok(());
        }
        let started_at = Utc::now();
        info!(job_id = %job_id, repository = %slug, "Analysis job started");
        self.publish_progress(job, 0, "fetching");

        // Fetch
        let kinds = self.required_kinds(&job.analyzers);
        let since = if job.incremental {
            repository.last_synced_at
        } else {
            None
        };
        let fetcher = &self.inner.fetcher;
        let results = join_all(kinds.iter().map(|&kind| async move {
            let cursor = FetchCursor::since(since.filter(|_| kind.supports_since()));
            let result = fetcher
                .fetch_all(&repository.owner, &repository.name, kind, cursor, cancel)
                .await;
            (kind, result)
        }))
        .await;

        let mut records: Vec<RawRecord> = Vec::new();
        let mut degraded: BTreeSet<ResourceKind> = BTreeSet::new();
        for (kind, result) in results {
            match result {
                Ok(fetched) => records.extend(fetched),
                Err(FetchError::Cancelled) => {}
                Err(e) => {
                    warn!(job_id = %job_id, kind = %kind, error = %e, "Resource kind degraded");
                    degraded.insert(kind);
                }
            }
        }

        if cancel.is_cancelled() {
            return self.conclude(job, JobState::Cancelled, degraded, Vec::new(), 0, None).await;
        }

        if !kinds.is_empty() && degraded.len() == kinds.len() {
            let message = "fetch failed for every resource kind".to_string();
            return self
                .conclude(job, JobState::Failed, degraded, Vec::new(), 0, Some(message))
                .await;
        }

        // Normalize
        let dataset = Arc::new(normalize(repository.repository_id, &slug, records, degraded.clone()));
        let mut tracker = ProgressTracker::new(self.inner.fetch_slice_percent, job.analyzers.len());
        let percent = tracker.fetch_done();
        db::jobs::update_progress(&self.inner.db, job_id, percent).await?;
        self.publish_progress(job, percent, "analyzing");
        debug!(job_id = %job_id, records = dataset.len(), "Dataset normalized");

        // Analyze
        let sink = JobSink {
            orchestrator: self,
            job,
            tracker: Mutex::new(tracker),
        };
        let ctx = AnalysisContext::new(repository.repository_id, job_id);
        let outcome = match self
            .inner
            .pipeline
            .run(ctx, dataset, &job.analyzers, cancel, &sink)
            .await
        {
            Ok(outcome) => outcome,
            Err(PipelineError::Persistence { analyzer, source }) => {
                let message = format!("persisting {} insights failed: {}", analyzer, source);
                return self
                    .conclude(job, JobState::Failed, degraded, Vec::new(), 0, Some(message))
                    .await;
            }
        };

        let insight_count = outcome.insight_count();
        let (state, message) = if cancel.is_cancelled() {
            (JobState::Cancelled, None)
        } else if outcome.all_failed() {
            (JobState::Failed, Some("every requested analyzer failed".to_string()))
        } else {
            (JobState::Completed, None)
        };

        // Watermark moves before the job is seen as finished
        if state == JobState::Completed && degraded.is_empty() {
            db::repositories::advance_watermark(&self.inner.db, repository.repository_id, started_at)
                .await?;
        }
        self.conclude(job, state, degraded, outcome.failed, insight_count, message)
            .await
    }

    /// Best effort: a job whose run errored must not stay active
    ///
    /// A running job is failed. A job that never left `QUEUED` has no edge to
    /// `FAILED` and is cancelled instead, with the cause in its detail.
    async fn fail_aborted(&self, job: &AnalysisJob, cause: &OrchestratorError) {
        let detail = JobErrorDetail {
            message: format!("job aborted: {}", cause),
            ..Default::default()
        };
        let db = &self.inner.db;

        let settled = match db::jobs::transition_from(
            db,
            job.job_id,
            &[JobState::InProgress],
            JobState::Failed,
            Some(&detail),
        )
        .await
        {
            Ok(true) => Ok(Some(JobState::Failed)),
            Ok(false) => db::jobs::transition_from(
                db,
                job.job_id,
                &[JobState::Queued],
                JobState::Cancelled,
                Some(&detail),
            )
            .await
            .map(|moved| moved.then_some(JobState::Cancelled)),
            Err(e) => Err(e),
        };

        match settled {
            Ok(Some(state)) => {
                warn!(job_id = %job.job_id, state = %state, detail = %detail.message, "Aborted job settled");
                self.finalize(job, state, &detail, 0).await;
            }
            Ok(None) => debug!(job_id = %job.job_id, "Aborted job already terminal"),
            Err(e) => error!(
                job_id = %job.job_id,
                error = %e,
                "Could not settle aborted job; it stays active until restart"
            ),
        }
    }

    /// Record the terminal state, then invalidate, mirror and broadcast
    async fn conclude(
        &self,
        job: &AnalysisJob,
        state: JobState,
        degraded: BTreeSet<ResourceKind>,
        failed_analyzers: Vec<AnalyzerFailure>,
        insight_count: usize,
        message: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let degraded_kinds: Vec<ResourceKind> = degraded.into_iter().collect();
        let summary = JobErrorDetail::summarize(&degraded_kinds, &failed_analyzers);
        let message = match (message, summary.is_empty()) {
            (Some(m), true) => m,
            (Some(m), false) => format!("{}; {}", m, summary),
            (None, _) => summary,
        };
        let detail = JobErrorDetail {
            message,
            degraded_kinds,
            failed_analyzers,
        };

        if !db::jobs::transition(&self.inner.db, job.job_id, state, Some(&detail)).await? {
            warn!(job_id = %job.job_id, state = %state, "Job already left IN_PROGRESS, not finalized");
            return Ok(());
        }

        match state {
            JobState::Failed => {
                warn!(job_id = %job.job_id, detail = %detail.message, "Analysis job failed")
            }
            _ => info!(
                job_id = %job.job_id,
                state = %state,
                insights = insight_count,
                degraded = ?detail.degraded_kinds,
                "Analysis job finished"
            ),
        }

        self.finalize(job, state, &detail, insight_count).await;
        Ok(())
    }

    /// Post-transition side effects, in delivery order
    async fn finalize(
        &self,
        job: &AnalysisJob,
        state: JobState,
        detail: &JobErrorDetail,
        insight_count: usize,
    ) {
        let removed = self.inner.cache.invalidate_repository(job.repository_id).await;
        debug!(job_id = %job.job_id, removed, "Repository cache invalidated");

        let Some(event) = terminal_event(job, state, detail, insight_count) else {
            return;
        };
        self.mirror(&event).await;
        self.inner.broadcaster.publish(&event);
    }

    /// Copy an event to its queue topic; failures are logged, not fatal
    async fn mirror(&self, event: &AnalysisEvent) {
        if let Some(topic) = event.queue_topic() {
            if let Err(e) = db::queue::publish_event(&self.inner.db, topic, event).await {
                error!(topic, job_id = %event.job_id(), error = %e, "Queue mirror failed");
            }
        }
    }

    fn publish_progress(&self, job: &AnalysisJob, percent: u8, stage: &str) {
        self.inner.broadcaster.publish(&AnalysisEvent::JobProgress {
            job_id: job.job_id,
            repository_id: job.repository_id,
            progress_percent: percent,
            stage: stage.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Union of what the requested analyzers read
    fn required_kinds(&self, analyzers: &[AnalyzerKind]) -> Vec<ResourceKind> {
        let registry = self.inner.pipeline.registry();
        let kinds: BTreeSet<ResourceKind> = analyzers
            .iter()
            .filter_map(|&a| registry.get(a))
            .flat_map(|a| a.requires().iter().copied())
            .collect();
        kinds.into_iter().collect()
    }
}

fn terminal_event(
    job: &AnalysisJob,
    state: JobState,
    detail: &JobErrorDetail,
    insight_count: usize,
) -> Option<AnalysisEvent> {
    let degraded_kinds = detail
        .degraded_kinds
        .iter()
        .map(|k| k.as_str().to_string())
        .collect();
    let failed_analyzers = detail
        .failed_analyzers
        .iter()
        .map(|f| f.analyzer.as_str().to_string())
        .collect();
    let timestamp = Utc::now();

    match state {
        JobState::Completed => Some(AnalysisEvent::JobCompleted {
            job_id: job.job_id,
            repository_id: job.repository_id,
            insight_count,
            degraded_kinds,
            failed_analyzers,
            timestamp,
        }),
        JobState::Failed => Some(AnalysisEvent::JobFailed {
            job_id: job.job_id,
            repository_id: job.repository_id,
            error: detail.message.clone(),
            degraded_kinds,
            failed_analyzers,
            timestamp,
        }),
        JobState::Cancelled => Some(AnalysisEvent::JobCancelled {
            job_id: job.job_id,
            repository_id: job.repository_id,
            timestamp,
        }),
        JobState::Queued | JobState::InProgress => None,
    }
}

/// Persists insights and reports per-analyzer progress for one job
struct JobSink<'a> {
    orchestrator: &'a Orchestrator,
    job: &'a AnalysisJob,
    tracker: Mutex<ProgressTracker>,
}

#[async_trait]
impl PipelineSink for JobSink<'_> {
    async fn persist(
        &self,
        _analyzer: AnalyzerKind,
        insights: &[Insight],
    ) -> Result<(), repolens_common::Error> {
        db::insights::insert_insights(&self.orchestrator.inner.db, insights).await
    }

    async fn analyzer_finished(&self, report: &AnalyzerReport) {
        let job = self.job;
        let timestamp = Utc::now();
        let event = match &report.result {
            Ok(insight_count) => AnalysisEvent::AnalyzerCompleted {
                job_id: job.job_id,
                repository_id: job.repository_id,
                analyzer: report.analyzer.as_str().to_string(),
                insight_count: *insight_count,
                timestamp,
            },
            Err(e) => AnalysisEvent::AnalyzerFailed {
                job_id: job.job_id,
                repository_id: job.repository_id,
                analyzer: report.analyzer.as_str().to_string(),
                error: e.to_string(),
                timestamp,
            },
        };
        self.orchestrator.mirror(&event).await;
        self.orchestrator.inner.broadcaster.publish(&event);

        let percent = match self.tracker.lock() {
            Ok(mut tracker) => tracker.analyzer_done(),
            Err(poisoned) => poisoned.into_inner().analyzer_done(),
        };
        if let Err(e) = db::jobs::update_progress(&self.orchestrator.inner.db, job.job_id, percent).await {
            warn!(job_id = %job.job_id, error = %e, "Progress update failed");
        }
        self.orchestrator.publish_progress(job, percent, "analyzing");
    }
}
