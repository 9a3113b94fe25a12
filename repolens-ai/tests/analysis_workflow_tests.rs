//! End-to-end analysis runs against a scripted GitHub
//!
//! Drives the orchestrator directly: fetch → normalize → analyzers →
//! persistence → cache invalidation → events and queue topics.

mod helpers;

use helpers::*;
use repolens_ai::db;
use repolens_ai::models::{AnalyzerKind, InsightFilter, JobState, ResourceKind};
use repolens_ai::services::{OrchestratorError, TriggerRequest};
use repolens_common::events::{
    AnalysisEvent, Channel, TOPIC_ANALYSIS_COMPLETED, TOPIC_INSIGHTS_GENERATED,
};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn only(analyzer: AnalyzerKind) -> TriggerRequest {
    TriggerRequest {
        analyzers: Some(vec![analyzer]),
        incremental: false,
    }
}

async fn widgets(state: &repolens_ai::AppState) -> Uuid {
    let (repo, created) = db::repositories::upsert_repository(&state.db, "acme", "widgets", None)
        .await
        .unwrap();
    assert!(created);
    repo.repository_id
}

#[tokio::test]
async fn test_full_run_produces_insights_from_every_analyzer() {
    let state = create_test_state(FixtureApi::new()).await;
    let repository_id = widgets(&state).await;

    let job = run_to_completion(&state, repository_id, TriggerRequest::default()).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error_detail);
    assert_eq!(job.analyzers.len(), 5);
    assert_eq!(job.progress_percent, 100);
    assert!(job.error_detail.is_none());
    assert!(job.started_at.is_some() && job.completed_at.is_some());

    let insights = db::insights::query_insights(&state.db, repository_id, &InsightFilter::default())
        .await
        .unwrap();
    let analyzers: BTreeSet<AnalyzerKind> = insights.iter().map(|i| i.analyzer).collect();
    assert_eq!(analyzers, AnalyzerKind::ALL.into_iter().collect());
    assert!(insights.iter().all(|i| i.job_id == job.job_id));
    assert!(insights.windows(2).all(|w| w[0].confidence >= w[1].confidence));

    // The open XSS report is flagged
    let security = insights
        .iter()
        .find(|i| i.payload["metric"] == "security_reports")
        .unwrap();
    assert_eq!(security.payload["open_reports"], serde_json::json!([2]));
    assert!(security.tags.contains(&"needs-attention".to_string()));

    // A clean run advances the incremental watermark
    let repo = db::repositories::load_repository(&state.db, repository_id)
        .await
        .unwrap()
        .unwrap();
    let watermark = repo.last_synced_at.expect("watermark set");
    assert!(watermark <= job.completed_at.unwrap());
    assert_eq!(repo.current_job_id, Some(job.job_id));
}

#[tokio::test]
async fn test_completion_mirrored_to_queue_topics() {
    let state = create_test_state(FixtureApi::new()).await;
    let repository_id = widgets(&state).await;

    let job = run_to_completion(&state, repository_id, TriggerRequest::default()).await;

    let completed = db::queue::read_topic(&state.db, TOPIC_ANALYSIS_COMPLETED, 0, 10)
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].payload["type"], "JobCompleted");
    assert_eq!(completed[0].payload["job_id"], job.job_id.to_string());

    // One insights.generated message per analyzer that produced output
    let generated = db::queue::read_topic(&state.db, TOPIC_INSIGHTS_GENERATED, 0, 10)
        .await
        .unwrap();
    assert_eq!(generated.len(), 5);
}

#[tokio::test]
async fn test_degraded_issues_still_completes() {
    let state = create_test_state(FixtureApi::new().failing(ResourceKind::Issues)).await;
    let repository_id = widgets(&state).await;

    let job = run_to_completion(&state, repository_id, TriggerRequest::default()).await;

    assert_eq!(job.state, JobState::Completed);
    let detail = job.error_detail.expect("degraded kinds are reported");
    assert_eq!(detail.degraded_kinds, vec![ResourceKind::Issues]);

    // Security still reads pull requests, commits and languages
    let security = db::insights::query_insights(
        &state.db,
        repository_id,
        &InsightFilter {
            analyzer: Some(AnalyzerKind::Security),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let reports = security
        .iter()
        .find(|i| i.payload["metric"] == "security_reports")
        .unwrap();
    assert_eq!(reports.payload["partial"], true);

    // Partial data must not move the watermark
    let repo = db::repositories::load_repository(&state.db, repository_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(repo.last_synced_at, None);
}

#[tokio::test]
async fn test_every_kind_failing_fails_the_job() {
    let mut api = FixtureApi::new();
    for kind in ResourceKind::ALL {
        api = api.failing(kind);
    }
    let state = create_test_state(api).await;
    let repository_id = widgets(&state).await;

    let job = run_to_completion(&state, repository_id, TriggerRequest::default()).await;
    assert_eq!(job.state, JobState::Failed);
    let detail = job.error_detail.unwrap();
    assert!(detail.message.contains("fetch failed"));

    let failed = db::queue::read_topic(&state.db, repolens_common::events::TOPIC_ANALYSIS_FAILED, 0, 10)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn test_second_trigger_conflicts_while_active() {
    let state =
        create_test_state(FixtureApi::new().with_delay(Duration::from_millis(200))).await;
    let repository_id = widgets(&state).await;
    let mut sub = state.broadcaster.subscribe(Channel::Repository(repository_id));

    let first = state
        .orchestrator
        .trigger(repository_id, TriggerRequest::default())
        .await
        .unwrap();

    match state
        .orchestrator
        .trigger(repository_id, TriggerRequest::default())
        .await
    {
        Err(OrchestratorError::JobConflict { active_job_id, .. }) => {
            assert_eq!(active_job_id, Some(first.job_id));
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    // Once the first finishes the repository accepts a new job
    await_terminal_event(&mut sub, first.job_id).await;
    let third = run_to_completion(&state, repository_id, TriggerRequest::default()).await;
    assert_eq!(third.state, JobState::Completed);
}

#[tokio::test]
async fn test_rerun_supersedes_previous_insights() {
    let state = create_test_state(FixtureApi::new()).await;
    let repository_id = widgets(&state).await;

    run_to_completion(&state, repository_id, only(AnalyzerKind::Contributor)).await;
    let second = run_to_completion(&state, repository_id, only(AnalyzerKind::Contributor)).await;

    let current = db::insights::query_insights(&state.db, repository_id, &InsightFilter::default())
        .await
        .unwrap();
    assert!(!current.is_empty());
    assert!(current.iter().all(|i| i.job_id == second.job_id));

    let all = db::insights::query_insights(
        &state.db,
        repository_id,
        &InsightFilter {
            include_superseded: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(all.len(), current.len() * 2);
}

#[tokio::test]
async fn test_api_called_once_per_required_kind() {
    let api = Arc::new(FixtureApi::new());
    let state = create_shared_state(Arc::clone(&api)).await;
    let repository_id = widgets(&state).await;

    let job = run_to_completion(&state, repository_id, only(AnalyzerKind::Sentiment)).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.analyzers, vec![AnalyzerKind::Sentiment]);

    // Sentiment reads issues and pull requests; one page each
    assert_eq!(api.calls.load(Ordering::SeqCst), 2);

    let insights = db::insights::query_insights(&state.db, repository_id, &InsightFilter::default())
        .await
        .unwrap();
    assert!(insights.iter().all(|i| i.analyzer == AnalyzerKind::Sentiment));
}

#[tokio::test]
async fn test_subscriber_sees_progress_then_completion() {
    let state = create_test_state(FixtureApi::new()).await;
    let repository_id = widgets(&state).await;
    let mut sub = state.broadcaster.subscribe(Channel::Repository(repository_id));

    let job = state
        .orchestrator
        .trigger(repository_id, TriggerRequest::default())
        .await
        .unwrap();

    let mut last_progress = 0;
    let mut analyzers_done = 0;
    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match sub.recv().await.expect("broadcaster closed") {
                AnalysisEvent::JobProgress { progress_percent, .. } => {
                    assert!(progress_percent >= last_progress, "progress went backwards");
                    last_progress = progress_percent;
                }
                AnalysisEvent::AnalyzerCompleted { .. } => analyzers_done += 1,
                event @ AnalysisEvent::JobCompleted { .. } => return event,
                AnalysisEvent::JobFailed { error, .. } => panic!("job failed: {}", error),
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(completed.job_id(), job.job_id);
    assert_eq!(analyzers_done, 5);
    assert_eq!(last_progress, 100);
}

#[tokio::test]
async fn test_completion_drops_cached_reads() {
    let state = create_test_state(FixtureApi::new()).await;
    let repository_id = widgets(&state).await;

    let key = repolens_ai::services::cache::summary_key(repository_id);
    state
        .cache
        .set(key.clone(), serde_json::json!({"stale": true}), Duration::from_secs(60))
        .await;

    run_to_completion(&state, repository_id, only(AnalyzerKind::Trend)).await;
    assert!(state.cache.get(&key).await.is_none());
}
