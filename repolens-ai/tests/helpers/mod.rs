//! Test Helper Utilities
//!
//! Shared fixtures for repolens-ai integration tests: a source API that
//! serves realistic GitHub payloads, app construction and job polling.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use repolens_ai::config::ServiceConfig;
use repolens_ai::models::{AnalysisJob, RawRecord, ResourceKind};
use repolens_ai::services::{Page, PageRequest, SourceApi, TransportError, TriggerRequest};
use repolens_ai::AppState;
use repolens_common::events::{AnalysisEvent, Channel, Subscription};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;
use uuid::Uuid;

/// Serves one page per resource kind built from [`fixture_payloads`]
pub struct FixtureApi {
    payloads: HashMap<ResourceKind, Vec<Value>>,
    failing: HashMap<ResourceKind, TransportError>,
    delay: Duration,
    pub calls: AtomicU32,
}

impl FixtureApi {
    pub fn new() -> Self {
        Self {
            payloads: fixture_payloads(),
            failing: HashMap::new(),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    /// Every request for `kind` fails with a non-retryable 404
    pub fn failing(mut self, kind: ResourceKind) -> Self {
        self.failing.insert(
            kind,
            TransportError::Client {
                status: 404,
                message: "Not Found".to_string(),
            },
        );
        self
    }

    /// Sleep before answering each page, keeping jobs active for a while
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SourceApi for FixtureApi {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(err) = self.failing.get(&request.kind) {
            return Err(err.clone());
        }

        let records = self
            .payloads
            .get(&request.kind)
            .map(|payloads| {
                payloads
                    .iter()
                    .map(|payload| RawRecord {
                        kind: request.kind,
                        source_timestamp: None,
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Page {
            records,
            next_cursor: None,
            quota: Default::default(),
        })
    }
}

fn days_ago(days: i64) -> String {
    (Utc::now() - ChronoDuration::days(days)).to_rfc3339()
}

/// GitHub-shaped payloads for `acme/widgets`
///
/// Two committers, an open security report, a crash report and a merged
/// security fix, so every built-in analyzer has something to say.
pub fn fixture_payloads() -> HashMap<ResourceKind, Vec<Value>> {
    let commit = |sha: &str, login: &str, name: &str, message: &str, age: i64| {
        json!({
            "sha": sha,
            "commit": {
                "author": {"name": name, "date": days_ago(age)},
                "message": message
            },
            "author": {"login": login}
        })
    };

    let mut payloads = HashMap::new();
    payloads.insert(
        ResourceKind::Commits,
        vec![
            commit("a1", "ada", "Ada", "feat: add widget parser\n\nHandles nested widgets.", 1),
            commit("a2", "ada", "Ada", "fix: buffer overflow in reader", 2),
            commit("a3", "bob", "Bob", "docs: describe configuration", 3),
            commit("a4", "ada", "Ada", "wip", 5),
            commit("a5", "ada", "Ada", "refactor: split render module", 9),
            commit("a6", "bob", "Bob", "test: cover empty widgets", 12),
        ],
    );
    payloads.insert(
        ResourceKind::Issues,
        vec![
            json!({
                "number": 1, "title": "Crash on start", "body": "The app crashes and is broken",
                "state": "open", "user": {"login": "carol"}, "labels": [{"name": "bug"}],
                "comments": 4, "created_at": days_ago(6)
            }),
            json!({
                "number": 2, "title": "XSS in widget titles", "body": null,
                "state": "open", "user": {"login": "dave"}, "labels": [{"name": "security"}],
                "comments": 1, "created_at": days_ago(4)
            }),
            json!({
                "number": 3, "title": "Thanks, the new parser works great", "body": "",
                "state": "closed", "user": {"login": "erin"}, "labels": [],
                "comments": 0, "created_at": days_ago(20), "closed_at": days_ago(19)
            }),
        ],
    );
    payloads.insert(
        ResourceKind::PullRequests,
        vec![
            json!({
                "number": 10, "title": "Fix overflow in reader", "body": "Nice catch, fixed",
                "state": "closed", "user": {"login": "ada"}, "draft": false,
                "created_at": days_ago(3), "closed_at": days_ago(2), "merged_at": days_ago(2)
            }),
            json!({
                "number": 11, "title": "Improve docs", "body": "Clean up the readme",
                "state": "open", "user": {"login": "bob"}, "draft": true,
                "created_at": days_ago(1)
            }),
        ],
    );
    payloads.insert(
        ResourceKind::Contributors,
        vec![
            json!({"login": "ada", "contributions": 40}),
            json!({"login": "bob", "contributions": 12}),
        ],
    );
    payloads.insert(
        ResourceKind::Releases,
        vec![
            json!({"tag_name": "v1.1.0", "name": "Widgets 1.1", "prerelease": false,
                   "published_at": days_ago(10)}),
            json!({"tag_name": "v1.0.0", "name": null, "prerelease": false,
                   "published_at": days_ago(40)}),
        ],
    );
    payloads.insert(
        ResourceKind::Languages,
        vec![json!({"Rust": 90_000, "C": 10_000})],
    );
    payloads
}

/// App state over an in-memory database
pub async fn create_test_state(api: FixtureApi) -> AppState {
    create_shared_state(Arc::new(api)).await
}

/// Like [`create_test_state`], keeping a handle on the API for call counts
pub async fn create_shared_state(api: Arc<FixtureApi>) -> AppState {
    let pool = repolens_ai::db::init_memory_pool()
        .await
        .expect("Failed to create in-memory database");
    AppState::new(pool, ServiceConfig::default(), api)
}

pub async fn create_test_app(api: FixtureApi) -> (Router, AppState) {
    let state = create_test_state(api).await;
    (repolens_ai::build_router(state.clone()), state)
}

/// Send one request; returns status, `x-cache` header and JSON body
pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Option<String>, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let cache = response
        .headers()
        .get("x-cache")
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, cache, json)
}

/// Register `owner/name` through the API and return its id
pub async fn register(app: &Router, owner: &str, name: &str) -> Uuid {
    let (status, _, body) = send(
        app,
        "POST",
        "/repositories",
        Some(json!({"owner": owner, "name": name})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);
    body["repository_id"].as_str().unwrap().parse().unwrap()
}

/// Poll until the job reaches a terminal state
pub async fn wait_for_terminal(state: &AppState, job_id: Uuid) -> AnalysisJob {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let job = state.orchestrator.job_status(job_id).await.unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

/// Wait for the terminal event of `job_id` on `sub`
pub async fn await_terminal_event(sub: &mut Subscription, job_id: Uuid) -> AnalysisEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = sub.recv().await.expect("broadcaster closed");
            let terminal = matches!(
                event,
                AnalysisEvent::JobCompleted { .. }
                    | AnalysisEvent::JobFailed { .. }
                    | AnalysisEvent::JobCancelled { .. }
            );
            if terminal && event.job_id() == job_id {
                return event;
            }
        }
    })
    .await
    .expect("no terminal event in time")
}

/// Trigger a job and return it once fully finalized
///
/// The terminal event goes out after cache invalidation and the queue
/// mirror, so everything a job writes is visible on return.
pub async fn run_to_completion(
    state: &AppState,
    repository_id: Uuid,
    request: TriggerRequest,
) -> AnalysisJob {
    let mut sub = state
        .broadcaster
        .subscribe(Channel::Repository(repository_id));
    let job = state
        .orchestrator
        .trigger(repository_id, request)
        .await
        .unwrap();
    await_terminal_event(&mut sub, job.job_id).await;
    state.orchestrator.job_status(job.job_id).await.unwrap()
}
