//! Integration tests for repolens-ai HTTP endpoints

mod helpers;

use axum::http::StatusCode;
use futures::future::join_all;
use helpers::*;
use repolens_common::events::Channel;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _state) = create_test_app(FixtureApi::new()).await;

    let (status, _, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "repolens-ai");
    assert_eq!(body["active_jobs"], 0);
    assert!(body["cache"]["entries"].is_number());
}

#[tokio::test]
async fn test_register_repository_is_idempotent() {
    let (app, _state) = create_test_app(FixtureApi::new()).await;

    let id = register(&app, "acme", "widgets").await;

    let (status, _, body) = send(
        &app,
        "POST",
        "/repositories",
        Some(json!({"owner": "acme", "name": "widgets"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["repository_id"], id.to_string());

    let (status, _, body) = send(&app, "GET", "/repositories", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_register_rejects_bad_slug() {
    let (app, _state) = create_test_app(FixtureApi::new()).await;

    let (status, _, body) = send(
        &app,
        "POST",
        "/repositories",
        Some(json!({"owner": "acme", "name": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_unknown_repository_is_404() {
    let (app, _state) = create_test_app(FixtureApi::new()).await;
    let missing = Uuid::new_v4();

    for uri in [
        format!("/repositories/{}", missing),
        format!("/repositories/{}/insights", missing),
        format!("/repositories/{}/summary", missing),
        format!("/repositories/{}/jobs", missing),
    ] {
        let (status, _, body) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    let (status, _, _) = send(
        &app,
        "POST",
        &format!("/repositories/{}/analyze", missing),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_analyze_then_read_insights_through_cache() {
    let (app, state) = create_test_app(FixtureApi::new()).await;
    let id = register(&app, "acme", "widgets").await;
    let mut sub = state.broadcaster.subscribe(Channel::Repository(id));

    let (status, _, body) = send(&app, "POST", &format!("/repositories/{}/analyze", id), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["state"], "QUEUED");
    let job_id: Uuid = body["job_id"].as_str().unwrap().parse().unwrap();
    await_terminal_event(&mut sub, job_id).await;

    let (status, _, job) = send(&app, "GET", &format!("/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "COMPLETED");
    assert_eq!(job["progress_percent"], 100);

    let uri = format!("/repositories/{}/insights", id);
    let (status, cache, first) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("miss"));
    let insights = first.as_array().unwrap();
    assert!(!insights.is_empty());
    let confidences: Vec<f64> = insights
        .iter()
        .map(|i| i["confidence"].as_f64().unwrap())
        .collect();
    assert!(confidences.windows(2).all(|w| w[0] >= w[1]));

    let (_, cache, second) = send(&app, "GET", &uri, None).await;
    assert_eq!(cache.as_deref(), Some("hit"));
    assert_eq!(first, second);

    // Filters form their own cache entries
    let (status, cache, security) = send(
        &app,
        "GET",
        &format!("{}?analyzer=security&tag=needs-attention", uri),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("miss"));
    let security = security.as_array().unwrap();
    assert_eq!(security.len(), 1);
    assert_eq!(security[0]["analyzer"], "security");

    let (status, _, summary) = send(&app, "GET", &format!("/repositories/{}/summary", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["insight_count"].as_u64().unwrap() as usize, insights.len());
    assert!(summary["needs_attention"].as_i64().unwrap() >= 1);

    let (status, _, detail) = send(&app, "GET", &format!("/repositories/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(detail["active_job"].is_null());
    assert!(detail["last_insight_at"].is_string());
    assert!(detail["last_synced_at"].is_string());
}

#[tokio::test]
async fn test_new_job_invalidates_cached_insights() {
    let (app, state) = create_test_app(FixtureApi::new()).await;
    let id = register(&app, "acme", "widgets").await;
    let mut sub = state.broadcaster.subscribe(Channel::Repository(id));

    let analyze = format!("/repositories/{}/analyze", id);
    let body = json!({"analyzers": ["contributor"]});
    let (_, _, queued) = send(&app, "POST", &analyze, Some(body.clone())).await;
    await_terminal_event(&mut sub, queued["job_id"].as_str().unwrap().parse().unwrap()).await;

    let uri = format!("/repositories/{}/insights", id);
    let (_, cache, _) = send(&app, "GET", &uri, None).await;
    assert_eq!(cache.as_deref(), Some("miss"));
    let (_, cache, before) = send(&app, "GET", &uri, None).await;
    assert_eq!(cache.as_deref(), Some("hit"));

    let (_, _, queued) = send(&app, "POST", &analyze, Some(body)).await;
    let second_job = queued["job_id"].as_str().unwrap().to_string();
    await_terminal_event(&mut sub, second_job.parse().unwrap()).await;

    let (_, cache, after) = send(&app, "GET", &uri, None).await;
    assert_eq!(cache.as_deref(), Some("miss"));
    assert_ne!(before, after);
    assert!(after
        .as_array()
        .unwrap()
        .iter()
        .all(|i| i["job_id"] == second_job.as_str()));
}

#[tokio::test]
async fn test_concurrent_analyze_returns_409() {
    let (app, state) = create_test_app(FixtureApi::new().with_delay(Duration::from_millis(200))).await;
    let id = register(&app, "acme", "widgets").await;
    let mut sub = state.broadcaster.subscribe(Channel::Repository(id));
    let analyze = format!("/repositories/{}/analyze", id);

    let (status, _, first) = send(&app, "POST", &analyze, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, body) = send(&app, "POST", &analyze, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "ALREADY_IN_PROGRESS");

    let (_, _, detail) = send(&app, "GET", &format!("/repositories/{}", id), None).await;
    assert_eq!(detail["active_job"]["job_id"], first["job_id"]);

    await_terminal_event(&mut sub, first["job_id"].as_str().unwrap().parse().unwrap()).await;
    let (status, _, _) = send(&app, "POST", &analyze, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_analyze_admits_exactly_one() {
    let (app, state) = create_test_app(FixtureApi::new().with_delay(Duration::from_millis(100))).await;
    let id = register(&app, "acme", "widgets").await;
    let mut sub = state.broadcaster.subscribe(Channel::Repository(id));
    let analyze = format!("/repositories/{}/analyze", id);

    let responses = join_all((0..8).map(|_| {
        let app = app.clone();
        let analyze = analyze.clone();
        tokio::spawn(async move { send(&app, "POST", &analyze, None).await })
    }))
    .await;

    let mut accepted = Vec::new();
    let mut conflicts = 0;
    for response in responses {
        let (status, _, body) = response.unwrap();
        match status {
            StatusCode::ACCEPTED => accepted.push(body),
            StatusCode::CONFLICT => {
                assert_eq!(body["error"]["code"], "ALREADY_IN_PROGRESS");
                conflicts += 1;
            }
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(accepted.len(), 1);
    assert_eq!(conflicts, 7);

    let (_, _, jobs) = send(&app, "GET", &format!("/repositories/{}/jobs", id), None).await;
    assert_eq!(jobs.as_array().unwrap().len(), 1);

    await_terminal_event(&mut sub, accepted[0]["job_id"].as_str().unwrap().parse().unwrap()).await;
}

#[tokio::test]
async fn test_analyze_rejects_unknown_analyzer() {
    let (app, _state) = create_test_app(FixtureApi::new()).await;
    let id = register(&app, "acme", "widgets").await;

    let (status, _, body) = send(
        &app,
        "POST",
        &format!("/repositories/{}/analyze", id),
        Some(json!({"analyzers": ["astrology"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (_, _, jobs) = send(&app, "GET", &format!("/repositories/{}/jobs", id), None).await;
    assert!(jobs.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_insight_query_validation() {
    let (app, _state) = create_test_app(FixtureApi::new()).await;
    let id = register(&app, "acme", "widgets").await;

    let (status, _, _) = send(
        &app,
        "GET",
        &format!("/repositories/{}/insights?min_confidence=2", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(
        &app,
        "GET",
        &format!("/repositories/{}/insights?analyzer=trend", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_finished_job_conflicts() {
    let (app, state) = create_test_app(FixtureApi::new()).await;
    let id = register(&app, "acme", "widgets").await;
    let mut sub = state.broadcaster.subscribe(Channel::Repository(id));

    let (_, _, queued) = send(&app, "POST", &format!("/repositories/{}/analyze", id), None).await;
    let job_id = queued["job_id"].as_str().unwrap().to_string();
    await_terminal_event(&mut sub, job_id.parse().unwrap()).await;

    let (status, _, body) = send(&app, "POST", &format!("/jobs/{}/cancel", job_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");

    let (status, _, _) = send(&app, "POST", &format!("/jobs/{}/cancel", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_leaderboard_ranks_repositories() {
    let (app, state) = create_test_app(FixtureApi::new()).await;
    let widgets = register(&app, "acme", "widgets").await;
    let gadgets = register(&app, "acme", "gadgets").await;

    for (id, body) in [
        (widgets, json!({"analyzers": ["security"]})),
        (gadgets, json!({"analyzers": ["trend"]})),
    ] {
        let mut sub = state.broadcaster.subscribe(Channel::Repository(id));
        let (_, _, queued) =
            send(&app, "POST", &format!("/repositories/{}/analyze", id), Some(body)).await;
        await_terminal_event(&mut sub, queued["job_id"].as_str().unwrap().parse().unwrap()).await;
    }

    let (status, cache, board) = send(&app, "GET", "/leaderboard", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("miss"));
    let board = board.as_array().unwrap();
    assert_eq!(board.len(), 2);
    // Fewer items needing attention ranks first
    assert_eq!(board[0]["repository"], "acme/gadgets");
    assert_eq!(board[1]["repository"], "acme/widgets");

    let (_, cache, _) = send(&app, "GET", "/leaderboard", None).await;
    assert_eq!(cache.as_deref(), Some("hit"));

    // A job for any ranked repository drops the entry
    let mut sub = state.broadcaster.subscribe(Channel::Repository(gadgets));
    let (_, _, queued) = send(
        &app,
        "POST",
        &format!("/repositories/{}/analyze", gadgets),
        Some(json!({"analyzers": ["trend"]})),
    )
    .await;
    await_terminal_event(&mut sub, queued["job_id"].as_str().unwrap().parse().unwrap()).await;

    let (_, cache, _) = send(&app, "GET", "/leaderboard", None).await;
    assert_eq!(cache.as_deref(), Some("miss"));
}

#[tokio::test]
async fn test_leaderboard_dropped_when_unranked_repository_finishes() {
    let (app, state) = create_test_app(FixtureApi::new()).await;
    let widgets = register(&app, "acme", "widgets").await;

    let mut sub = state.broadcaster.subscribe(Channel::Repository(widgets));
    let (_, _, queued) = send(&app, "POST", &format!("/repositories/{}/analyze", widgets), None).await;
    await_terminal_event(&mut sub, queued["job_id"].as_str().unwrap().parse().unwrap()).await;

    let (_, cache, board) = send(&app, "GET", "/leaderboard", None).await;
    assert_eq!(cache.as_deref(), Some("miss"));
    assert_eq!(board.as_array().unwrap().len(), 1);
    let (_, cache, _) = send(&app, "GET", "/leaderboard", None).await;
    assert_eq!(cache.as_deref(), Some("hit"));

    // gadgets is not on the cached board yet
    let gadgets = register(&app, "acme", "gadgets").await;
    let mut sub = state.broadcaster.subscribe(Channel::Repository(gadgets));
    let (_, _, queued) = send(&app, "POST", &format!("/repositories/{}/analyze", gadgets), None).await;
    await_terminal_event(&mut sub, queued["job_id"].as_str().unwrap().parse().unwrap()).await;

    let (_, cache, board) = send(&app, "GET", "/leaderboard", None).await;
    assert_eq!(cache.as_deref(), Some("miss"));
    let ranked: Vec<&str> = board
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["repository"].as_str().unwrap())
        .collect();
    assert_eq!(ranked.len(), 2);
    assert!(ranked.contains(&"acme/gadgets"));
}

#[tokio::test]
async fn test_queue_topic_polling() {
    let (app, state) = create_test_app(FixtureApi::new()).await;
    let id = register(&app, "acme", "widgets").await;
    let mut sub = state.broadcaster.subscribe(Channel::Repository(id));

    let (_, _, queued) = send(&app, "POST", &format!("/repositories/{}/analyze", id), None).await;
    await_terminal_event(&mut sub, queued["job_id"].as_str().unwrap().parse().unwrap()).await;

    let (status, _, page) = send(&app, "GET", "/queue/analysis.completed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["topic"], "analysis.completed");
    let messages = page["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["payload"]["job_id"], queued["job_id"]);

    let next = page["next_after"].as_i64().unwrap();
    let (_, _, empty) = send(&app, "GET", &format!("/queue/analysis.completed?after={}", next), None).await;
    assert!(empty["messages"].as_array().unwrap().is_empty());
    assert_eq!(empty["next_after"], next);

    let (status, _, _) = send(&app, "GET", "/queue/not.a.topic", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
