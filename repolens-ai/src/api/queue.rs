//! Durable queue topic polling
//!
//! GET /queue/:topic?after=<seq>&limit=<n>

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use repolens_common::events::QUEUE_TOPICS;
use serde::{Deserialize, Serialize};

use super::page_limit;
use crate::db;
use crate::db::queue::QueueMessage;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TopicQuery {
    /// Sequence number of the last message already consumed
    #[serde(default)]
    pub after: i64,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct TopicPage {
    pub topic: String,
    pub messages: Vec<QueueMessage>,
    /// Pass as `after` to continue; unchanged when nothing new arrived
    pub next_after: i64,
}

/// GET /queue/:topic
pub async fn read_topic(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Query(query): Query<TopicQuery>,
) -> ApiResult<Json<TopicPage>> {
    if !QUEUE_TOPICS.contains(&topic.as_str()) {
        return Err(ApiError::NotFound(format!("Unknown queue topic: {}", topic)));
    }

    let messages =
        db::queue::read_topic(&state.db, &topic, query.after, page_limit(query.limit)).await?;
    let next_after = messages.last().map(|m| m.seq).unwrap_or(query.after);

    Ok(Json(TopicPage {
        topic,
        messages,
        next_after,
    }))
}

pub fn queue_routes() -> Router<AppState> {
    Router::new().route("/queue/:topic", get(read_topic))
}
