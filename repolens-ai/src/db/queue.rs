//! Durable queue topics
//!
//! Terminal job events and insight batches are mirrored into
//! `queue_messages` so downstream consumers can read them in order with a
//! sequence cursor. Publishing is idempotent per event.

use chrono::{DateTime, Utc};
use repolens_common::events::AnalysisEvent;
use repolens_common::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use super::{format_ts, from_json, parse_ts, to_json, MAX_LOCK_WAIT_MS};
use crate::utils::retry_on_lock;

/// One message on a topic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMessage {
    pub seq: i64,
    pub topic: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

/// Same event published twice maps to the same key
fn dedup_key(topic: &str, event: &AnalysisEvent) -> String {
    let analyzer = match event {
        AnalysisEvent::AnalyzerCompleted { analyzer, .. }
        | AnalysisEvent::AnalyzerFailed { analyzer, .. } => analyzer.as_str(),
        _ => "-",
    };
    format!("{}:{}:{}:{}", topic, event.job_id(), event.event_type(), analyzer)
}

/// Append `event` to `topic`
///
/// Returns `false` when the event was already on the topic.
pub async fn publish_event(pool: &SqlitePool, topic: &str, event: &AnalysisEvent) -> Result<bool> {
    let key = dedup_key(topic, event);
    let payload = to_json("queue payload", event)?;
    let repository_id = event.repository_id().to_string();
    let job_id = event.job_id().to_string();
    let published_at = format_ts(Utc::now());

    let affected = retry_on_lock("publish_event", MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue_messages
                (topic, dedup_key, repository_id, job_id, payload, published_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(topic)
        .bind(&key)
        .bind(&repository_id)
        .bind(&job_id)
        .bind(&payload)
        .bind(&published_at)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await?;

    if affected == 0 {
        tracing::debug!(topic, key = %key, "Queue message already published");
    }
    Ok(affected == 1)
}

/// Messages with `seq > after`, oldest first
pub async fn read_topic(
    pool: &SqlitePool,
    topic: &str,
    after: i64,
    limit: u32,
) -> Result<Vec<QueueMessage>> {
    let rows = sqlx::query(
        r#"
        SELECT seq, topic, payload, published_at FROM queue_messages
        WHERE topic = ? AND seq > ?
        ORDER BY seq
        LIMIT ?
        "#,
    )
    .bind(topic)
    .bind(after)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let payload: String = row.get("payload");
            let published_at: String = row.get("published_at");
            Ok(QueueMessage {
                seq: row.get("seq"),
                topic: row.get("topic"),
                payload: from_json("queue payload", &payload)?,
                published_at: parse_ts("published_at", &published_at)?,
            })
        })
        .collect()
}
