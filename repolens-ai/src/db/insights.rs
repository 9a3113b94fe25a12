//! Append-only insight store
//!
//! Rows are never updated. A later job supersedes earlier insights for the
//! same `(repository, analyzer)`; reads return only the latest job's rows
//! unless asked for history.

use chrono::{DateTime, Utc};
use repolens_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{format_ts, from_json, parse_opt_ts, parse_ts, parse_uuid, to_json, MAX_LOCK_WAIT_MS};
use crate::models::{AnalyzerKind, Insight, InsightFilter};
use crate::utils::retry_on_lock;

/// Insights for the latest job of each analyzer only
const CURRENT_ONLY: &str = r#"
    i.job_id = (
        SELECT i2.job_id FROM insights i2
        WHERE i2.repository_id = i.repository_id AND i2.analyzer = i.analyzer
        ORDER BY i2.generated_at DESC
        LIMIT 1
    )
"#;

/// Per-repository rollup served at `/repositories/:id/summary`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightSummary {
    pub repository_id: Uuid,
    pub insight_count: i64,
    pub average_confidence: Option<f64>,
    pub by_analyzer: BTreeMap<String, i64>,
    pub needs_attention: i64,
    pub last_generated_at: Option<DateTime<Utc>>,
}

/// One leaderboard row, best repositories first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub repository_id: Uuid,
    pub repository: String,
    pub insight_count: i64,
    pub needs_attention: i64,
    pub average_confidence: f64,
}

fn insight_from_row(row: &SqliteRow) -> Result<Insight> {
    let insight_id: String = row.get("insight_id");
    let repository_id: String = row.get("repository_id");
    let job_id: String = row.get("job_id");
    let analyzer: String = row.get("analyzer");
    let payload: String = row.get("payload");
    let tags: String = row.get("tags");
    let generated_at: String = row.get("generated_at");

    Ok(Insight {
        insight_id: parse_uuid("insight_id", &insight_id)?,
        repository_id: parse_uuid("repository_id", &repository_id)?,
        job_id: parse_uuid("job_id", &job_id)?,
        analyzer: analyzer
            .parse::<AnalyzerKind>()
            .map_err(Error::Internal)?,
        title: row.get("title"),
        confidence: row.get("confidence"),
        payload: from_json("payload", &payload)?,
        tags: from_json("tags", &tags)?,
        generated_at: parse_ts("generated_at", &generated_at)?,
    })
}

/// Persist a batch in one transaction
///
/// Idempotent on `insight_id`, so a retried batch never duplicates rows.
pub async fn insert_insights(pool: &SqlitePool, insights: &[Insight]) -> Result<()> {
    if insights.is_empty() {
        return Ok(());
    }

    // Serialize everything before touching the database
    let rows = insights
        .iter()
        .map(|i| {
            Ok((
                i.insight_id.to_string(),
                i.repository_id.to_string(),
                i.job_id.to_string(),
                i.analyzer.as_str(),
                i.title.clone(),
                i.confidence,
                to_json("payload", &i.payload)?,
                to_json("tags", &i.tags)?,
                format_ts(i.generated_at),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    retry_on_lock("insert_insights", MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        for (id, repo, job, analyzer, title, confidence, payload, tags, generated_at) in &rows {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO insights (
                    insight_id, repository_id, job_id, analyzer, title,
                    confidence, payload, tags, generated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(repo)
            .bind(job)
            .bind(*analyzer)
            .bind(title)
            .bind(*confidence)
            .bind(payload)
            .bind(tags)
            .bind(generated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await
}

/// Insights ordered by confidence, then recency
pub async fn query_insights(
    pool: &SqlitePool,
    repository_id: Uuid,
    filter: &InsightFilter,
) -> Result<Vec<Insight>> {
    let sql = format!(
        r#"
        SELECT i.insight_id, i.repository_id, i.job_id, i.analyzer, i.title,
               i.confidence, i.payload, i.tags, i.generated_at
        FROM insights i
        WHERE i.repository_id = ?
          AND (? = 1 OR {current})
          AND (? IS NULL OR i.analyzer = ?)
          AND (? IS NULL OR i.confidence >= ?)
          AND (? IS NULL OR EXISTS (SELECT 1 FROM json_each(i.tags) WHERE json_each.value = ?))
        ORDER BY i.confidence DESC, i.generated_at DESC
        LIMIT ?
        "#,
        current = CURRENT_ONLY
    );

    let analyzer = filter.analyzer.map(|a| a.as_str());
    let limit = filter.limit.map(i64::from).unwrap_or(-1);

    let rows = sqlx::query(&sql)
        .bind(repository_id.to_string())
        .bind(filter.include_superseded)
        .bind(analyzer)
        .bind(analyzer)
        .bind(filter.min_confidence)
        .bind(filter.min_confidence)
        .bind(filter.tag.as_deref())
        .bind(filter.tag.as_deref())
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.iter().map(insight_from_row).collect()
}

/// Rollup of the current (non-superseded) insights of one repository
pub async fn summarize(pool: &SqlitePool, repository_id: Uuid) -> Result<InsightSummary> {
    let current = query_insights(pool, repository_id, &InsightFilter::default()).await?;

    let mut by_analyzer = BTreeMap::new();
    for insight in &current {
        *by_analyzer.entry(insight.analyzer.as_str().to_string()).or_insert(0) += 1;
    }
    let insight_count = current.len() as i64;

    Ok(InsightSummary {
        repository_id,
        insight_count,
        average_confidence: (insight_count > 0)
            .then(|| current.iter().map(|i| i.confidence).sum::<f64>() / insight_count as f64),
        by_analyzer,
        needs_attention: current
            .iter()
            .filter(|i| i.tags.iter().any(|t| t == "needs-attention"))
            .count() as i64,
        last_generated_at: current.iter().map(|i| i.generated_at).max(),
    })
}

/// Repositories ranked by fewest attention flags, then highest confidence
pub async fn leaderboard(pool: &SqlitePool, limit: u32) -> Result<Vec<LeaderboardEntry>> {
    let sql = format!(
        r#"
        SELECT r.repository_id, r.owner || '/' || r.name AS slug,
               COUNT(*) AS insight_count,
               SUM(CASE WHEN EXISTS (
                   SELECT 1 FROM json_each(i.tags) WHERE json_each.value = 'needs-attention'
               ) THEN 1 ELSE 0 END) AS needs_attention,
               AVG(i.confidence) AS average_confidence
        FROM insights i
        JOIN repositories r ON r.repository_id = i.repository_id
        WHERE {current}
        GROUP BY r.repository_id
        ORDER BY needs_attention ASC, average_confidence DESC, slug ASC
        LIMIT ?
        "#,
        current = CURRENT_ONLY
    );

    let rows = sqlx::query(&sql).bind(i64::from(limit)).fetch_all(pool).await?;

    rows.iter()
        .map(|row| {
            let repository_id: String = row.get("repository_id");
            Ok(LeaderboardEntry {
                repository_id: parse_uuid("repository_id", &repository_id)?,
                repository: row.get("slug"),
                insight_count: row.get("insight_count"),
                needs_attention: row.get("needs_attention"),
                average_confidence: row.get("average_confidence"),
            })
        })
        .collect()
}

/// Latest generation time across a repository's insights
pub async fn last_generated_at(pool: &SqlitePool, repository_id: Uuid) -> Result<Option<DateTime<Utc>>> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT MAX(generated_at) FROM insights WHERE repository_id = ?")
            .bind(repository_id.to_string())
            .fetch_one(pool)
            .await?;
    parse_opt_ts("generated_at", value)
}
