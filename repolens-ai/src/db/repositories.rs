//! Tracked repository persistence

use chrono::{DateTime, Utc};
use repolens_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{format_ts, parse_opt_ts, parse_ts, parse_uuid, MAX_LOCK_WAIT_MS};
use crate::models::Repository;
use crate::utils::retry_on_lock;

const COLUMNS: &str =
    "repository_id, external_id, owner, name, last_synced_at, current_job_id, created_at";

fn repository_from_row(row: &SqliteRow) -> Result<Repository> {
    let repository_id: String = row.get("repository_id");
    let current_job_id: Option<String> = row.get("current_job_id");
    let created_at: String = row.get("created_at");

    Ok(Repository {
        repository_id: parse_uuid("repository_id", &repository_id)?,
        external_id: row.get("external_id"),
        owner: row.get("owner"),
        name: row.get("name"),
        last_synced_at: parse_opt_ts("last_synced_at", row.get("last_synced_at"))?,
        current_job_id: current_job_id
            .map(|id| parse_uuid("current_job_id", &id))
            .transpose()?,
        created_at: parse_ts("created_at", &created_at)?,
    })
}

/// Register `owner/name`, or return the existing record
///
/// The boolean is `true` when a new row was created. A known
/// `external_id` is filled in on an existing record that lacks one.
pub async fn upsert_repository(
    pool: &SqlitePool,
    owner: &str,
    name: &str,
    external_id: Option<i64>,
) -> Result<(Repository, bool)> {
    let candidate = Repository::new(owner, name, external_id);
    let repository_id = candidate.repository_id.to_string();
    let created_at = format_ts(candidate.created_at);

    let inserted = retry_on_lock("upsert_repository", MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            INSERT INTO repositories (repository_id, external_id, owner, name, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(owner, name) DO UPDATE SET
                external_id = COALESCE(repositories.external_id, excluded.external_id)
            "#,
        )
        .bind(&repository_id)
        .bind(external_id)
        .bind(owner)
        .bind(name)
        .bind(&created_at)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await?;

    let repository = find_by_slug(pool, owner, name).await?.ok_or_else(|| {
        repolens_common::Error::Internal(format!("repository {}/{} vanished after upsert", owner, name))
    })?;
    let created = inserted > 0 && repository.repository_id == candidate.repository_id;
    Ok((repository, created))
}

pub async fn load_repository(pool: &SqlitePool, repository_id: Uuid) -> Result<Option<Repository>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM repositories WHERE repository_id = ?",
        COLUMNS
    ))
    .bind(repository_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(repository_from_row).transpose()
}

pub async fn find_by_slug(pool: &SqlitePool, owner: &str, name: &str) -> Result<Option<Repository>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM repositories WHERE owner = ? AND name = ?",
        COLUMNS
    ))
    .bind(owner)
    .bind(name)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(repository_from_row).transpose()
}

pub async fn list_repositories(pool: &SqlitePool) -> Result<Vec<Repository>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM repositories ORDER BY owner, name",
        COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(repository_from_row).collect()
}

/// Advance the incremental sync watermark
///
/// Never moves it backwards.
pub async fn advance_watermark(
    pool: &SqlitePool,
    repository_id: Uuid,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    let id = repository_id.to_string();
    let synced_at = format_ts(synced_at);

    retry_on_lock("advance_watermark", MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            UPDATE repositories SET last_synced_at = ?
            WHERE repository_id = ? AND (last_synced_at IS NULL OR last_synced_at < ?)
            "#,
        )
        .bind(&synced_at)
        .bind(&id)
        .bind(&synced_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}
