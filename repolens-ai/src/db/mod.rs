//! Database access for repolens-ai
//!
//! SQLite holds the durable state: tracked repositories, the analysis job
//! store (source of truth for the job state machine), the append-only
//! insight store and the mirrored queue topics.

pub mod insights;
pub mod jobs;
pub mod queue;
pub mod repositories;

use chrono::{DateTime, SecondsFormat, Utc};
use repolens_common::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Default cap for `retry_on_lock` on store writes
pub const MAX_LOCK_WAIT_MS: u64 = 5_000;

/// Open (creating if needed) the service database under the root folder
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database, used by tests
pub async fn init_memory_pool() -> Result<SqlitePool> {
    // The database lives as long as its only connection
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create tables and indexes if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            repository_id TEXT PRIMARY KEY,
            external_id INTEGER,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            last_synced_at TEXT,
            current_job_id TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (owner, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_jobs (
            job_id TEXT PRIMARY KEY,
            repository_id TEXT NOT NULL REFERENCES repositories(repository_id),
            state TEXT NOT NULL,
            analyzers TEXT NOT NULL,
            incremental INTEGER NOT NULL DEFAULT 0,
            progress_percent INTEGER NOT NULL DEFAULT 0,
            error_detail TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one non-terminal job per repository, enforced by the store
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_analysis_jobs_one_active
        ON analysis_jobs(repository_id)
        WHERE state IN ('QUEUED', 'IN_PROGRESS')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_analysis_jobs_repository ON analysis_jobs(repository_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS insights (
            insight_id TEXT PRIMARY KEY,
            repository_id TEXT NOT NULL,
            job_id TEXT NOT NULL,
            analyzer TEXT NOT NULL,
            title TEXT NOT NULL,
            confidence REAL NOT NULL,
            payload TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            generated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_insights_repository ON insights(repository_id, analyzer, generated_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            topic TEXT NOT NULL,
            dedup_key TEXT NOT NULL UNIQUE,
            repository_id TEXT NOT NULL,
            job_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            published_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_topic ON queue_messages(topic, seq)")
        .execute(pool)
        .await?;

    tracing::info!("Database tables initialized (repositories, analysis_jobs, insights, queue_messages)");
    Ok(())
}

/// Fixed-width UTC timestamps so TEXT ordering matches time ordering
pub(crate) fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn parse_opt_ts(column: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(column, &v)).transpose()
}

pub(crate) fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize {}: {}", what, e)))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(what: &str, value: &str) -> Result<T> {
    serde_json::from_str(value)
        .map_err(|e| Error::Internal(format!("Failed to deserialize {}: {}", what, e)))
}
