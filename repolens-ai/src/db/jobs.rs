//! Analysis job store
//!
//! Source of truth for the job state machine. Every transition is a single
//! conditional UPDATE guarded by the allowed predecessor states, so two
//! writers can never both win the same transition. Per-repository
//! exclusivity is the partial unique index `idx_analysis_jobs_one_active`.

use chrono::Utc;
use repolens_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{format_ts, from_json, parse_opt_ts, parse_ts, parse_uuid, to_json, MAX_LOCK_WAIT_MS};
use crate::models::{AnalysisJob, AnalyzerKind, JobErrorDetail, JobState};
use crate::utils::retry_on_lock;

const COLUMNS: &str = "job_id, repository_id, state, analyzers, incremental, progress_percent, \
                       error_detail, created_at, started_at, completed_at";

/// Result of inserting a new job
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// Another job for the repository is still queued or running
    Conflict { active_job_id: Option<Uuid> },
}

fn job_from_row(row: &SqliteRow) -> Result<AnalysisJob> {
    let job_id: String = row.get("job_id");
    let repository_id: String = row.get("repository_id");
    let state: String = row.get("state");
    let analyzers: String = row.get("analyzers");
    let error_detail: Option<String> = row.get("error_detail");
    let created_at: String = row.get("created_at");

    Ok(AnalysisJob {
        job_id: parse_uuid("job_id", &job_id)?,
        repository_id: parse_uuid("repository_id", &repository_id)?,
        state: JobState::parse(&state)
            .ok_or_else(|| Error::Internal(format!("Unknown job state: {}", state)))?,
        analyzers: from_json::<Vec<AnalyzerKind>>("analyzers", &analyzers)?,
        incremental: row.get::<i64, _>("incremental") != 0,
        progress_percent: row.get::<i64, _>("progress_percent").clamp(0, 100) as u8,
        error_detail: error_detail
            .map(|d| from_json::<JobErrorDetail>("error_detail", &d))
            .transpose()?,
        created_at: parse_ts("created_at", &created_at)?,
        started_at: parse_opt_ts("started_at", row.get("started_at"))?,
        completed_at: parse_opt_ts("completed_at", row.get("completed_at"))?,
    })
}

/// Insert a queued job and point the repository at it, atomically
///
/// The insert is the check-and-set: the partial unique index rejects it
/// while another job for the repository is non-terminal.
pub async fn insert_job(pool: &SqlitePool, job: &AnalysisJob) -> Result<InsertOutcome> {
    let job_id = job.job_id.to_string();
    let repository_id = job.repository_id.to_string();
    let analyzers = to_json("analyzers", &job.analyzers)?;
    let created_at = format_ts(job.created_at);

    let result = retry_on_lock("insert_job", MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO analysis_jobs
                (job_id, repository_id, state, analyzers, incremental, progress_percent, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&job_id)
        .bind(&repository_id)
        .bind(JobState::Queued.as_str())
        .bind(&analyzers)
        .bind(job.incremental)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE repositories SET current_job_id = ? WHERE repository_id = ?")
            .bind(&job_id)
            .bind(&repository_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    })
    .await;

    match result {
        Ok(()) => Ok(InsertOutcome::Inserted),
        Err(e) if e.is_unique_violation() => {
            let active_job_id = active_job_for_repository(pool, job.repository_id)
                .await?
                .map(|j| j.job_id);
            Ok(InsertOutcome::Conflict { active_job_id })
        }
        Err(e) => Err(e),
    }
}

/// Apply `next` if the job is currently in a state that may move to it
///
/// Returns `false` when the job is missing or the transition is not
/// allowed from its current state.
pub async fn transition(
    pool: &SqlitePool,
    job_id: Uuid,
    next: JobState,
    error_detail: Option<&JobErrorDetail>,
) -> Result<bool> {
    transition_from(pool, job_id, &[JobState::Queued, JobState::InProgress], next, error_detail).await
}

/// Like [`transition`], but only from the listed current states
pub async fn transition_from(
    pool: &SqlitePool,
    job_id: Uuid,
    current: &[JobState],
    next: JobState,
    error_detail: Option<&JobErrorDetail>,
) -> Result<bool> {
    let from: Vec<&'static str> = current
        .iter()
        .filter(|s| s.can_transition_to(next))
        .map(|s| s.as_str())
        .collect();
    if from.is_empty() {
        return Ok(false);
    }

    let now = format_ts(Utc::now());
    let id = job_id.to_string();
    let detail = error_detail
        .filter(|d| !d.is_empty())
        .map(|d| to_json("error_detail", d))
        .transpose()?;
    let placeholders = vec!["?"; from.len()].join(", ");

    let sql = if next == JobState::InProgress {
        format!(
            "UPDATE analysis_jobs SET state = ?, started_at = ? WHERE job_id = ? AND state IN ({})",
            placeholders
        )
    } else {
        format!(
            "UPDATE analysis_jobs SET state = ?, completed_at = ?, error_detail = ?, \
             progress_percent = CASE WHEN ? = 'COMPLETED' THEN 100 ELSE progress_percent END \
             WHERE job_id = ? AND state IN ({})",
            placeholders
        )
    };

    let affected = retry_on_lock("transition_job", MAX_LOCK_WAIT_MS, || async {
        let mut query = sqlx::query(&sql).bind(next.as_str()).bind(&now);
        if next != JobState::InProgress {
            query = query.bind(&detail).bind(next.as_str());
        }
        query = query.bind(&id);
        for state in &from {
            query = query.bind(*state);
        }
        Ok(query.execute(pool).await?.rows_affected())
    })
    .await?;

    Ok(affected == 1)
}

/// Raise progress; never lowers it and ignores jobs no longer running
pub async fn update_progress(pool: &SqlitePool, job_id: Uuid, percent: u8) -> Result<()> {
    let id = job_id.to_string();
    let percent = i64::from(percent.min(100));

    retry_on_lock("update_progress", MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            UPDATE analysis_jobs SET progress_percent = MAX(progress_percent, ?)
            WHERE job_id = ? AND state = 'IN_PROGRESS'
            "#,
        )
        .bind(percent)
        .bind(&id)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

pub async fn load_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<AnalysisJob>> {
    let row = sqlx::query(&format!("SELECT {} FROM analysis_jobs WHERE job_id = ?", COLUMNS))
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Most recent first
pub async fn list_jobs_for_repository(
    pool: &SqlitePool,
    repository_id: Uuid,
    limit: u32,
) -> Result<Vec<AnalysisJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM analysis_jobs WHERE repository_id = ? ORDER BY created_at DESC LIMIT ?",
        COLUMNS
    ))
    .bind(repository_id.to_string())
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

pub async fn active_job_for_repository(
    pool: &SqlitePool,
    repository_id: Uuid,
) -> Result<Option<AnalysisJob>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM analysis_jobs WHERE repository_id = ? AND state IN ('QUEUED', 'IN_PROGRESS')",
        COLUMNS
    ))
    .bind(repository_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

pub async fn count_active_jobs(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM analysis_jobs WHERE state IN ('QUEUED', 'IN_PROGRESS')",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Non-terminal jobs, oldest first
pub async fn list_unfinished_jobs(pool: &SqlitePool) -> Result<Vec<AnalysisJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM analysis_jobs WHERE state IN ('QUEUED', 'IN_PROGRESS') ORDER BY created_at",
        COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}
