// ABOUTME: Durable Job Store over SQLite with guarded state transitions
// ABOUTME: Terminal states are write-once; transition guards live in the SQL

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Job, JobOptions, JobState};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Invalid job state: {0}")]
    InvalidState(String),
    #[error("Transition to {to} rejected for job {id}")]
    InvalidTransition { id: String, to: &'static str },
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Table and index definitions, executed by the server at startup and by
/// test fixtures.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS compile_jobs (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    code TEXT NOT NULL,
    options TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    stdout TEXT,
    stderr TEXT,
    exit_code INTEGER,
    execution_time_ms INTEGER,
    memory_bytes INTEGER
);
CREATE INDEX IF NOT EXISTS idx_compile_jobs_room_id ON compile_jobs(room_id);
CREATE INDEX IF NOT EXISTS idx_compile_jobs_state ON compile_jobs(state);
CREATE INDEX IF NOT EXISTS idx_compile_jobs_created_at ON compile_jobs(created_at);
"#;

const JOB_COLUMNS: &str = "id, room_id, user_id, code, options, state, \
     created_at, started_at, completed_at, stdout, stderr, exit_code, \
     execution_time_ms, memory_bytes";

pub struct JobStorage {
    pool: SqlitePool,
}

impl JobStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a new job in `Queued`. Generates the id when empty.
    pub async fn create(
        &self,
        room_id: &str,
        user_id: &str,
        code: &str,
        options: &JobOptions,
    ) -> Result<Job> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            code: code.to_string(),
            options: options.clone(),
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            stdout: None,
            stderr: None,
            exit_code: None,
            execution_time_ms: None,
            memory_bytes: None,
        };

        let options_json = serde_json::to_string(&job.options)?;
        sqlx::query(
            r#"
            INSERT INTO compile_jobs (
                id, room_id, user_id, code, options, state,
                created_at, started_at, completed_at,
                stdout, stderr, exit_code, execution_time_ms, memory_bytes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL, NULL, NULL, NULL, NULL)
            "#,
        )
        .bind(&job.id)
        .bind(&job.room_id)
        .bind(&job.user_id)
        .bind(&job.code)
        .bind(&options_json)
        .bind(job.state.as_str())
        .bind(job.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Job> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM compile_jobs WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_job(row),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    /// Jobs for a user, newest first.
    pub async fn find_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM compile_jobs \
             WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_job).collect()
    }

    pub async fn find_running_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM compile_jobs WHERE state = 'running'"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_job).collect()
    }

    /// Submissions by `user_id` created inside the rolling window ending now.
    /// Admission evaluates its per-user limit against this count.
    pub async fn count_recent_by_user(&self, user_id: &str, window_ms: u64) -> Result<i64> {
        let since = Utc::now() - Duration::milliseconds(window_ms as i64);
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM compile_jobs WHERE user_id = ?1 AND created_at >= ?2",
        )
        .bind(user_id)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Queued -> Running.
    pub async fn mark_started(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE compile_jobs SET state = 'running', started_at = ?2 \
             WHERE id = ?1 AND state = 'queued'",
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::InvalidTransition {
                id: id.to_string(),
                to: "running",
            });
        }
        Ok(())
    }

    /// Running -> Completed, with the captured output.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_completed(
        &self,
        id: &str,
        stdout: &str,
        stderr: &str,
        exit_code: i64,
        execution_time_ms: i64,
        memory_bytes: Option<i64>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE compile_jobs SET state = 'completed', completed_at = ?2, \
             stdout = ?3, stderr = ?4, exit_code = ?5, execution_time_ms = ?6, \
             memory_bytes = ?7 \
             WHERE id = ?1 AND state = 'running'",
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .bind(stdout)
        .bind(stderr)
        .bind(exit_code)
        .bind(execution_time_ms)
        .bind(memory_bytes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::InvalidTransition {
                id: id.to_string(),
                to: "completed",
            });
        }
        Ok(())
    }

    /// Queued/Running -> Failed. A queued job can fail when dispatch gives up
    /// after exhausting its retry budget.
    pub async fn mark_failed(
        &self,
        id: &str,
        stderr: &str,
        exit_code: Option<i64>,
        execution_time_ms: Option<i64>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE compile_jobs SET state = 'failed', completed_at = ?2, \
             stderr = ?3, exit_code = ?4, execution_time_ms = ?5 \
             WHERE id = ?1 AND state IN ('queued', 'running')",
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .bind(stderr)
        .bind(exit_code)
        .bind(execution_time_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::InvalidTransition {
                id: id.to_string(),
                to: "failed",
            });
        }
        Ok(())
    }

    /// Running -> Timeout. Output may be partial.
    pub async fn mark_timeout(
        &self,
        id: &str,
        stdout: Option<&str>,
        stderr: Option<&str>,
        execution_time_ms: Option<i64>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE compile_jobs SET state = 'timeout', completed_at = ?2, \
             stdout = COALESCE(?3, stdout), stderr = COALESCE(?4, stderr), \
             execution_time_ms = COALESCE(?5, execution_time_ms) \
             WHERE id = ?1 AND state = 'running'",
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .bind(stdout)
        .bind(stderr)
        .bind(execution_time_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::InvalidTransition {
                id: id.to_string(),
                to: "timeout",
            });
        }
        Ok(())
    }

    /// Queued/Running -> Cancelled. Returns false when the job already
    /// reached a terminal state (the race is resolved by whichever write
    /// landed first).
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE compile_jobs SET state = 'cancelled', completed_at = ?2 \
             WHERE id = ?1 AND state IN ('queued', 'running')",
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete terminal jobs whose completion is older than `days`.
    pub async fn delete_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days);
        let result = sqlx::query(
            "DELETE FROM compile_jobs \
             WHERE state IN ('completed', 'failed', 'timeout', 'cancelled') \
             AND completed_at < ?1",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<Job> {
    let options: JobOptions = serde_json::from_str(&row.get::<String, _>("options"))?;
    Ok(Job {
        id: row.get("id"),
        room_id: row.get("room_id"),
        user_id: row.get("user_id"),
        code: row.get("code"),
        options,
        state: JobState::from_str(&row.get::<String, _>("state"))?,
        created_at: parse_ts(row.get("created_at"))?,
        started_at: parse_opt_ts(row.get("started_at"))?,
        completed_at: parse_opt_ts(row.get("completed_at"))?,
        stdout: row.get("stdout"),
        stderr: row.get("stderr"),
        exit_code: row.get("exit_code"),
        execution_time_ms: row.get("execution_time_ms"),
        memory_bytes: row.get("memory_bytes"),
    })
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp(raw))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}
