// ABOUTME: Admission control and public queue operations for compile jobs
// ABOUTME: Saturation check, per-user rolling window, option clamping, status/cancel

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use codehive_config::parse_memory_limit;

use crate::queue::{Queue, QueueEntry, QueueError, QueueStats, PRIORITY_NORMAL};
use crate::storage::{JobStorage, StorageError};
use crate::types::{Job, JobOptions, JobState, MAX_CODE_BYTES};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Queue is full")]
    QueueFull,
    #[error("Rate limit exceeded for user")]
    RateLimited,
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<StorageError> for DispatchError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(id) => DispatchError::NotFound(id),
            other => DispatchError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Caller-supplied options; every field optional, defaults applied at
/// admission.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobOptionsPatch {
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<f64>,
    pub wall_timeout_ms: Option<u64>,
    pub process_count_limit: Option<u32>,
    pub compiler_flags: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Admission refuses once waiting + active reaches this depth.
    pub max_queue_depth: u64,
    /// Rolling-window submission budget per user.
    pub user_window_max: i64,
    pub user_window_ms: u64,
    /// Global ceiling the per-job wall timeout is clamped to.
    pub max_wall_timeout_ms: u64,
    pub max_memory_limit: String,
    pub max_cpu_limit: f64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Grace added to the wall timeout for the per-attempt queue lease.
    pub attempt_grace_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 100,
            user_window_max: 5,
            user_window_ms: 60_000,
            max_wall_timeout_ms: 30_000,
            max_memory_limit: "128m".to_string(),
            max_cpu_limit: 0.5,
            max_attempts: 3,
            backoff_ms: 2_000,
            attempt_grace_ms: 5_000,
        }
    }
}

/// Job status view assembled from the store and the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<crate::types::JobResult>,
}

pub struct ExecutionDispatcher {
    storage: Arc<JobStorage>,
    queue: Arc<dyn Queue>,
    config: DispatcherConfig,
}

impl ExecutionDispatcher {
    pub fn new(storage: Arc<JobStorage>, queue: Arc<dyn Queue>, config: DispatcherConfig) -> Self {
        Self {
            storage,
            queue,
            config,
        }
    }

    /// Admit a submission: saturation check, per-user rolling window, option
    /// merging, then persist in `Queued` and enqueue.
    pub async fn queue_job(
        &self,
        room_id: &str,
        user_id: &str,
        code: &str,
        patch: JobOptionsPatch,
    ) -> Result<Job> {
        if code.is_empty() {
            return Err(DispatchError::Validation("code must not be empty".into()));
        }
        if code.len() > MAX_CODE_BYTES {
            return Err(DispatchError::Validation(format!(
                "code exceeds {} bytes",
                MAX_CODE_BYTES
            )));
        }

        let stats = self.queue.stats().await?;
        if stats.waiting + stats.active >= self.config.max_queue_depth {
            return Err(DispatchError::QueueFull);
        }

        let recent = self
            .storage
            .count_recent_by_user(user_id, self.config.user_window_ms)
            .await?;
        if recent >= self.config.user_window_max {
            return Err(DispatchError::RateLimited);
        }

        let options = effective_options(patch, &self.config)?;
        let job = self.storage.create(room_id, user_id, code, &options).await?;

        self.queue
            .enqueue(QueueEntry {
                job_id: job.id.clone(),
                priority: PRIORITY_NORMAL,
                attempts_made: 0,
                max_attempts: self.config.max_attempts,
                backoff_ms: self.config.backoff_ms,
                attempt_timeout_ms: options.wall_timeout_ms + self.config.attempt_grace_ms,
            })
            .await?;

        info!(job_id = %job.id, user_id, "job admitted");
        Ok(job)
    }

    /// Terminal jobs return the stored result; queued jobs carry their
    /// 1-based rank among waiting entries.
    pub async fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        let job = self.storage.find_by_id(job_id).await?;

        let queue_position = if job.state == JobState::Queued {
            self.queue.position(job_id).await?.map(|rank| rank + 1)
        } else {
            None
        };

        Ok(JobStatus {
            job_id: job.id.clone(),
            state: job.state.label().to_string(),
            queue_position,
            result: job.result(),
        })
    }

    /// Cooperative cancellation. Only the submitting user may cancel, and
    /// only while the job is non-terminal; a running sandbox is left to its
    /// watchdog, the terminal write race settles the final state.
    pub async fn cancel_job(&self, job_id: &str, user_id: &str) -> Result<bool> {
        let job = match self.storage.find_by_id(job_id).await {
            Ok(job) => job,
            Err(StorageError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if job.user_id != user_id || job.state.is_terminal() {
            return Ok(false);
        }

        if job.state == JobState::Queued {
            self.queue.remove_waiting(job_id).await?;
        }
        Ok(self.storage.cancel(job_id).await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(self.queue.stats().await?)
    }

    /// Purge finished queue buckets older than 1 h and terminal store rows
    /// older than 7 days.
    pub async fn cleanup(&self) -> Result<()> {
        let purged = self.queue.cleanup_finished(60 * 60 * 1000).await?;
        let deleted = self.storage.delete_older_than(7).await?;
        if purged > 0 || deleted > 0 {
            info!(purged, deleted, "dispatcher cleanup");
        }
        Ok(())
    }
}

/// Merge caller options with defaults and clamp them to the global limits.
pub fn effective_options(
    patch: JobOptionsPatch,
    config: &DispatcherConfig,
) -> Result<JobOptions> {
    let defaults = JobOptions::default();

    let wall_timeout_ms = patch.wall_timeout_ms.unwrap_or(defaults.wall_timeout_ms);
    if !(1_000..=60_000).contains(&wall_timeout_ms) {
        return Err(DispatchError::Validation(
            "wallTimeoutMs must be between 1000 and 60000".into(),
        ));
    }
    let wall_timeout_ms = wall_timeout_ms.min(config.max_wall_timeout_ms);

    let memory_limit = patch.memory_limit.unwrap_or(defaults.memory_limit);
    let requested_bytes = parse_memory_limit(&memory_limit).ok_or_else(|| {
        DispatchError::Validation("memoryLimit must match ^\\d+[kmg]?$".into())
    })?;
    let max_bytes =
        parse_memory_limit(&config.max_memory_limit).unwrap_or(128 * 1024 * 1024);
    let memory_limit = if requested_bytes > max_bytes {
        config.max_memory_limit.clone()
    } else {
        memory_limit
    };

    let cpu_limit = patch.cpu_limit.unwrap_or(defaults.cpu_limit);
    if !(cpu_limit > 0.0 && cpu_limit <= 4.0) {
        return Err(DispatchError::Validation(
            "cpuLimit must be in (0, 4]".into(),
        ));
    }
    let cpu_limit = cpu_limit.min(config.max_cpu_limit);

    let process_count_limit = patch
        .process_count_limit
        .unwrap_or(defaults.process_count_limit);
    if !(1..=1024).contains(&process_count_limit) {
        return Err(DispatchError::Validation(
            "processCountLimit must be between 1 and 1024".into(),
        ));
    }

    let compiler_flags = patch.compiler_flags.unwrap_or(defaults.compiler_flags);
    for flag in &compiler_flags {
        if flag.is_empty()
            || !flag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "_.:=+-".contains(c))
        {
            return Err(DispatchError::Validation(format!(
                "invalid compiler flag: {flag:?}"
            )));
        }
    }

    Ok(JobOptions {
        memory_limit,
        cpu_limit,
        wall_timeout_ms,
        process_count_limit,
        compiler_flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InMemoryQueue;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn fixture() -> (ExecutionDispatcher, Arc<JobStorage>, Arc<InMemoryQueue>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::raw_sql(crate::storage::SCHEMA)
            .execute(&pool)
            .await
            .unwrap();
        let storage = Arc::new(JobStorage::new(pool));
        let queue = Arc::new(InMemoryQueue::default());
        let dispatcher = ExecutionDispatcher::new(
            storage.clone(),
            queue.clone(),
            DispatcherConfig::default(),
        );
        (dispatcher, storage, queue)
    }

    const CODE: &str = "int main() { return 0; }";

    #[tokio::test]
    async fn admits_and_persists_queued_job() {
        let (dispatcher, storage, queue) = fixture().await;
        let job = dispatcher
            .queue_job("room-1", "alice", CODE, JobOptionsPatch::default())
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(storage.find_by_id(&job.id).await.unwrap().state, JobState::Queued);
        assert_eq!(queue.stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn rejects_oversized_code() {
        let (dispatcher, _, _) = fixture().await;
        let huge = "a".repeat(MAX_CODE_BYTES + 1);
        assert!(matches!(
            dispatcher
                .queue_job("room-1", "alice", &huge, JobOptionsPatch::default())
                .await,
            Err(DispatchError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn sixth_submission_in_window_is_rate_limited() {
        let (dispatcher, _, _) = fixture().await;
        for _ in 0..5 {
            dispatcher
                .queue_job("room-1", "alice", CODE, JobOptionsPatch::default())
                .await
                .unwrap();
        }
        assert!(matches!(
            dispatcher
                .queue_job("room-1", "alice", CODE, JobOptionsPatch::default())
                .await,
            Err(DispatchError::RateLimited)
        ));
        // A different user is unaffected.
        dispatcher
            .queue_job("room-1", "bob", CODE, JobOptionsPatch::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn saturated_queue_rejects_with_queue_full() {
        let (dispatcher, _, queue) = fixture().await;
        queue.saturate(100).await;
        assert!(matches!(
            dispatcher
                .queue_job("room-1", "alice", CODE, JobOptionsPatch::default())
                .await,
            Err(DispatchError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn status_reports_one_based_queue_position() {
        let (dispatcher, _, _) = fixture().await;
        let first = dispatcher
            .queue_job("room-1", "alice", CODE, JobOptionsPatch::default())
            .await
            .unwrap();
        let second = dispatcher
            .queue_job("room-1", "bob", CODE, JobOptionsPatch::default())
            .await
            .unwrap();

        let status = dispatcher.job_status(&first.id).await.unwrap();
        assert_eq!(status.queue_position, Some(1));
        let status = dispatcher.job_status(&second.id).await.unwrap();
        assert_eq!(status.queue_position, Some(2));

        assert!(matches!(
            dispatcher.job_status("missing").await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_requires_matching_user_and_live_state() {
        let (dispatcher, storage, queue) = fixture().await;
        let job = dispatcher
            .queue_job("room-1", "alice", CODE, JobOptionsPatch::default())
            .await
            .unwrap();

        assert!(!dispatcher.cancel_job(&job.id, "mallory").await.unwrap());
        assert!(dispatcher.cancel_job(&job.id, "alice").await.unwrap());
        assert_eq!(queue.stats().await.unwrap().waiting, 0);
        assert_eq!(
            storage.find_by_id(&job.id).await.unwrap().state,
            JobState::Cancelled
        );

        // Second cancel is a no-op on the terminal state.
        assert!(!dispatcher.cancel_job(&job.id, "alice").await.unwrap());
        assert!(!dispatcher.cancel_job("missing", "alice").await.unwrap());
    }

    #[test]
    fn options_default_when_patch_is_empty() {
        let options =
            effective_options(JobOptionsPatch::default(), &DispatcherConfig::default()).unwrap();
        assert_eq!(options, JobOptions::default());
    }

    #[test]
    fn options_clamped_to_global_limits() {
        let config = DispatcherConfig::default();
        let options = effective_options(
            JobOptionsPatch {
                wall_timeout_ms: Some(60_000),
                cpu_limit: Some(4.0),
                memory_limit: Some("2g".to_string()),
                ..Default::default()
            },
            &config,
        )
        .unwrap();
        assert_eq!(options.wall_timeout_ms, 30_000);
        assert_eq!(options.cpu_limit, 0.5);
        assert_eq!(options.memory_limit, "128m");
    }

    #[test]
    fn options_out_of_bounds_are_rejected() {
        let config = DispatcherConfig::default();
        let check = |patch: JobOptionsPatch| {
            matches!(
                effective_options(patch, &config),
                Err(DispatchError::Validation(_))
            )
        };

        assert!(check(JobOptionsPatch {
            wall_timeout_ms: Some(999),
            ..Default::default()
        }));
        assert!(check(JobOptionsPatch {
            wall_timeout_ms: Some(60_001),
            ..Default::default()
        }));
        assert!(check(JobOptionsPatch {
            memory_limit: Some("128mb".to_string()),
            ..Default::default()
        }));
        assert!(check(JobOptionsPatch {
            cpu_limit: Some(0.0),
            ..Default::default()
        }));
        assert!(check(JobOptionsPatch {
            cpu_limit: Some(4.5),
            ..Default::default()
        }));
        assert!(check(JobOptionsPatch {
            process_count_limit: Some(0),
            ..Default::default()
        }));
        assert!(check(JobOptionsPatch {
            process_count_limit: Some(2000),
            ..Default::default()
        }));
        // Shell metacharacters never reach the sandbox command line.
        assert!(check(JobOptionsPatch {
            compiler_flags: Some(vec!["-O2; rm -rf /".to_string()]),
            ..Default::default()
        }));
    }
}
