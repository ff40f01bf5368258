// ABOUTME: Worker lanes bridging the durable queue, the Job Store and the pool
// ABOUTME: Terminal writes are first-write-wins; scheduling errors retry with backoff

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use codehive_config::parse_memory_limit;
use codehive_sandbox::{ContainerPool, ExecutionOutcome, ResourceProfile};

use crate::queue::{Queue, QueueEntry};
use crate::storage::{JobStorage, StorageError};
use crate::types::{Job, JobOptions, JobState};

const IDLE_POLL: Duration = Duration::from_millis(250);

/// Set of worker lanes pulling jobs off the queue. The queue is the only
/// source of pending work; the store is the only source of job state.
pub struct JobWorkers {
    storage: Arc<JobStorage>,
    queue: Arc<dyn Queue>,
    pool: Arc<ContainerPool>,
    shutdown_tx: watch::Sender<bool>,
}

impl JobWorkers {
    pub fn new(
        storage: Arc<JobStorage>,
        queue: Arc<dyn Queue>,
        pool: Arc<ContainerPool>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            storage,
            queue,
            pool,
            shutdown_tx,
        }
    }

    /// Spawn `count` worker lanes. Lane 0 also performs queue maintenance
    /// (delayed promotion and lease reclaim) each poll.
    pub fn start(self: &Arc<Self>, count: usize) {
        for lane in 0..count {
            let workers = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                info!(lane, "job worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let worked = match workers.process_one(lane == 0).await {
                        Ok(worked) => worked,
                        Err(e) => {
                            error!(lane, "worker cycle failed: {e}");
                            false
                        }
                    };
                    if !worked {
                        tokio::select! {
                            _ = tokio::time::sleep(IDLE_POLL) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                info!(lane, "job worker stopped");
            });
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One worker cycle: optional maintenance, then at most one job.
    /// Returns whether a job was processed.
    pub async fn process_one(&self, maintain: bool) -> crate::queue::Result<bool> {
        if maintain {
            let report = self.queue.maintain().await?;
            for job_id in &report.exhausted {
                if let Err(e) = self
                    .storage
                    .mark_failed(job_id, "execution lease expired after retries", None, None)
                    .await
                {
                    debug!(job_id, "lease-expiry fail write skipped: {e}");
                }
            }
            if !report.requeued.is_empty() {
                warn!(count = report.requeued.len(), "requeued expired leases");
            }
        }

        let Some(entry) = self.queue.pop_ready().await? else {
            return Ok(false);
        };
        self.process(entry).await?;
        Ok(true)
    }

    async fn process(&self, entry: QueueEntry) -> crate::queue::Result<()> {
        let job = match self.storage.find_by_id(&entry.job_id).await {
            Ok(job) => job,
            Err(StorageError::NotFound(_)) => {
                warn!(job_id = %entry.job_id, "queued job no longer in store");
                return self.queue.fail(&entry.job_id).await;
            }
            Err(e) => {
                error!(job_id = %entry.job_id, "store read failed: {e}");
                self.queue.retry(&entry).await?;
                return Ok(());
            }
        };

        match job.state {
            JobState::Queued => {
                if let Err(e) = self.storage.mark_started(&job.id).await {
                    // Lost the race against cancellation.
                    debug!(job_id = %job.id, "start transition rejected: {e}");
                    return self.queue.complete(&job.id).await;
                }
            }
            // Redelivery of an attempt that already started.
            JobState::Running => {}
            _ => {
                debug!(job_id = %job.id, state = job.state.as_str(), "dropping terminal job entry");
                return self.queue.complete(&job.id).await;
            }
        }

        let profile = profile_from_options(&job.options);
        match self.pool.execute_code(&job.id, &job.code, &profile).await {
            Ok(outcome) => self.write_terminal(&job, &entry, outcome).await,
            Err(e) => {
                // No sandbox slot or pool shutting down: leave the job
                // Running and let the backoff schedule another attempt.
                warn!(job_id = %job.id, "sandbox scheduling failed: {e}");
                if !self.queue.retry(&entry).await? {
                    self.fail_quietly(&job.id, &format!("execution could not be scheduled: {e}"), None)
                        .await;
                }
                Ok(())
            }
        }
    }

    async fn write_terminal(
        &self,
        job: &Job,
        entry: &QueueEntry,
        outcome: ExecutionOutcome,
    ) -> crate::queue::Result<()> {
        let time_ms = outcome.execution_time_ms as i64;

        if outcome.timed_out {
            if let Err(e) = self
                .storage
                .mark_timeout(
                    &job.id,
                    Some(&outcome.stdout),
                    Some(&outcome.stderr),
                    Some(time_ms),
                )
                .await
            {
                debug!(job_id = %job.id, "timeout write lost race: {e}");
            }
            return self.queue.complete(&job.id).await;
        }

        if let Some(error) = &outcome.error {
            // Setup failure, not a property of the submitted code: retry.
            warn!(job_id = %job.id, "sandbox setup failed: {error}");
            if !self.queue.retry(entry).await? {
                self.fail_quietly(&job.id, error, Some(time_ms)).await;
            }
            return Ok(());
        }

        if outcome.success {
            if let Err(e) = self
                .storage
                .mark_completed(
                    &job.id,
                    &outcome.stdout,
                    &outcome.stderr,
                    outcome.exit_code.unwrap_or(0),
                    time_ms,
                    outcome.memory_bytes.map(|b| b as i64),
                )
                .await
            {
                debug!(job_id = %job.id, "completed write lost race: {e}");
            }
        } else if let Err(e) = self
            .storage
            .mark_failed(&job.id, &outcome.stderr, outcome.exit_code, Some(time_ms))
            .await
        {
            debug!(job_id = %job.id, "failed write lost race: {e}");
        }
        self.queue.complete(&job.id).await
    }

    async fn fail_quietly(&self, job_id: &str, message: &str, time_ms: Option<i64>) {
        if let Err(e) = self.storage.mark_failed(job_id, message, None, time_ms).await {
            debug!(job_id, "fail write skipped: {e}");
        }
    }
}

/// Convert stored options into the sandbox resource profile.
pub fn profile_from_options(options: &JobOptions) -> ResourceProfile {
    ResourceProfile {
        memory_bytes: parse_memory_limit(&options.memory_limit).unwrap_or(128 * 1024 * 1024),
        cpu_cores: options.cpu_limit,
        wall_timeout_ms: options.wall_timeout_ms,
        pids_limit: options.process_count_limit,
        compiler_flags: options.compiler_flags.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PRIORITY_NORMAL;
    use crate::test_support::InMemoryQueue;
    use async_trait::async_trait;
    use codehive_sandbox::{MetricsRing, Runner};
    use sqlx::sqlite::SqlitePoolOptions;

    struct ScriptedRunner {
        outcome: ExecutionOutcome,
    }

    #[async_trait]
    impl Runner for ScriptedRunner {
        async fn execute(
            &self,
            _job_id: &str,
            _source: &str,
            _profile: &ResourceProfile,
            _metrics: MetricsRing,
            _stop: watch::Receiver<bool>,
        ) -> ExecutionOutcome {
            self.outcome.clone()
        }
    }

    async fn fixture(outcome: ExecutionOutcome) -> (Arc<JobWorkers>, Arc<JobStorage>, Arc<InMemoryQueue>) {
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
        let container_pool = Arc::new(ContainerPool::new(
            Arc::new(ScriptedRunner { outcome }),
            5,
        ));
        let workers = Arc::new(JobWorkers::new(
            storage.clone(),
            queue.clone(),
            container_pool,
        ));
        (workers, storage, queue)
    }

    async fn enqueue_job(storage: &JobStorage, queue: &InMemoryQueue) -> Job {
        let job = storage
            .create("room-1", "alice", "int main() {}", &JobOptions::default())
            .await
            .unwrap();
        queue
            .enqueue(QueueEntry {
                job_id: job.id.clone(),
                priority: PRIORITY_NORMAL,
                attempts_made: 0,
                max_attempts: 3,
                backoff_ms: 1,
                attempt_timeout_ms: 35_000,
            })
            .await
            .unwrap();
        job
    }

    fn completed_outcome() -> ExecutionOutcome {
        ExecutionOutcome {
            success: true,
            stdout: "Hello".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            execution_time_ms: 42,
            memory_bytes: Some(1 << 20),
            timed_out: false,
            error: None,
        }
    }

    #[tokio::test]
    async fn successful_run_completes_job() {
        let (workers, storage, queue) = fixture(completed_outcome()).await;
        let job = enqueue_job(&storage, &queue).await;

        assert!(workers.process_one(true).await.unwrap());

        let job = storage.find_by_id(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.stdout.as_deref(), Some("Hello"));
        assert_eq!(job.memory_bytes, Some(1 << 20));
        assert_eq!(queue.stats().await.unwrap().completed, 1);

        // Nothing left to do.
        assert!(!workers.process_one(true).await.unwrap());
    }

    #[tokio::test]
    async fn nonzero_exit_fails_job() {
        let outcome = ExecutionOutcome {
            success: false,
            stderr: "main.cpp:1:1: error: expected declaration".to_string(),
            exit_code: Some(1),
            execution_time_ms: 30,
            ..Default::default()
        };
        let (workers, storage, queue) = fixture(outcome).await;
        let job = enqueue_job(&storage, &queue).await;

        workers.process_one(true).await.unwrap();

        let job = storage.find_by_id(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.stderr.unwrap().contains("error"));
        assert_eq!(job.exit_code, Some(1));
    }

    #[tokio::test]
    async fn timed_out_run_marks_timeout() {
        let outcome = ExecutionOutcome {
            success: false,
            stdout: "partial".to_string(),
            execution_time_ms: 3_050,
            timed_out: true,
            ..Default::default()
        };
        let (workers, storage, queue) = fixture(outcome).await;
        let job = enqueue_job(&storage, &queue).await;

        workers.process_one(true).await.unwrap();

        let job = storage.find_by_id(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Timeout);
        let result = job.result().unwrap();
        assert!(result.timed_out);
        assert!(result.execution_time_ms.unwrap() >= 3_000);
    }

    #[tokio::test]
    async fn cancelled_job_is_never_executed() {
        let (workers, storage, queue) = fixture(completed_outcome()).await;
        let job = enqueue_job(&storage, &queue).await;
        storage.cancel(&job.id).await.unwrap();

        workers.process_one(true).await.unwrap();

        // The entry was dropped without a start transition.
        let job = storage.find_by_id(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn setup_errors_retry_then_fail() {
        let outcome = ExecutionOutcome {
            success: false,
            error: Some("docker unreachable".to_string()),
            ..Default::default()
        };
        let (workers, storage, queue) = fixture(outcome).await;
        let job = enqueue_job(&storage, &queue).await;

        // Attempt 1 and 2 reschedule with backoff, attempt 3 exhausts.
        workers.process_one(true).await.unwrap();
        assert_eq!(storage.find_by_id(&job.id).await.unwrap().state, JobState::Running);

        queue.promote_all_delayed().await;
        workers.process_one(true).await.unwrap();
        queue.promote_all_delayed().await;
        workers.process_one(true).await.unwrap();

        let job = storage.find_by_id(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.stderr.unwrap().contains("docker unreachable"));
        assert_eq!(queue.stats().await.unwrap().failed, 1);
    }

    #[test]
    fn profile_mirrors_options() {
        let options = JobOptions {
            memory_limit: "64m".to_string(),
            cpu_limit: 1.5,
            wall_timeout_ms: 5_000,
            process_count_limit: 16,
            compiler_flags: vec!["-O2".to_string()],
        };
        let profile = profile_from_options(&options);
        assert_eq!(profile.memory_bytes, 64 * 1024 * 1024);
        assert_eq!(profile.cpu_cores, 1.5);
        assert_eq!(profile.wall_timeout_ms, 5_000);
        assert_eq!(profile.pids_limit, 16);
        assert_eq!(profile.compiler_flags, vec!["-O2"]);
    }
}
