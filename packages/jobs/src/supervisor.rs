// ABOUTME: Background supervisor forcing overdue runs into Timeout
// ABOUTME: Also drives the periodic queue and store cleanup; loops never stop

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::queue::{Queue, QueueError};
use crate::storage::{JobStorage, StorageError};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Grace beyond the per-job wall timeout before a Running job is forced to
/// Timeout. Fixed for determinism.
pub const STUCK_GRACE_MS: i64 = 30_000;

const STUCK_SCAN_INTERVAL: Duration = Duration::from_secs(30);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// Finished queue buckets are purged past this age.
const QUEUE_RETENTION_MS: u64 = 60 * 60 * 1000;
/// Terminal store rows are purged past this age, in days.
const STORE_RETENTION_DAYS: i64 = 7;

pub struct Supervisor {
    storage: Arc<JobStorage>,
    queue: Arc<dyn Queue>,
}

impl Supervisor {
    pub fn new(storage: Arc<JobStorage>, queue: Arc<dyn Queue>) -> Self {
        Self { storage, queue }
    }

    /// Spawn the stuck-job scan and the cleanup loop. Failures are logged and
    /// the loops keep running.
    pub fn start(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STUCK_SCAN_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match supervisor.sweep_stuck().await {
                    Ok(0) => {}
                    Ok(n) => warn!(count = n, "forced overdue jobs to timeout"),
                    Err(e) => error!("stuck-job sweep failed: {e}"),
                }
            }
        });

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(e) = supervisor.run_cleanup().await {
                    error!("periodic cleanup failed: {e}");
                }
            }
        });

        info!("background supervisor started");
    }

    /// Force Running jobs past `wall_timeout + grace` into Timeout and drop
    /// their queue entries. Returns the number of jobs advanced.
    pub async fn sweep_stuck(&self) -> Result<u64> {
        let running = self.storage.find_running_jobs().await?;
        let now = Utc::now();

        let mut forced = 0u64;
        for job in running {
            let Some(started_at) = job.started_at else {
                continue;
            };
            let elapsed_ms = (now - started_at).num_milliseconds();
            if elapsed_ms <= job.options.wall_timeout_ms as i64 + STUCK_GRACE_MS {
                continue;
            }

            warn!(job_id = %job.id, elapsed_ms, "job overdue, forcing timeout");
            if let Err(e) = self
                .storage
                .mark_timeout(&job.id, None, None, Some(elapsed_ms))
                .await
            {
                // The worker's terminal write may have landed first.
                warn!(job_id = %job.id, "timeout write skipped: {e}");
                continue;
            }
            if let Err(e) = self.queue.remove_anywhere(&job.id).await {
                error!(job_id = %job.id, "queue removal failed: {e}");
            }
            forced += 1;
        }
        Ok(forced)
    }

    pub async fn run_cleanup(&self) -> Result<()> {
        let purged = self.queue.cleanup_finished(QUEUE_RETENTION_MS).await?;
        let deleted = self.storage.delete_older_than(STORE_RETENTION_DAYS).await?;
        if purged > 0 || deleted > 0 {
            info!(purged, deleted, "supervisor cleanup");
        }
        Ok(())
    }
}
