// ABOUTME: Container pool manager bounding concurrent sandbox runs
// ABOUTME: Tracks live executions, publishes lifecycle events, reaps orphans

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::runner::{MetricsRing, Runner};
use crate::types::{
    ExecutionOutcome, LifecycleEvent, LifecycleEventKind, MetricsSample, ResourceProfile,
};

/// Samples retained per job.
pub const METRICS_RING_CAPACITY: usize = 60;

/// Completed run records are dropped after this long.
const RECORD_RETENTION: chrono::Duration = chrono::Duration::hours(1);

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Sandbox capacity exceeded ({0} live runs)")]
    CapacityExceeded(usize),
    #[error("Pool is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Completed,
    Failed,
    Stopped,
}

struct RunRecord {
    state: RunState,
    finished_at: Option<DateTime<Utc>>,
    metrics: MetricsRing,
}

/// Admission-controls sandbox runs across all dispatchers and keeps the
/// registry the reaper sweeps against.
pub struct ContainerPool {
    runner: Arc<dyn Runner>,
    max_concurrent: usize,
    runs: RwLock<HashMap<String, RunRecord>>,
    events: broadcast::Sender<LifecycleEvent>,
    stop_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
}

impl ContainerPool {
    pub fn new(runner: Arc<dyn Runner>, max_concurrent: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (stop_tx, _) = watch::channel(false);
        Self {
            runner,
            max_concurrent,
            runs: RwLock::new(HashMap::new()),
            events,
            stop_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Run one job through the sandbox. Fails fast when the pool is at
    /// capacity or shutting down; otherwise blocks until the run finishes.
    pub async fn execute_code(
        &self,
        job_id: &str,
        source: &str,
        profile: &ResourceProfile,
    ) -> Result<ExecutionOutcome> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }

        let metrics: MetricsRing = Arc::new(Mutex::new(VecDeque::new()));
        {
            let mut runs = self.runs.write().await;
            let live = runs
                .values()
                .filter(|r| r.state == RunState::Running)
                .count();
            if live >= self.max_concurrent {
                return Err(PoolError::CapacityExceeded(live));
            }
            runs.insert(
                job_id.to_string(),
                RunRecord {
                    state: RunState::Running,
                    finished_at: None,
                    metrics: metrics.clone(),
                },
            );
        }

        self.emit(job_id, LifecycleEventKind::Queued);
        self.emit(job_id, LifecycleEventKind::Started);

        let outcome = self
            .runner
            .execute(job_id, source, profile, metrics, self.stop_tx.subscribe())
            .await;

        let kind = if self.shutting_down.load(Ordering::SeqCst) && outcome.error.is_some() {
            LifecycleEventKind::Stopped
        } else if outcome.error.is_some() {
            LifecycleEventKind::Failed
        } else {
            LifecycleEventKind::Completed
        };

        {
            let mut runs = self.runs.write().await;
            if let Some(record) = runs.get_mut(job_id) {
                record.state = match kind {
                    LifecycleEventKind::Failed => RunState::Failed,
                    LifecycleEventKind::Stopped => RunState::Stopped,
                    _ => RunState::Completed,
                };
                record.finished_at = Some(Utc::now());
            }
        }
        self.emit(job_id, kind);

        Ok(outcome)
    }

    /// Recent resource samples for a job, oldest first.
    pub async fn metrics(&self, job_id: &str) -> Option<Vec<MetricsSample>> {
        let runs = self.runs.read().await;
        runs.get(job_id).map(|record| {
            let ring = record.metrics.lock().unwrap_or_else(|p| p.into_inner());
            ring.iter().copied().collect()
        })
    }

    pub async fn live_count(&self) -> usize {
        let runs = self.runs.read().await;
        runs.values()
            .filter(|r| r.state == RunState::Running)
            .count()
    }

    pub async fn live_job_ids(&self) -> HashSet<String> {
        let runs = self.runs.read().await;
        runs.iter()
            .filter(|(_, r)| r.state == RunState::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Refuse new runs, signal live sandboxes to stop and wait for them to
    /// drain (bounded).
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while self.live_count().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!("pool shutdown timed out with live sandboxes remaining");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Final reap: nothing is live anymore, anything labeled is an orphan.
        if let Err(e) = self.runner.reap_orphans(&HashSet::new()).await {
            error!("final sandbox reap failed: {e}");
        }
        info!("container pool drained");
    }

    /// Periodic sweep: drop stale finished records and remove any sandbox
    /// whose controlling job is no longer live.
    pub fn start_reaper(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if pool.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                pool.sweep_records().await;

                let live = pool.live_job_ids().await;
                match pool.runner.reap_orphans(&live).await {
                    Ok(0) => {}
                    Ok(reaped) => warn!(reaped, "reaped orphaned sandboxes"),
                    Err(e) => error!("sandbox reaper failed: {e}"),
                }
            }
        });
    }

    async fn sweep_records(&self) {
        let cutoff = Utc::now() - RECORD_RETENTION;
        let mut runs = self.runs.write().await;
        runs.retain(|_, record| {
            record.state == RunState::Running
                || record.finished_at.map(|at| at >= cutoff).unwrap_or(true)
        });
    }

    fn emit(&self, job_id: &str, kind: LifecycleEventKind) {
        // Best-effort: nothing may be listening.
        let _ = self.events.send(LifecycleEvent::now(job_id, kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Runner double with a configurable delay and canned outcome.
    struct MockRunner {
        delay: Duration,
        outcome: ExecutionOutcome,
    }

    impl MockRunner {
        fn instant_ok() -> Self {
            Self {
                delay: Duration::ZERO,
                outcome: ExecutionOutcome {
                    success: true,
                    stdout: "ok".to_string(),
                    exit_code: Some(0),
                    ..Default::default()
                },
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::instant_ok()
            }
        }
    }

    #[async_trait]
    impl Runner for MockRunner {
        async fn execute(
            &self,
            _job_id: &str,
            _source: &str,
            _profile: &ResourceProfile,
            metrics: MetricsRing,
            mut stop: watch::Receiver<bool>,
        ) -> ExecutionOutcome {
            crate::runner::push_sample(
                &metrics,
                MetricsSample {
                    at: Utc::now(),
                    cpu_percent: 1.0,
                    memory_bytes: 1024,
                },
            );
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => self.outcome.clone(),
                _ = stop.changed() => ExecutionOutcome {
                    success: false,
                    error: Some("sandbox stopped during shutdown".to_string()),
                    ..Default::default()
                },
            }
        }
    }

    #[tokio::test]
    async fn rejects_beyond_capacity() {
        let pool = Arc::new(ContainerPool::new(
            Arc::new(MockRunner::slow(Duration::from_secs(5))),
            1,
        ));

        let busy = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            busy.execute_code("job-1", "", &ResourceProfile::default())
                .await
        });

        // Let the first run occupy the only slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.live_count().await, 1);

        let rejected = pool
            .execute_code("job-2", "", &ResourceProfile::default())
            .await;
        assert!(matches!(rejected, Err(PoolError::CapacityExceeded(1))));

        handle.abort();
    }

    #[tokio::test]
    async fn publishes_lifecycle_events_in_order() {
        let pool = ContainerPool::new(Arc::new(MockRunner::instant_ok()), 5);
        let mut events = pool.subscribe();

        let outcome = pool
            .execute_code("job-1", "", &ResourceProfile::default())
            .await
            .unwrap();
        assert!(outcome.success);

        let kinds: Vec<_> = (0..3).map(|_| events.try_recv().unwrap().kind).collect();
        assert_eq!(
            kinds,
            vec![
                LifecycleEventKind::Queued,
                LifecycleEventKind::Started,
                LifecycleEventKind::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn keeps_bounded_metrics_for_finished_runs() {
        let pool = ContainerPool::new(Arc::new(MockRunner::instant_ok()), 5);
        pool.execute_code("job-1", "", &ResourceProfile::default())
            .await
            .unwrap();

        let samples = pool.metrics("job-1").await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].memory_bytes, 1024);
        assert!(pool.metrics("unknown").await.is_none());
    }

    #[tokio::test]
    async fn shutdown_refuses_new_runs_and_stops_live_ones() {
        let pool = Arc::new(ContainerPool::new(
            Arc::new(MockRunner::slow(Duration::from_secs(30))),
            5,
        ));

        let busy = Arc::clone(&pool);
        let live = tokio::spawn(async move {
            busy.execute_code("job-1", "", &ResourceProfile::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.shutdown().await;
        assert!(matches!(
            pool.execute_code("job-2", "", &ResourceProfile::default())
                .await,
            Err(PoolError::ShuttingDown)
        ));

        let outcome = live.await.unwrap().unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
        assert_eq!(pool.live_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_drops_stale_finished_records() {
        let pool = ContainerPool::new(Arc::new(MockRunner::instant_ok()), 5);
        pool.execute_code("job-1", "", &ResourceProfile::default())
            .await
            .unwrap();

        // Backdate the finish, then sweep.
        {
            let mut runs = pool.runs.write().await;
            runs.get_mut("job-1").unwrap().finished_at =
                Some(Utc::now() - chrono::Duration::hours(2));
        }
        pool.sweep_records().await;
        assert!(pool.metrics("job-1").await.is_none());
    }
}
