// ABOUTME: Durable priority FIFO over Redis sorted sets
// ABOUTME: Buckets: waiting, active (leased), delayed (retry), completed, failed

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Default priority class. Lower values pop first.
pub const PRIORITY_NORMAL: u8 = 5;

/// Width of one priority band in the waiting-set score. FIFO order within a
/// band comes from a monotonic sequence number.
const PRIORITY_BAND: f64 = (1u64 << 40) as f64;

/// One queued unit of work. The payload is only the job id plus retry
/// bookkeeping; job state lives in the Job Store alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: String,
    pub priority: u8,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// First retry delay; doubled per subsequent attempt.
    pub backoff_ms: u64,
    /// Lease duration per attempt (wall timeout + dispatch grace).
    pub attempt_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// Entries whose state changed during queue maintenance.
#[derive(Debug, Default)]
pub struct MaintenanceReport {
    /// Expired active leases that went back to waiting for another attempt.
    pub requeued: Vec<String>,
    /// Expired active leases with no attempts left; callers must fail the job.
    pub exhausted: Vec<String>,
}

/// Operation surface of the durable queue. The Redis implementation is the
/// production backend; tests drive the dispatcher and workers through an
/// in-memory double.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, entry: QueueEntry) -> Result<()>;
    /// 0-based rank among waiting entries.
    async fn position(&self, job_id: &str) -> Result<Option<u64>>;
    /// Remove a waiting entry (queued-state cancellation).
    async fn remove_waiting(&self, job_id: &str) -> Result<bool>;
    /// Remove an entry regardless of bucket (supervisor force-timeout).
    async fn remove_anywhere(&self, job_id: &str) -> Result<()>;
    /// Promote due delayed entries and reclaim expired leases.
    async fn maintain(&self) -> Result<MaintenanceReport>;
    /// Pop the highest-priority waiting entry and lease it.
    async fn pop_ready(&self) -> Result<Option<QueueEntry>>;
    /// Finish an active lease into the completed bucket.
    async fn complete(&self, job_id: &str) -> Result<()>;
    /// Finish an active lease into the failed bucket.
    async fn fail(&self, job_id: &str) -> Result<()>;
    /// Schedule another attempt with exponential backoff. Returns false (and
    /// moves the entry to the failed bucket) when attempts are exhausted.
    async fn retry(&self, entry: &QueueEntry) -> Result<bool>;
    async fn stats(&self) -> Result<QueueStats>;
    /// Drop completed/failed bucket entries older than `older_than_ms`.
    async fn cleanup_finished(&self, older_than_ms: u64) -> Result<u64>;
    async fn ping(&self) -> Result<()>;
}

/// Redis realization of the queue contract.
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, "codehive:compile"))
    }

    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
        }
    }

    fn key(&self, bucket: &str) -> String {
        format!("{}:{}", self.prefix, bucket)
    }

    fn entry_key(&self, job_id: &str) -> String {
        format!("{}:entry:{}", self.prefix, job_id)
    }

    async fn load_entry(&self, job_id: &str) -> Result<Option<QueueEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.entry_key(job_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn store_entry(&self, entry: &QueueEntry) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(entry)?;
        let _: () = conn.set(self.entry_key(&entry.job_id), raw).await?;
        Ok(())
    }

    async fn add_waiting(&self, entry: &QueueEntry) -> Result<()> {
        let mut conn = self.conn.clone();
        let seq: u64 = conn.incr(self.key("seq"), 1u64).await?;
        let score = entry.priority as f64 * PRIORITY_BAND + seq as f64;
        let _: () = conn
            .zadd(self.key("waiting"), &entry.job_id, score)
            .await?;
        Ok(())
    }
}

fn now_ms() -> f64 {
    Utc::now().timestamp_millis() as f64
}

#[async_trait]
impl Queue for RedisJobQueue {
    async fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        self.store_entry(&entry).await?;
        self.add_waiting(&entry).await
    }

    async fn position(&self, job_id: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let rank: Option<i64> = conn.zrank(self.key("waiting"), job_id).await?;
        Ok(rank.map(|r| r as u64))
    }

    async fn remove_waiting(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(self.key("waiting"), job_id).await?;
        if removed > 0 {
            let _: () = conn.del(self.entry_key(job_id)).await?;
        }
        Ok(removed > 0)
    }

    async fn remove_anywhere(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        for bucket in ["waiting", "active", "delayed"] {
            let _: i64 = conn.zrem(self.key(bucket), job_id).await?;
        }
        let _: () = conn.del(self.entry_key(job_id)).await?;
        Ok(())
    }

    async fn maintain(&self) -> Result<MaintenanceReport> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let mut report = MaintenanceReport::default();

        // Promote delayed entries whose backoff elapsed.
        let due: Vec<String> = conn
            .zrangebyscore(self.key("delayed"), f64::MIN, now)
            .await?;
        for job_id in due {
            let _: i64 = conn.zrem(self.key("delayed"), &job_id).await?;
            match self.load_entry(&job_id).await? {
                Some(entry) => self.add_waiting(&entry).await?,
                None => warn!(job_id, "delayed entry vanished during promotion"),
            }
        }

        // Reclaim expired leases: the worker died or stalled past its
        // per-attempt timeout.
        let expired: Vec<String> = conn
            .zrangebyscore(self.key("active"), f64::MIN, now)
            .await?;
        for job_id in expired {
            let _: i64 = conn.zrem(self.key("active"), &job_id).await?;
            let Some(mut entry) = self.load_entry(&job_id).await? else {
                continue;
            };
            entry.attempts_made += 1;
            if entry.attempts_made >= entry.max_attempts {
                let _: () = conn.zadd(self.key("failed"), &job_id, now).await?;
                let _: () = conn.del(self.entry_key(&job_id)).await?;
                report.exhausted.push(job_id);
            } else {
                self.store_entry(&entry).await?;
                self.add_waiting(&entry).await?;
                report.requeued.push(job_id);
            }
        }

        Ok(report)
    }

    async fn pop_ready(&self) -> Result<Option<QueueEntry>> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(self.key("waiting"), 1).await?;
        let Some((job_id, _)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let Some(entry) = self.load_entry(&job_id).await? else {
            warn!(job_id, "waiting entry without payload, dropping");
            return Ok(None);
        };

        let deadline = now_ms() + entry.attempt_timeout_ms as f64;
        let _: () = conn.zadd(self.key("active"), &job_id, deadline).await?;
        Ok(Some(entry))
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(self.key("active"), job_id).await?;
        let _: () = conn.zadd(self.key("completed"), job_id, now_ms()).await?;
        let _: () = conn.del(self.entry_key(job_id)).await?;
        Ok(())
    }

    async fn fail(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(self.key("active"), job_id).await?;
        let _: () = conn.zadd(self.key("failed"), job_id, now_ms()).await?;
        let _: () = conn.del(self.entry_key(job_id)).await?;
        Ok(())
    }

    async fn retry(&self, entry: &QueueEntry) -> Result<bool> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(self.key("active"), &entry.job_id).await?;

        let mut next = entry.clone();
        next.attempts_made += 1;
        if next.attempts_made >= next.max_attempts {
            let _: () = conn.zadd(self.key("failed"), &entry.job_id, now_ms()).await?;
            let _: () = conn.del(self.entry_key(&entry.job_id)).await?;
            return Ok(false);
        }

        // 2s, 4s, 8s, ... per subsequent attempt.
        let backoff = next.backoff_ms.saturating_mul(1 << (next.attempts_made - 1));
        self.store_entry(&next).await?;
        let _: () = conn
            .zadd(self.key("delayed"), &next.job_id, now_ms() + backoff as f64)
            .await?;
        Ok(true)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let waiting: u64 = conn.zcard(self.key("waiting")).await?;
        let active: u64 = conn.zcard(self.key("active")).await?;
        let completed: u64 = conn.zcard(self.key("completed")).await?;
        let failed: u64 = conn.zcard(self.key("failed")).await?;
        let delayed: u64 = conn.zcard(self.key("delayed")).await?;
        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    async fn cleanup_finished(&self, older_than_ms: u64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let cutoff = now_ms() - older_than_ms as f64;
        let completed: u64 = conn
            .zrembyscore(self.key("completed"), f64::MIN, cutoff)
            .await?;
        let failed: u64 = conn
            .zrembyscore(self.key("failed"), f64::MIN, cutoff)
            .await?;
        Ok(completed + failed)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_through_json() {
        let entry = QueueEntry {
            job_id: "job-1".to_string(),
            priority: PRIORITY_NORMAL,
            attempts_made: 1,
            max_attempts: 3,
            backoff_ms: 2000,
            attempt_timeout_ms: 35_000,
        };
        let raw = serde_json::to_string(&entry).unwrap();
        assert_eq!(serde_json::from_str::<QueueEntry>(&raw).unwrap(), entry);
    }

    #[test]
    fn priority_bands_preserve_fifo_within_class() {
        // Same priority: sequence decides. Lower priority value always wins.
        let score = |priority: u8, seq: u64| priority as f64 * PRIORITY_BAND + seq as f64;
        assert!(score(5, 1) < score(5, 2));
        assert!(score(1, 1_000_000) < score(5, 1));
    }
}
