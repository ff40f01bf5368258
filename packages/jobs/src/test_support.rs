// ABOUTME: In-memory queue double mirroring the Redis bucket semantics
// ABOUTME: Lets dispatcher, worker and supervisor tests run without Redis

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::queue::{MaintenanceReport, Queue, QueueEntry, QueueStats, Result};

#[derive(Default)]
struct State {
    seq: u64,
    /// (score, job_id), kept sorted ascending on pop.
    waiting: Vec<(f64, String)>,
    /// job_id -> lease deadline ms.
    active: HashMap<String, f64>,
    /// job_id -> promote-at ms.
    delayed: HashMap<String, f64>,
    completed: Vec<String>,
    failed: Vec<String>,
    entries: HashMap<String, QueueEntry>,
    /// Extra synthetic depth for saturation tests.
    padding: u64,
}

/// Test double with the same bucket semantics as `RedisJobQueue`.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
}

const PRIORITY_BAND: f64 = (1u64 << 40) as f64;

fn now_ms() -> f64 {
    Utc::now().timestamp_millis() as f64
}

impl InMemoryQueue {
    /// Pretend `n` entries are already waiting.
    pub async fn saturate(&self, n: u64) {
        self.state.lock().unwrap().padding = n;
    }

    /// Promote every delayed entry immediately, ignoring its backoff.
    pub async fn promote_all_delayed(&self) {
        let mut state = self.state.lock().unwrap();
        let due: Vec<String> = state.delayed.drain().map(|(id, _)| id).collect();
        for job_id in due {
            if let Some(entry) = state.entries.get(&job_id).cloned() {
                state.seq += 1;
                let score = entry.priority as f64 * PRIORITY_BAND + state.seq as f64;
                state.waiting.push((score, job_id));
            }
        }
        state.waiting.sort_by(|a, b| a.0.total_cmp(&b.0));
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let score = entry.priority as f64 * PRIORITY_BAND + state.seq as f64;
        state.waiting.push((score, entry.job_id.clone()));
        state.waiting.sort_by(|a, b| a.0.total_cmp(&b.0));
        state.entries.insert(entry.job_id.clone(), entry);
        Ok(())
    }

    async fn position(&self, job_id: &str) -> Result<Option<u64>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .waiting
            .iter()
            .position(|(_, id)| id == job_id)
            .map(|p| p as u64))
    }

    async fn remove_waiting(&self, job_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.waiting.len();
        state.waiting.retain(|(_, id)| id != job_id);
        let removed = state.waiting.len() < before;
        if removed {
            state.entries.remove(job_id);
        }
        Ok(removed)
    }

    async fn remove_anywhere(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.waiting.retain(|(_, id)| id != job_id);
        state.active.remove(job_id);
        state.delayed.remove(job_id);
        state.entries.remove(job_id);
        Ok(())
    }

    async fn maintain(&self) -> Result<MaintenanceReport> {
        let mut state = self.state.lock().unwrap();
        let now = now_ms();
        let mut report = MaintenanceReport::default();

        let due: Vec<String> = state
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for job_id in due {
            state.delayed.remove(&job_id);
            if let Some(entry) = state.entries.get(&job_id).cloned() {
                state.seq += 1;
                let score = entry.priority as f64 * PRIORITY_BAND + state.seq as f64;
                state.waiting.push((score, job_id));
            }
        }
        state.waiting.sort_by(|a, b| a.0.total_cmp(&b.0));

        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for job_id in expired {
            state.active.remove(&job_id);
            let Some(mut entry) = state.entries.get(&job_id).cloned() else {
                continue;
            };
            entry.attempts_made += 1;
            if entry.attempts_made >= entry.max_attempts {
                state.entries.remove(&job_id);
                state.failed.push(job_id.clone());
                report.exhausted.push(job_id);
            } else {
                state.seq += 1;
                let score = entry.priority as f64 * PRIORITY_BAND + state.seq as f64;
                state.entries.insert(job_id.clone(), entry);
                state.waiting.push((score, job_id.clone()));
                report.requeued.push(job_id);
            }
        }
        state.waiting.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(report)
    }

    async fn pop_ready(&self) -> Result<Option<QueueEntry>> {
        let mut state = self.state.lock().unwrap();
        if state.waiting.is_empty() {
            return Ok(None);
        }
        let (_, job_id) = state.waiting.remove(0);
        let Some(entry) = state.entries.get(&job_id).cloned() else {
            return Ok(None);
        };
        state
            .active
            .insert(job_id, now_ms() + entry.attempt_timeout_ms as f64);
        Ok(Some(entry))
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.active.remove(job_id);
        state.entries.remove(job_id);
        state.completed.push(job_id.to_string());
        Ok(())
    }

    async fn fail(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.active.remove(job_id);
        state.entries.remove(job_id);
        state.failed.push(job_id.to_string());
        Ok(())
    }

    async fn retry(&self, entry: &QueueEntry) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.active.remove(&entry.job_id);

        let mut next = entry.clone();
        next.attempts_made += 1;
        if next.attempts_made >= next.max_attempts {
            state.entries.remove(&entry.job_id);
            state.failed.push(entry.job_id.clone());
            return Ok(false);
        }
        let backoff = next.backoff_ms.saturating_mul(1 << (next.attempts_made - 1));
        state
            .delayed
            .insert(entry.job_id.clone(), now_ms() + backoff as f64);
        state.entries.insert(entry.job_id.clone(), next);
        Ok(true)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().unwrap();
        Ok(QueueStats {
            waiting: state.waiting.len() as u64 + state.padding,
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            delayed: state.delayed.len() as u64,
        })
    }

    async fn cleanup_finished(&self, _older_than_ms: u64) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let purged = (state.completed.len() + state.failed.len()) as u64;
        state.completed.clear();
        state.failed.clear();
        Ok(purged)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
