// ABOUTME: Resource profiles, execution outcomes and pool lifecycle events
// ABOUTME: Shared vocabulary between the runner, the pool and the job workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource limits for a single sandbox run. All fields are mandatory; the
/// dispatcher produces fully populated profiles after admission.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceProfile {
    pub memory_bytes: u64,
    pub cpu_cores: f64,
    pub wall_timeout_ms: u64,
    pub pids_limit: u32,
    pub compiler_flags: Vec<String>,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024,
            cpu_cores: 0.5,
            wall_timeout_ms: 30_000,
            pids_limit: 32,
            compiler_flags: vec![
                "-std=c++17".to_string(),
                "-Wall".to_string(),
                "-Wextra".to_string(),
            ],
        }
    }
}

/// Result of one sandbox run. `error` is only set for pre-run/setup failures;
/// compile and runtime failures surface through `exit_code` and `stderr`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub execution_time_ms: u64,
    pub memory_bytes: Option<u64>,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn setup_failure(message: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            execution_time_ms,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// One resource usage sample captured while a sandbox runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricsSample {
    pub at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Queued,
    Started,
    Completed,
    Failed,
    Stopped,
}

/// Lifecycle event published by the pool for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub job_id: String,
    pub kind: LifecycleEventKind,
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn now(job_id: &str, kind: LifecycleEventKind) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind,
            at: Utc::now(),
        }
    }
}
