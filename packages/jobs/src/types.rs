// ABOUTME: Job entity, lifecycle states and effective execution options
// ABOUTME: Shared between the store, dispatcher, workers and the API layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// Largest accepted source payload, in bytes.
pub const MAX_CODE_BYTES: usize = 100 * 1024;

/// Lifecycle states of a compile job. Only `Queued` and `Running` are
/// non-terminal; a terminal state is write-once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(StorageError::InvalidState(s.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    /// API-facing label, e.g. `"Queued"`.
    pub fn label(&self) -> &str {
        match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Effective execution options. After admission every field is populated;
/// partial caller input only exists at the API boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub wall_timeout_ms: u64,
    pub process_count_limit: u32,
    pub compiler_flags: Vec<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            memory_limit: "128m".to_string(),
            cpu_limit: 0.5,
            wall_timeout_ms: 30_000,
            process_count_limit: 32,
            compiler_flags: vec![
                "-std=c++17".to_string(),
                "-Wall".to_string(),
                "-Wextra".to_string(),
            ],
        }
    }
}

/// One compile/execute submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub code: String,
    pub options: JobOptions,
    pub state: JobState,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub memory_bytes: Option<i64>,
}

/// Result view returned for terminal jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub execution_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,
    pub timed_out: bool,
}

impl Job {
    /// Stored result, present once the job reached a terminal state other
    /// than `Cancelled`-before-start.
    pub fn result(&self) -> Option<JobResult> {
        if !self.state.is_terminal() {
            return None;
        }
        Some(JobResult {
            stdout: self.stdout.clone().unwrap_or_default(),
            stderr: self.stderr.clone().unwrap_or_default(),
            exit_code: self.exit_code,
            execution_time_ms: self.execution_time_ms,
            memory_bytes: self.memory_bytes,
            timed_out: self.state == JobState::Timeout,
        })
    }
}
