// ABOUTME: Job execution pipeline: store, durable queue, dispatcher, workers
// ABOUTME: The queue owns pending work; the store owns state; workers bridge both

pub mod dispatcher;
pub mod queue;
pub mod storage;
pub mod supervisor;
pub mod test_support;
pub mod types;
pub mod worker;

pub use dispatcher::{
    effective_options, DispatchError, DispatcherConfig, ExecutionDispatcher, JobOptionsPatch,
    JobStatus,
};
pub use queue::{Queue, QueueEntry, QueueError, QueueStats, RedisJobQueue, PRIORITY_NORMAL};
pub use storage::{JobStorage, StorageError, SCHEMA as JOBS_SCHEMA};
pub use supervisor::{Supervisor, SupervisorError, STUCK_GRACE_MS};
pub use types::{Job, JobOptions, JobResult, JobState, MAX_CODE_BYTES};
pub use worker::{profile_from_options, JobWorkers};
