// ABOUTME: Sandboxed execution crate: confined Docker runner and run pool
// ABOUTME: Every run is single-use; teardown is unconditional on all paths

pub mod pool;
pub mod runner;
pub mod types;

pub use pool::{ContainerPool, PoolError, METRICS_RING_CAPACITY};
pub use runner::{DockerRunner, MetricsRing, Runner, SandboxError};
pub use types::{
    ExecutionOutcome, LifecycleEvent, LifecycleEventKind, MetricsSample, ResourceProfile,
};
