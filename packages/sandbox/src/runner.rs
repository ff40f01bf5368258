// ABOUTME: Single-use confined Docker sandbox for compile-and-run jobs
// ABOUTME: Hardened container, wall-clock watchdog and unconditional teardown

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::Utc;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::types::{ExecutionOutcome, MetricsSample, ResourceProfile};

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Docker error: {0}")]
    Docker(#[from] BollardError),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Shared ring buffer of resource samples for one run.
pub type MetricsRing = Arc<Mutex<VecDeque<MetricsSample>>>;

pub const MANAGED_LABEL: &str = "codehive.managed";
pub const JOB_ID_LABEL: &str = "codehive.job_id";

/// Captured output is truncated beyond this many bytes per stream.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Size of the in-container scratch tmpfs holding build artefacts.
const SCRATCH_TMPFS: &str = "rw,noexec,nosuid,size=10m";

/// Seconds granted to log collection after the container exits.
const LOG_COLLECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Abstraction over the sandbox backend so the pool and the workers can be
/// exercised without a Docker daemon.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run `source` under `profile`. Never fails as such: setup problems are
    /// reported through `ExecutionOutcome::error`.
    async fn execute(
        &self,
        job_id: &str,
        source: &str,
        profile: &ResourceProfile,
        metrics: MetricsRing,
        stop: watch::Receiver<bool>,
    ) -> ExecutionOutcome;

    /// Remove containers managed by us whose job is no longer live.
    async fn reap_orphans(&self, _live_job_ids: &HashSet<String>) -> Result<u64> {
        Ok(0)
    }
}

/// Docker-backed runner. Every run gets a fresh container and a fresh host
/// workspace; both are destroyed on every exit path.
pub struct DockerRunner {
    docker: Docker,
    image: String,
    scratch_root: PathBuf,
}

impl DockerRunner {
    pub fn new(image: String, scratch_root: impl Into<PathBuf>) -> Result<Self> {
        #[cfg(unix)]
        let docker = Docker::connect_with_socket_defaults()?;
        #[cfg(not(unix))]
        let docker = Docker::connect_with_defaults()?;

        Ok(Self {
            docker,
            image,
            scratch_root: scratch_root.into(),
        })
    }

    pub fn with_client(docker: Docker, image: String, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            docker,
            image,
            scratch_root: scratch_root.into(),
        }
    }

    /// Pull the sandbox image if it is not present locally.
    pub async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }
        info!(image = %self.image, "pulling sandbox image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: self.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress?;
        }
        Ok(())
    }

    fn container_config(
        &self,
        job_id: &str,
        workspace: &str,
        profile: &ResourceProfile,
    ) -> Config<String> {
        let command = build_command(&profile.compiler_flags);

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(JOB_ID_LABEL.to_string(), job_id.to_string());

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), SCRATCH_TMPFS.to_string());

        let host_config = HostConfig {
            // Source is input-only.
            binds: Some(vec![format!("{workspace}:/src:ro")]),
            tmpfs: Some(tmpfs),
            memory: Some(profile.memory_bytes as i64),
            // CPU quota against a 100ms period: 100_000 == one full core.
            cpu_quota: Some((profile.cpu_cores * 100_000.0) as i64),
            cpu_period: Some(100_000),
            pids_limit: Some(profile.pids_limit as i64),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command]),
            user: Some("65534:65534".to_string()),
            working_dir: Some("/tmp".to_string()),
            env: Some(vec!["HOME=/tmp".to_string()]),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn collect_logs(&self, name: &str) -> (String, String) {
        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();

        let mut logs = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let collect = async {
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        append_capped(&mut stdout, &message);
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        append_capped(&mut stderr, &message);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(container = name, "log stream ended: {e}");
                        break;
                    }
                }
            }
        };
        if tokio::time::timeout(LOG_COLLECT_TIMEOUT, collect).await.is_err() {
            warn!(container = name, "log collection timed out");
        }

        (
            String::from_utf8_lossy(&stdout).trim_end().to_string(),
            String::from_utf8_lossy(&stderr).trim_end().to_string(),
        )
    }

    /// Sample the container's stats stream into the run's ring buffer.
    fn spawn_sampler(&self, name: String, ring: MetricsRing) -> tokio::task::JoinHandle<()> {
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let mut stats = docker.stats(
                &name,
                Some(StatsOptions {
                    stream: true,
                    one_shot: false,
                }),
            );
            while let Some(Ok(stat)) = stats.next().await {
                let memory_bytes = stat.memory_stats.usage.unwrap_or(0);
                let cpu_delta = stat
                    .cpu_stats
                    .cpu_usage
                    .total_usage
                    .saturating_sub(stat.precpu_stats.cpu_usage.total_usage);
                let system_delta = stat
                    .cpu_stats
                    .system_cpu_usage
                    .unwrap_or(0)
                    .saturating_sub(stat.precpu_stats.system_cpu_usage.unwrap_or(0));
                let cpu_percent = if system_delta > 0 {
                    cpu_delta as f64 / system_delta as f64
                        * stat.cpu_stats.online_cpus.unwrap_or(1) as f64
                        * 100.0
                } else {
                    0.0
                };

                push_sample(
                    &ring,
                    MetricsSample {
                        at: Utc::now(),
                        cpu_percent,
                        memory_bytes,
                    },
                );
            }
        })
    }

    async fn kill_container(&self, name: &str) {
        if let Err(e) = self
            .docker
            .kill_container(name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            if !is_gone(&e) {
                warn!(container = name, "failed to kill container: {e}");
            }
        }
    }

    async fn remove_container(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            if !is_gone(&e) {
                warn!(container = name, "failed to remove container: {e}");
            }
        }
    }

    async fn remove_workspace(&self, workspace: &PathBuf) {
        if let Err(e) = tokio::fs::remove_dir_all(workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(workspace = %workspace.display(), "failed to remove workspace: {e}");
            }
        }
    }
}

#[async_trait]
impl Runner for DockerRunner {
    async fn execute(
        &self,
        job_id: &str,
        source: &str,
        profile: &ResourceProfile,
        metrics: MetricsRing,
        mut stop: watch::Receiver<bool>,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let elapsed_ms = |s: Instant| s.elapsed().as_millis() as u64;

        // Materialize the source into a uniquely named workspace.
        let workspace = self.scratch_root.join(format!("run-{job_id}"));
        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            return ExecutionOutcome::setup_failure(
                format!("failed to create workspace: {e}"),
                elapsed_ms(started),
            );
        }
        if let Err(e) = tokio::fs::write(workspace.join("main.cpp"), source).await {
            self.remove_workspace(&workspace).await;
            return ExecutionOutcome::setup_failure(
                format!("failed to write source: {e}"),
                elapsed_ms(started),
            );
        }

        let name = format!("codehive-run-{job_id}");
        let config = self.container_config(job_id, &workspace.display().to_string(), profile);

        if let Err(e) = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
        {
            self.remove_workspace(&workspace).await;
            return ExecutionOutcome::setup_failure(
                format!("failed to create sandbox: {e}"),
                elapsed_ms(started),
            );
        }

        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_container(&name).await;
            self.remove_workspace(&workspace).await;
            return ExecutionOutcome::setup_failure(
                format!("failed to start sandbox: {e}"),
                elapsed_ms(started),
            );
        }

        let sampler = self.spawn_sampler(name.clone(), metrics.clone());

        // Watchdog: the run is bounded by the wall timeout regardless of what
        // the sandboxed process does.
        let wall = Duration::from_millis(profile.wall_timeout_ms);
        let mut wait = self
            .docker
            .wait_container(&name, None::<WaitContainerOptions<String>>);

        let mut timed_out = false;
        let mut stopped = false;
        let mut exit_code: Option<i64> = None;
        let mut internal_error: Option<String> = None;

        tokio::select! {
            waited = tokio::time::timeout(wall, wait.next()) => match waited {
                Ok(Some(Ok(response))) => exit_code = Some(response.status_code),
                Ok(Some(Err(BollardError::DockerContainerWaitError { code, .. }))) => {
                    exit_code = Some(code);
                }
                Ok(Some(Err(e))) => internal_error = Some(format!("wait failed: {e}")),
                Ok(None) => internal_error = Some("wait stream closed".to_string()),
                Err(_) => {
                    timed_out = true;
                    self.kill_container(&name).await;
                }
            },
            changed = stop.changed() => {
                if changed.is_ok() && *stop.borrow() {
                    stopped = true;
                    self.kill_container(&name).await;
                }
            }
        }

        let execution_time_ms = elapsed_ms(started);
        sampler.abort();

        // Output may be partial on timeout; that is expected.
        let (stdout, stderr) = self.collect_logs(&name).await;
        let memory_bytes = {
            let ring = metrics.lock().unwrap_or_else(|p| p.into_inner());
            ring.iter().map(|s| s.memory_bytes).max()
        };

        self.remove_container(&name).await;
        self.remove_workspace(&workspace).await;

        if stopped {
            internal_error = Some("sandbox stopped during shutdown".to_string());
        }

        ExecutionOutcome {
            success: !timed_out && internal_error.is_none() && exit_code == Some(0),
            stdout,
            stderr,
            exit_code,
            execution_time_ms,
            memory_bytes,
            timed_out,
            error: internal_error,
        }
    }

    async fn reap_orphans(&self, live_job_ids: &HashSet<String>) -> Result<u64> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        );

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut reaped = 0u64;
        for container in containers {
            let job_id = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(JOB_ID_LABEL))
                .cloned();
            let Some(job_id) = job_id else { continue };
            if live_job_ids.contains(&job_id) {
                continue;
            }
            if let Some(id) = container.id {
                warn!(job_id, container = %id, "reaping orphaned sandbox");
                self.remove_container(&id).await;
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

/// Compile-then-execute as one sandbox command. Flags are validated by
/// admission (`^[A-Za-z0-9_.:=+-]+$`) before they reach the shell.
fn build_command(compiler_flags: &[String]) -> String {
    let flags = compiler_flags.join(" ");
    format!("g++ {flags} /src/main.cpp -o /tmp/prog && /tmp/prog")
}

fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8]) {
    let remaining = MAX_CAPTURE_BYTES.saturating_sub(buffer.len());
    buffer.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
}

pub(crate) fn push_sample(ring: &MetricsRing, sample: MetricsSample) {
    let mut ring = ring.lock().unwrap_or_else(|p| p.into_inner());
    ring.push_back(sample);
    while ring.len() > crate::pool::METRICS_RING_CAPACITY {
        ring.pop_front();
    }
}

fn is_gone(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}
