// ABOUTME: Composition root: wires config, stores, queue, sandbox and router
// ABOUTME: Starts background loops and handles SIGTERM/SIGINT graceful shutdown

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use codehive_api::{AddressRateLimits, AppState, RoomHub};
use codehive_config::Config;
use codehive_jobs::{
    DispatcherConfig, ExecutionDispatcher, JobStorage, JobWorkers, Queue, RedisJobQueue,
    Supervisor,
};
use codehive_rooms::RoomStorage;
use codehive_sandbox::{ContainerPool, DockerRunner};
use codehive_sync::{PresenceTracker, RoomMaintenance, SyncService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    info!(port = config.port, "starting codehive server");

    // Database and schema bootstrap.
    let connect_options = SqliteConnectOptions::from_str(&config.database_url)
        .context("invalid DATABASE_URL")?
        .create_if_missing(true);
    let db = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(connect_options)
        .await
        .context("database connection failed")?;
    sqlx::raw_sql(codehive_rooms::storage::SCHEMA)
        .execute(&db)
        .await
        .context("room schema bootstrap failed")?;
    sqlx::raw_sql(codehive_jobs::JOBS_SCHEMA)
        .execute(&db)
        .await
        .context("job schema bootstrap failed")?;

    // Durable queue.
    let queue: Arc<dyn Queue> = Arc::new(
        RedisJobQueue::connect(&config.redis_url)
            .await
            .context("redis connection failed")?,
    );

    // Stores.
    let rooms = Arc::new(RoomStorage::new(db.clone()));
    let jobs = Arc::new(JobStorage::new(db.clone()));

    // Sandbox runner and pool.
    let runner = Arc::new(
        DockerRunner::new(
            config.sandbox_image.clone(),
            config.sandbox_scratch_root.clone(),
        )
        .context("docker connection failed")?,
    );
    if let Err(e) = runner.ensure_image().await {
        warn!("sandbox image not available yet: {e}");
    }
    let pool = Arc::new(ContainerPool::new(
        runner,
        config.max_concurrent_sandboxes,
    ));
    pool.start_reaper();

    // Dispatcher, workers, supervisor.
    let dispatcher = Arc::new(ExecutionDispatcher::new(
        jobs.clone(),
        queue.clone(),
        DispatcherConfig {
            max_wall_timeout_ms: config.max_execution_time_ms,
            max_memory_limit: config.max_memory_limit.clone(),
            max_cpu_limit: config.max_cpu_limit,
            user_window_max: config.rate_limit_max as i64,
            user_window_ms: config.rate_limit_window_ms,
            ..DispatcherConfig::default()
        },
    ));
    let workers = Arc::new(JobWorkers::new(jobs.clone(), queue.clone(), pool.clone()));
    workers.start(config.worker_count);
    let supervisor = Arc::new(Supervisor::new(jobs, queue.clone()));
    supervisor.start();

    // Realtime services and room maintenance.
    let sync = Arc::new(SyncService::new(rooms.clone()));
    let presence = Arc::new(PresenceTracker::new());
    let maintenance = Arc::new(RoomMaintenance::new(
        rooms.clone(),
        sync.clone(),
        presence.clone(),
    ));
    maintenance.start();

    let state = AppState {
        db,
        rooms,
        dispatcher,
        queue,
        sync: sync.clone(),
        presence,
        hub: Arc::new(RoomHub::new()),
        limits: Arc::new(AddressRateLimits::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = codehive_api::create_router(state).layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    // Drain order: stop pulling work, stop sandboxes, persist documents.
    info!("shutting down");
    workers.stop();
    pool.shutdown().await;
    for room_id in sync.active_rooms().await {
        sync.cleanup_room(&room_id).await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("ctrl-c handler failed: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("SIGTERM handler failed: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
