//! Server startup: backend selection, state construction, and the serve loop.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use visage_core::Config;
use visage_detect::{Detector, HttpDetector};
use visage_queue::{MemoryQueue, QueueOptions, SqliteQueue, WorkQueue};
use visage_ratelimit::{MemoryWindowStore, RateLimitSettings, RateLimiter, RedisWindowStore, WindowStore};
use visage_storage::ArtifactStore;
use visage_store::sqlite::connect_pool;
use visage_store::{MemoryTaskStore, SqliteTaskStore, TaskStore};

use crate::pipeline::DetectionPipeline;
use crate::router::build_router;
use crate::service::TaskService;
use crate::state::AppState;
use crate::worker::{consumer_options, WorkerPool};

/// Queue name shared by producers and workers.
pub const QUEUE_NAME: &str = "detection";

/// Task store and work queue, durable when a database is configured.
pub async fn build_backends(
    config: &Config,
) -> anyhow::Result<(Arc<dyn TaskStore>, Arc<dyn WorkQueue>)> {
    let options = QueueOptions::from_config(&config.queue);

    match config.storage.database_url.as_deref() {
        Some(url) => {
            let pool = connect_pool(url)
                .await
                .context("failed to open task database")?;
            let store = SqliteTaskStore::new(pool);
            store.migrate().await.context("task store migration failed")?;
            let queue = SqliteQueue::open(store.pool().clone(), QUEUE_NAME, options)
                .await
                .context("queue migration failed")?;
            info!("SQLite task store and queue ready");
            let store: Arc<dyn TaskStore> = Arc::new(store);
            let queue: Arc<dyn WorkQueue> = Arc::new(queue);
            Ok((store, queue))
        }
        None => {
            warn!("VISAGE_DATABASE_URL not set; tasks and jobs are kept in memory only");
            let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
            let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new(options));
            Ok((store, queue))
        }
    }
}

/// Redis-backed windows when configured and available, else in-process.
pub fn build_rate_limiter(config: &Config) -> RateLimiter {
    let settings = RateLimitSettings::from_config(&config.rate_limit);
    let store: Arc<dyn WindowStore> = match config.rate_limit.redis_url.as_deref() {
        Some(url) => match RedisWindowStore::new(url) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "Redis rate limit store unavailable, using in-memory windows");
                Arc::new(MemoryWindowStore::new())
            }
        },
        None => Arc::new(MemoryWindowStore::new()),
    };
    RateLimiter::new(store, settings)
}

/// Everything a running server owns.
pub struct App {
    pub state: Arc<AppState>,
    pub service: Arc<TaskService>,
    pub worker: WorkerPool,
}

/// Wire backends, the model client and the worker pool together.
pub async fn build_app(config: &Config) -> anyhow::Result<App> {
    let (tasks, queue) = build_backends(config).await?;
    let artifacts = Arc::new(
        ArtifactStore::from_config(&config.storage, &config.aws)
            .context("failed to initialize artifact storage")?,
    );
    info!(artifacts = %config.storage.artifact_location(), "artifact storage ready");

    let detector: Arc<dyn Detector> = Arc::new(
        HttpDetector::new(&config.detector).context("failed to build detector client")?,
    );

    Ok(assemble(config, tasks, queue, artifacts, detector))
}

/// Build the app from already constructed components.
pub fn assemble(
    config: &Config,
    tasks: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    artifacts: Arc<ArtifactStore>,
    detector: Arc<dyn Detector>,
) -> App {
    let service = Arc::new(TaskService::new(
        tasks.clone(),
        queue.clone(),
        artifacts.clone(),
        detector.clone(),
    ));
    let pipeline = Arc::new(DetectionPipeline::new(tasks, artifacts, detector));
    let worker = WorkerPool::new(queue, pipeline, consumer_options(config));

    if !config.auth.is_configured() {
        warn!("VISAGE_API_KEY not set; API key validation is disabled");
    }

    let state = Arc::new(AppState {
        service: service.clone(),
        limiter: Arc::new(build_rate_limiter(config)),
        auth: config.auth.clone(),
        cors_origin: config.server.cors_origin.clone(),
        workers: Some(worker.metrics()),
    });

    App {
        state,
        service,
        worker,
    }
}

/// Warm up, start workers and the sweeper, serve until a shutdown signal,
/// then drain.
pub async fn serve(config: &Config) -> anyhow::Result<()> {
    let app = build_app(config).await?;

    app.service
        .warmup()
        .await
        .context("model failed to load; refusing to start")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = app.worker.spawn(shutdown_rx);
    let sweeper = app
        .service
        .start_sweeper(config.sweep.interval(), config.sweep.max_task_age());

    let router = build_router(app.state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "visage server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("shutting down");
    sweeper.stop().await;
    let _ = shutdown_tx.send(true);
    match workers.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "worker pool stopped with error"),
        Err(e) => warn!(error = %e, "worker pool task panicked"),
    }
    info!("visage server exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
