//! Conveyor - PostgreSQL-backed job queue service
//!
//! This is the main entry point. It initializes the HTTP API, the
//! background scheduler, and one embedded worker per configured job
//! type, all sharing a single database pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod api;
mod cache;
mod config;
mod db;
mod error;
mod models;
mod observability;
mod queue;
mod scheduler;
mod worker;

use crate::config::Settings;
use crate::db::Database;
use crate::queue::QueueManager;
use crate::scheduler::Scheduler;
use crate::worker::{BuiltinHandler, RateLimit, Worker, WorkerConfig};

/// Graceful shutdown timeout (max time to wait for in-flight work)
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(35);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let settings = Settings::load()?;

    observability::init_tracing(&settings.tracing);

    info!("Starting Conveyor v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %settings.server.host,
        port = %settings.server.port,
        environment = %settings.server.environment,
        "Configuration loaded"
    );

    // Database pool and migrations
    let db = Database::connect(&settings.database).await?;
    info!("Database connection pool established");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // Redis is optional; without it workers fall back to polling
    let cache = match cache::RedisCache::connect(&settings.redis).await {
        Ok(cache) => {
            info!("Redis connected");
            Some(Arc::new(cache))
        }
        Err(e) => {
            warn!(error = %e, "Redis unavailable, running without pub/sub wake-ups");
            None
        }
    };

    let metrics = Arc::new(observability::Metrics::new());
    info!("Prometheus metrics initialized");

    let queue = QueueManager::new(
        db.pool_arc(),
        cache.clone(),
        settings.queue.max_payload_size_bytes,
    );

    let state = api::AppState::new(
        db.clone(),
        cache.clone(),
        queue.clone(),
        metrics.clone(),
        settings.clone(),
    );

    let app = api::router(state.clone());

    let addr = SocketAddr::new(settings.server.host.parse()?, settings.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Server listening");

    // Metrics server on a separate port, with optional bearer token
    let metrics_addr =
        SocketAddr::new(settings.server.host.parse()?, settings.server.metrics_port);
    let metrics_token = std::env::var("METRICS_TOKEN").ok();
    let metrics_handle = tokio::spawn(observability::start_metrics_server(
        metrics_addr,
        metrics.clone(),
        metrics_token.clone(),
    ));
    info!(
        %metrics_addr,
        auth_required = metrics_token.is_some(),
        "Metrics server listening"
    );

    // Shutdown channel shared by the scheduler and workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Background maintenance scheduler
    let scheduler = Scheduler::new(
        db.pool_arc(),
        cache.clone(),
        metrics.clone(),
        settings.retention.clone(),
    );
    let scheduler_shutdown_rx = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler.run(scheduler_shutdown_rx).await {
            error!(error = %e, "Scheduler error");
        }
    });
    info!("Background scheduler started");

    // One embedded worker per configured job type
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let rate_limit = if settings.worker.rate_limit_max > 0 {
        Some(RateLimit {
            max_starts: settings.worker.rate_limit_max,
            window: Duration::from_secs(settings.worker.rate_limit_window_secs),
        })
    } else {
        None
    };

    let mut worker_handles = Vec::new();
    for job_type in &settings.worker.job_types {
        let config = WorkerConfig {
            worker_id: format!("{}-{}", hostname, uuid::Uuid::new_v4()),
            job_type: job_type.clone(),
            concurrency: settings.worker.concurrency as usize,
            heartbeat_interval_secs: settings.worker.heartbeat_interval_secs,
            lease_duration_secs: settings.worker.lease_duration_secs as i64,
            poll_interval_secs: settings.worker.poll_interval_secs,
            rate_limit: rate_limit.clone(),
        };

        let worker = Worker::new(
            config,
            queue.clone(),
            cache.clone(),
            metrics.clone(),
            Arc::new(BuiltinHandler),
        );
        let worker_shutdown_rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            if let Err(e) = worker.run(worker_shutdown_rx).await {
                error!(error = %e, "Worker error");
            }
        }));
        info!(job_type = %job_type, "Worker started");
    }

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await?;

    info!("HTTP server stopped, draining components...");

    let _ = shutdown_tx.send(true);

    let shutdown_futures = async {
        let _ = scheduler_handle.await;
        info!("Scheduler shutdown complete");

        for handle in worker_handles {
            let _ = handle.await;
        }
        info!("Workers shutdown complete");

        metrics_handle.abort();
        info!("Metrics server shutdown complete");
    };

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown_futures).await {
        Ok(_) => info!("All components shutdown gracefully"),
        Err(_) => warn!(
            "Shutdown timeout ({:?}) exceeded, forcing exit",
            SHUTDOWN_TIMEOUT
        ),
    }

    db.close().await;
    info!("Database connections closed");

    info!("Server shutdown complete");
    Ok(())
}

/// Listens for shutdown signals (Ctrl+C or SIGTERM)
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    let _ = shutdown_tx.send(true);
}
