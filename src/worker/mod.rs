//! Worker loop
//!
//! Workers claim jobs for one job type and run the registered handler
//! with bounded concurrency. Wake-ups come from Redis pub/sub with
//! fallback polling, so delivery survives a Redis outage. Claims carry
//! a lease that the heartbeat renews while handlers run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::RedisCache;
use crate::models::Job;
use crate::observability::Metrics;
use crate::queue::{FailOutcome, QueueManager};

/// Error returned by a job handler
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient failure; the job is retried per its backoff policy
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure (e.g. malformed payload); the job fails
    /// immediately without consuming further retry budget
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Handler invoked for each claimed job of a given type
///
/// A successful return value is recorded as the job result.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value, HandlerError>;
}

/// Fixed-window rate limit on job starts
#[derive(Debug, Clone)]
pub struct RateLimit {
    /// Max job starts per window
    pub max_starts: u32,
    /// Window length
    pub window: Duration,
}

/// Local fixed-window limiter, used when Redis is unavailable
///
/// Only the worker loop task touches it, so no atomics are needed.
struct LocalRateLimiter {
    max_starts: u32,
    window: Duration,
    window_start: Instant,
    started: u32,
}

impl LocalRateLimiter {
    fn new(limit: &RateLimit) -> Self {
        Self {
            max_starts: limit.max_starts,
            window: limit.window,
            window_start: Instant::now(),
            started: 0,
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.started = 0;
        }
        if self.started < self.max_starts {
            self.started += 1;
            true
        } else {
            false
        }
    }

    /// Give back a token that was acquired but not spent on a job start
    fn release(&mut self) {
        self.started = self.started.saturating_sub(1);
    }
}

/// Where a granted rate-limit token came from, so an unused token can
/// be returned to the right window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateLimitGrant {
    Unlimited,
    Shared,
    Local,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker ID (unique per process)
    pub worker_id: String,
    /// Job type to process
    pub job_type: String,
    /// Maximum concurrent handler invocations
    pub concurrency: usize,
    /// Heartbeat interval in seconds (lease renewal)
    pub heartbeat_interval_secs: u64,
    /// Lease duration in seconds
    pub lease_duration_secs: i64,
    /// Fallback poll interval in seconds (when Redis unavailable)
    pub poll_interval_secs: u64,
    /// Optional rate limit on job starts
    pub rate_limit: Option<RateLimit>,
}

/// Worker that claims and processes jobs for one job type
pub struct Worker {
    config: WorkerConfig,
    queue: QueueManager,
    cache: Option<Arc<RedisCache>>,
    metrics: Arc<Metrics>,
    handler: Arc<dyn JobHandler>,
}

impl Worker {
    /// Create a new worker
    pub fn new(
        config: WorkerConfig,
        queue: QueueManager,
        cache: Option<Arc<RedisCache>>,
        metrics: Arc<Metrics>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            config,
            queue,
            cache,
            metrics,
            handler,
        }
    }

    /// How long a draining worker waits for in-flight handlers
    const SHUTDOWN_DRAIN_SECS: u64 = 30;

    /// Run the worker loop with graceful shutdown support
    ///
    /// Workers listen to Redis but also poll the database on a timer,
    /// which guarantees delivery even if Redis fails temporarily.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tasks: JoinSet<String> = JoinSet::new();
        let mut poll_ticker = interval(Duration::from_secs(self.config.poll_interval_secs));
        let mut heartbeat_ticker =
            interval(Duration::from_secs(self.config.heartbeat_interval_secs));
        let mut active_jobs: Vec<String> = Vec::new();
        let mut local_limiter = self.config.rate_limit.as_ref().map(LocalRateLimiter::new);

        info!(
            worker_id = %self.config.worker_id,
            job_type = %self.config.job_type,
            concurrency = self.config.concurrency,
            "Worker started"
        );

        let mut redis_rx = if let Some(ref cache) = self.cache {
            let channel = QueueManager::channel(&self.config.job_type);
            match cache.subscribe(&channel).await {
                Ok(pubsub) => Some(pubsub),
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Failed to subscribe to Redis, using polling only");
                    None
                }
            }
        } else {
            None
        };

        loop {
            tokio::select! {
                // Graceful shutdown signal
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.config.worker_id, "Worker shutdown signal received");
                        self.shutdown_gracefully(&mut tasks).await?;
                        break;
                    }
                }

                // Redis notification (new job available)
                msg = async {
                    if let Some(ref mut pubsub) = redis_rx {
                        pubsub.on_message().next().await
                    } else {
                        std::future::pending::<Option<redis::Msg>>().await
                    }
                } => {
                    if msg.is_some() {
                        debug!("Redis notification: new job available");
                        self.fill_capacity(&mut tasks, &mut active_jobs, &mut local_limiter).await;
                    }
                }

                // Fallback polling (reliable delivery when Redis is down)
                _ = poll_ticker.tick() => {
                    self.fill_capacity(&mut tasks, &mut active_jobs, &mut local_limiter).await;
                }

                // Renew leases for jobs still in flight
                _ = heartbeat_ticker.tick() => {
                    if let Err(e) = self
                        .queue
                        .renew_leases(
                            &self.config.worker_id,
                            &active_jobs,
                            self.config.lease_duration_secs,
                        )
                        .await
                    {
                        error!(error = %e, "Failed to renew leases");
                    }
                }

                // Reap finished handler tasks
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(job_id) => active_jobs.retain(|id| id != &job_id),
                        Err(e) => {
                            // A panicking handler loses its slot; the job's
                            // lease expires and stalled recovery retries it
                            error!(error = %e, "Handler task panicked");
                        }
                    }
                    // Refill the freed slot immediately instead of
                    // waiting for the next poll tick or notification
                    self.fill_capacity(&mut tasks, &mut active_jobs, &mut local_limiter).await;
                }
            }
        }

        Ok(())
    }

    /// Claim jobs up to the concurrency limit and spawn handler tasks
    ///
    /// Rate-limit tokens are charged per job start, not per claim
    /// attempt; a token taken for a claim that finds no job is
    /// refunded, so empty polls never burn window budget.
    async fn fill_capacity(
        &self,
        tasks: &mut JoinSet<String>,
        active_jobs: &mut Vec<String>,
        local_limiter: &mut Option<LocalRateLimiter>,
    ) {
        while tasks.len() < self.config.concurrency {
            let Some(grant) = self.acquire_rate_limit(local_limiter).await else {
                debug!(job_type = %self.config.job_type, "Rate limit reached, deferring claims");
                break;
            };

            match self
                .queue
                .claim(
                    &self.config.job_type,
                    &self.config.worker_id,
                    self.config.lease_duration_secs,
                )
                .await
            {
                Ok(Some(job)) => {
                    active_jobs.push(job.id.clone());
                    self.spawn_handler(tasks, job);
                }
                Ok(None) => {
                    self.refund_rate_limit(grant, local_limiter).await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to claim job");
                    self.refund_rate_limit(grant, local_limiter).await;
                    break;
                }
            }
        }
    }

    /// Take a rate-limit token before claiming one more job
    ///
    /// Shared across workers via Redis when available; enforced with a
    /// local fixed window otherwise (including on Redis errors).
    /// Returns None when the window is exhausted.
    async fn acquire_rate_limit(
        &self,
        local_limiter: &mut Option<LocalRateLimiter>,
    ) -> Option<RateLimitGrant> {
        let Some(ref limit) = self.config.rate_limit else {
            return Some(RateLimitGrant::Unlimited);
        };

        if let Some(ref cache) = self.cache {
            let key = format!("ratelimit:{}", self.config.job_type);
            match cache
                .check_rate_limit(&key, limit.max_starts, limit.window.as_secs())
                .await
            {
                Ok(result) => return result.allowed.then_some(RateLimitGrant::Shared),
                Err(e) => {
                    debug!(error = %e, "Shared rate limit unavailable, using local window");
                }
            }
        }

        let allowed = local_limiter
            .as_mut()
            .map(|l| l.try_acquire())
            .unwrap_or(true);
        allowed.then_some(RateLimitGrant::Local)
    }

    /// Return a token that did not result in a job start
    async fn refund_rate_limit(
        &self,
        grant: RateLimitGrant,
        local_limiter: &mut Option<LocalRateLimiter>,
    ) {
        match grant {
            RateLimitGrant::Unlimited => {}
            RateLimitGrant::Shared => {
                if let Some(ref cache) = self.cache {
                    let key = format!("ratelimit:{}", self.config.job_type);
                    if let Err(e) = cache.refund_rate_limit(&key).await {
                        debug!(error = %e, "Rate limit refund failed");
                    }
                }
            }
            RateLimitGrant::Local => {
                if let Some(limiter) = local_limiter.as_mut() {
                    limiter.release();
                }
            }
        }
    }

    /// Spawn a handler task for a claimed job
    fn spawn_handler(&self, tasks: &mut JoinSet<String>, job: Job) {
        let queue = self.queue.clone();
        let handler = Arc::clone(&self.handler);
        let metrics = Arc::clone(&self.metrics);
        let worker_id = self.config.worker_id.clone();

        tasks.spawn(async move {
            let job_id = job.id.clone();
            if let Err(e) = process_job(&queue, &handler, &metrics, &worker_id, job).await {
                error!(job_id = %job_id, error = %e, "Job processing failed");
            }
            job_id
        });
    }

    /// Graceful shutdown: drain in-flight handlers, then release claims
    async fn shutdown_gracefully(&self, tasks: &mut JoinSet<String>) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            in_flight = tasks.len(),
            "Draining worker"
        );

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(Duration::from_secs(Self::SHUTDOWN_DRAIN_SECS), drain)
            .await
            .is_err()
        {
            warn!("Drain deadline reached with handlers still running");
            tasks.abort_all();
        }

        // Anything still claimed goes back to waiting with no attempt charged
        self.queue.release_claims(&self.config.worker_id).await?;

        info!(worker_id = %self.config.worker_id, "Worker shutdown complete");
        Ok(())
    }
}

/// Minimum timeout to prevent immediate job failures
const MIN_TIMEOUT_SECONDS: u64 = 1;
/// Maximum timeout (24 hours)
const MAX_TIMEOUT_SECONDS: u64 = 86400;

/// Process a single claimed job with timeout and error handling
#[instrument(
    name = "worker.process_job",
    skip(queue, handler, metrics, job),
    fields(job_id = %job.id, job_type = %job.job_type)
)]
async fn process_job(
    queue: &QueueManager,
    handler: &Arc<dyn JobHandler>,
    metrics: &Arc<Metrics>,
    worker_id: &str,
    job: Job,
) -> Result<()> {
    let timeout_seconds = (job.timeout_seconds.max(0) as u64)
        .clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS);
    let started = Instant::now();

    let result =
        tokio::time::timeout(Duration::from_secs(timeout_seconds), handler.handle(&job)).await;

    metrics
        .job_duration_seconds
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(Ok(job_result)) => {
            queue.complete(&job.id, worker_id, Some(job_result)).await?;
            metrics.jobs_completed_total.inc();
        }
        Ok(Err(HandlerError::Fatal(msg))) => {
            queue.fail(&job.id, worker_id, &msg, true).await?;
            metrics.jobs_failed_total.inc();
        }
        Ok(Err(HandlerError::Retryable(msg))) => {
            record_fail_outcome(metrics, queue.fail(&job.id, worker_id, &msg, false).await?);
        }
        Err(_) => {
            let msg = format!("Handler timed out after {}s", timeout_seconds);
            record_fail_outcome(metrics, queue.fail(&job.id, worker_id, &msg, false).await?);
        }
    }

    Ok(())
}

fn record_fail_outcome(metrics: &Arc<Metrics>, outcome: FailOutcome) {
    match outcome {
        FailOutcome::Retried(_) => metrics.jobs_retried_total.inc(),
        FailOutcome::Failed => metrics.jobs_failed_total.inc(),
    }
}

/// Built-in handler for the embedded worker.
///
/// Primarily for development and smoke testing; production deployments
/// register their own `JobHandler` implementations with real business
/// logic per job type.
pub struct BuiltinHandler;

#[async_trait]
impl JobHandler for BuiltinHandler {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
        info!(job_id = %job.id, "Built-in handler executing job");

        // Simulate processing time
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(serde_json::json!({
            "status": "success",
            "completed_at": chrono::Utc::now().to_rfc3339()
        }))
    }
}
