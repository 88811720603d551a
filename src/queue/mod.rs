//! Core queue management
//!
//! All lifecycle transitions go through PostgreSQL so that claiming,
//! completing and failing jobs stay atomic under concurrent workers.
//! Redis only wakes workers up; losing it never loses a job.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::RedisCache;
use crate::models::{BackoffKind, CronExpr, Job, JobCounts, Schedule};

/// Options for a single enqueue
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub priority: i32,
    pub max_attempts: i32,
    pub backoff: BackoffKind,
    pub backoff_delay_ms: i64,
    pub timeout_seconds: i32,
    /// Earliest eligibility time; None means immediately eligible
    pub run_at: Option<DateTime<Utc>>,
    /// Set when the job is materialised from a recurring schedule
    pub schedule_id: Option<String>,
}

/// Outcome of failing a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled with backoff; carries the retry time
    Retried(DateTime<Utc>),
    /// Terminal failure, retained for inspection
    Failed,
}

/// Queue manager for enqueueing and claiming jobs
#[derive(Clone)]
pub struct QueueManager {
    db: Arc<PgPool>,
    cache: Option<Arc<RedisCache>>,
    max_payload_size: usize,
}

impl QueueManager {
    /// Create a new queue manager
    pub fn new(db: Arc<PgPool>, cache: Option<Arc<RedisCache>>, max_payload_size: usize) -> Self {
        Self {
            db,
            cache,
            max_payload_size,
        }
    }

    /// Pub/sub channel carrying wake-ups for one job type
    pub fn channel(job_type: &str) -> String {
        format!("jobs:{}", job_type)
    }

    /// Enqueue a new job
    ///
    /// Oversized payloads are rejected here, before anything is written;
    /// that failure is permanent and consumes no retry budget.
    #[instrument(
        name = "queue.enqueue",
        skip(self, payload, options),
        fields(job_type = %job_type, priority = %options.priority)
    )]
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Job> {
        let payload_size = serde_json::to_string(&payload)?.len();
        if payload_size > self.max_payload_size {
            anyhow::bail!(
                "Payload size ({} bytes) exceeds maximum allowed ({} bytes)",
                payload_size,
                self.max_payload_size
            );
        }

        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let initial_status = match options.run_at {
            Some(run_at) if run_at > now => "delayed",
            _ => "waiting",
        };

        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                id, job_type, payload, status, priority,
                max_attempts, backoff, backoff_delay_ms, timeout_seconds,
                run_at, schedule_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            RETURNING *
            "#,
        )
        .bind(&job_id)
        .bind(job_type)
        .bind(&payload)
        .bind(initial_status)
        .bind(options.priority)
        .bind(options.max_attempts)
        .bind(options.backoff.to_string())
        .bind(options.backoff_delay_ms)
        .bind(options.timeout_seconds)
        .bind(options.run_at)
        .bind(&options.schedule_id)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        // Wake a worker only when the job is already eligible
        if initial_status == "waiting" {
            self.notify(job_type, &job_id).await;
        }

        info!(job_id = %job.id, job_type = %job_type, status = %initial_status, "Job enqueued");
        Ok(job)
    }

    /// Create a recurring schedule and materialise its first occurrence
    ///
    /// The first occurrence becomes a delayed job immediately; the stored
    /// `next_run_at` is the occurrence after that, so the maintenance
    /// scheduler does not double-fire the first tick.
    #[instrument(name = "queue.enqueue_repeating", skip(self, payload), fields(job_type = %job_type))]
    pub async fn enqueue_repeating(
        &self,
        job_type: &str,
        cron_expression: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<(Schedule, Job)> {
        let payload_size = serde_json::to_string(&payload)?.len();
        if payload_size > self.max_payload_size {
            anyhow::bail!(
                "Payload size ({} bytes) exceeds maximum allowed ({} bytes)",
                payload_size,
                self.max_payload_size
            );
        }

        let expr = CronExpr::parse(cron_expression)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression: {}", e))?;

        let now = Utc::now();
        let first_run = expr
            .next_occurrence_after(now)
            .ok_or_else(|| anyhow::anyhow!("Cron expression never fires"))?;
        let next_run = expr.next_occurrence_after(first_run);

        let schedule_id = Uuid::new_v4().to_string();
        let job_id = Uuid::new_v4().to_string();

        let mut tx = self.db.begin().await?;

        let schedule = sqlx::query_as::<_, Schedule>(
            r#"
            INSERT INTO schedules (
                id, job_type, cron_expression, payload, priority,
                max_attempts, backoff, backoff_delay_ms, timeout_seconds,
                is_active, last_run_at, next_run_at, run_count,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, $10, $11, 1, $10, $10)
            RETURNING *
            "#,
        )
        .bind(&schedule_id)
        .bind(job_type)
        .bind(cron_expression)
        .bind(&payload)
        .bind(options.priority)
        .bind(options.max_attempts)
        .bind(options.backoff.to_string())
        .bind(options.backoff_delay_ms)
        .bind(options.timeout_seconds)
        .bind(now)
        .bind(next_run)
        .fetch_one(&mut *tx)
        .await?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                id, job_type, payload, status, priority,
                max_attempts, backoff, backoff_delay_ms, timeout_seconds,
                run_at, schedule_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'delayed', $4, $5, $6, $7, $8, $9, $10, $11, $11)
            RETURNING *
            "#,
        )
        .bind(&job_id)
        .bind(job_type)
        .bind(&payload)
        .bind(options.priority)
        .bind(options.max_attempts)
        .bind(options.backoff.to_string())
        .bind(options.backoff_delay_ms)
        .bind(options.timeout_seconds)
        .bind(first_run)
        .bind(&schedule_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            schedule_id = %schedule.id,
            job_id = %job.id,
            first_run = %first_run,
            "Recurring schedule created"
        );
        Ok((schedule, job))
    }

    /// Minimum lease duration (5 seconds)
    const MIN_LEASE_DURATION_SECS: i64 = 5;

    /// Maximum lease duration (1 hour)
    const MAX_LEASE_DURATION_SECS: i64 = 3600;

    /// Claim a job using FOR UPDATE SKIP LOCKED (atomic, non-blocking)
    ///
    /// This is the critical path for job processing. The subselect locks
    /// one eligible row; at most one worker ever observes a given job as
    /// active. Eligible delayed jobs are claimable directly so workers
    /// never wait on the promotion tick.
    #[instrument(
        name = "queue.claim",
        skip(self),
        fields(job_type = %job_type, worker_id = %worker_id)
    )]
    pub async fn claim(
        &self,
        job_type: &str,
        worker_id: &str,
        lease_duration_secs: i64,
    ) -> Result<Option<Job>> {
        // Bound lease duration to prevent workers locking jobs indefinitely
        let safe_lease_duration =
            lease_duration_secs.clamp(Self::MIN_LEASE_DURATION_SECS, Self::MAX_LEASE_DURATION_SECS);
        if safe_lease_duration != lease_duration_secs {
            warn!(
                requested = lease_duration_secs,
                adjusted = safe_lease_duration,
                "Lease duration adjusted to safe range"
            );
        }

        let lease_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let lease_expires = now + Duration::seconds(safe_lease_duration);

        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET
                status = 'active',
                claimed_by = $1,
                lease_id = $2,
                lease_expires_at = $3,
                started_at = $4,
                updated_at = $4
            WHERE id = (
                SELECT id FROM jobs
                WHERE
                    job_type = $5
                    AND status IN ('waiting', 'delayed')
                    AND (run_at IS NULL OR run_at <= $4)
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(&lease_id)
        .bind(lease_expires)
        .bind(now)
        .bind(job_type)
        .fetch_optional(&*self.db)
        .await?;

        if let Some(ref job) = job {
            debug!(job_id = %job.id, worker_id = %worker_id, "Job claimed");
        }

        Ok(job)
    }

    /// Mark a job as completed, recording the handler's return value
    ///
    /// The claimed_by check prevents a worker from completing jobs it
    /// does not own (e.g. after its lease expired and the job was
    /// handed to someone else).
    #[instrument(name = "queue.complete", skip(self, result), fields(job_id = %job_id))]
    pub async fn complete(
        &self,
        job_id: &str,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET
                status = 'completed',
                result = $1,
                claimed_by = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $2
              AND claimed_by = $3
              AND status = 'active'
            "#,
        )
        .bind(result)
        .bind(job_id)
        .bind(worker_id)
        .execute(&*self.db)
        .await?;

        if query.rows_affected() == 0 {
            warn!(job_id = %job_id, "Job completion failed - not owned by worker or not active");
            return Err(anyhow::anyhow!("Job not found or not owned by worker"));
        }

        info!(job_id = %job_id, "Job completed");
        Ok(())
    }

    /// Mark a job as failed, applying its retry policy
    ///
    /// A fatal failure (malformed payload, can never succeed) goes
    /// straight to terminal `failed` without consuming further retry
    /// budget. Otherwise the job is rescheduled with its configured
    /// backoff until attempts run out.
    ///
    /// Like `complete`, this only touches jobs the worker still owns.
    /// If the lease expired and the job was handed to someone else, the
    /// late failure is rejected instead of charging a phantom attempt.
    #[instrument(name = "queue.fail", skip(self), fields(job_id = %job_id, fatal = fatal))]
    pub async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        fatal: bool,
    ) -> Result<FailOutcome> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE id = $1 AND claimed_by = $2 AND status = 'active'",
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&*self.db)
        .await?;

        let Some(job) = job else {
            warn!(job_id = %job_id, "Job failure rejected - not owned by worker or not active");
            return Err(anyhow::anyhow!("Job not found or not owned by worker"));
        };

        let attempts_made = job.attempts_made + 1;

        if !fatal && attempts_made < job.max_attempts {
            let delay_ms = job
                .backoff_kind()
                .delay_ms(job.backoff_delay_ms, attempts_made);
            let next_run = Utc::now() + Duration::milliseconds(delay_ms);

            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET
                    status = 'delayed',
                    attempts_made = $1,
                    run_at = $2,
                    last_error = $3,
                    claimed_by = NULL,
                    lease_id = NULL,
                    lease_expires_at = NULL,
                    updated_at = NOW()
                WHERE id = $4
                  AND claimed_by = $5
                  AND status = 'active'
                "#,
            )
            .bind(attempts_made)
            .bind(next_run)
            .bind(error)
            .bind(job_id)
            .bind(worker_id)
            .execute(&*self.db)
            .await?;

            if result.rows_affected() == 0 {
                warn!(job_id = %job_id, "Job failure rejected - ownership lost mid-failure");
                return Err(anyhow::anyhow!("Job not found or not owned by worker"));
            }

            warn!(
                job_id = %job_id,
                attempt = attempts_made,
                max_attempts = job.max_attempts,
                next_run = %next_run,
                "Job will retry"
            );
            Ok(FailOutcome::Retried(next_run))
        } else {
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET
                    status = 'failed',
                    attempts_made = $1,
                    last_error = $2,
                    claimed_by = NULL,
                    lease_id = NULL,
                    lease_expires_at = NULL,
                    completed_at = NOW(),
                    updated_at = NOW()
                WHERE id = $3
                  AND claimed_by = $4
                  AND status = 'active'
                "#,
            )
            .bind(attempts_made)
            .bind(error)
            .bind(job_id)
            .bind(worker_id)
            .execute(&*self.db)
            .await?;

            if result.rows_affected() == 0 {
                warn!(job_id = %job_id, "Job failure rejected - ownership lost mid-failure");
                return Err(anyhow::anyhow!("Job not found or not owned by worker"));
            }

            warn!(
                job_id = %job_id,
                attempts_made = attempts_made,
                fatal = fatal,
                "Job failed terminally"
            );
            Ok(FailOutcome::Failed)
        }
    }

    /// Renew the leases of jobs a worker is still processing
    pub async fn renew_leases(
        &self,
        worker_id: &str,
        job_ids: &[String],
        lease_duration_secs: i64,
    ) -> Result<u64> {
        if job_ids.is_empty() {
            return Ok(0);
        }

        let lease_expires = Utc::now() + Duration::seconds(lease_duration_secs);

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = $1, updated_at = NOW()
            WHERE id = ANY($2) AND claimed_by = $3 AND status = 'active'
            "#,
        )
        .bind(lease_expires)
        .bind(job_ids)
        .bind(worker_id)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Release every claim a worker still holds (clean shutdown)
    ///
    /// Returned jobs go back to waiting with no attempt charged; the
    /// handler never ran to completion.
    pub async fn release_claims(&self, worker_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET
                status = 'waiting',
                claimed_by = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                started_at = NULL,
                updated_at = NOW()
            WHERE claimed_by = $1 AND status = 'active'
            "#,
        )
        .bind(worker_id)
        .execute(&*self.db)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!(worker_id = %worker_id, count = count, "Released claims on shutdown");
        }
        Ok(count)
    }

    /// Re-submit a terminal failed job with its attempt counter reset
    pub async fn retry_failed(&self, job_id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET
                status = 'waiting',
                attempts_made = 0,
                run_at = NULL,
                last_error = NULL,
                result = NULL,
                completed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .fetch_optional(&*self.db)
        .await?;

        if let Some(ref job) = job {
            info!(job_id = %job.id, "Failed job re-submitted");
            self.notify(&job.job_type, &job.id).await;
        }

        Ok(job)
    }

    /// Per-status job counts, optionally filtered by job type
    pub async fn counts(&self, job_type: Option<&str>) -> Result<JobCounts> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'waiting'),
                COUNT(*) FILTER (WHERE status = 'delayed'),
                COUNT(*) FILTER (WHERE status = 'active'),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed')
            FROM jobs
            WHERE $1::TEXT IS NULL OR job_type = $1
            "#,
        )
        .bind(job_type)
        .fetch_one(&*self.db)
        .await?;

        let (waiting, delayed, active, completed, failed) = row;
        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
            total: waiting + delayed + active + completed + failed,
        })
    }

    /// Age of the oldest eligible waiting job, in seconds (for gauges)
    pub async fn oldest_waiting_age_secs(&self) -> Result<Option<i64>> {
        let result: Option<(Option<i64>,)> = sqlx::query_as(
            r#"
            SELECT EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT
            FROM jobs
            WHERE status = 'waiting'
            "#,
        )
        .fetch_optional(&*self.db)
        .await?;

        Ok(result.and_then(|(age,)| age))
    }

    /// Best-effort pub/sub wake-up; a missed notification only delays
    /// pickup until the next poll tick.
    async fn notify(&self, job_type: &str, job_id: &str) {
        if let Some(ref cache) = self.cache {
            if let Err(e) = cache.publish(&Self::channel(job_type), job_id).await {
                debug!(error = %e, job_type = %job_type, "Notify failed, workers will poll");
            }
        }
    }
}
