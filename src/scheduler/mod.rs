//! Background maintenance loop for Conveyor
//!
//! This module handles periodic tasks:
//! - Promoting delayed jobs that have become due
//! - Materializing recurring schedules into concrete jobs
//! - Recovering jobs whose lease expired (stalled workers)
//! - Metrics collection
//! - Retention cleanup of terminal jobs

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::cache::RedisCache;
use crate::config::RetentionSettings;
use crate::models::CronExpr;
use crate::observability::Metrics;
use crate::queue::QueueManager;

/// Background scheduler that runs periodic maintenance tasks
pub struct Scheduler {
    db: Arc<PgPool>,
    cache: Option<Arc<RedisCache>>,
    metrics: Arc<Metrics>,
    retention: RetentionSettings,
}

impl Scheduler {
    pub fn new(
        db: Arc<PgPool>,
        cache: Option<Arc<RedisCache>>,
        metrics: Arc<Metrics>,
        retention: RetentionSettings,
    ) -> Self {
        Self {
            db,
            cache,
            metrics,
            retention,
        }
    }

    /// Run all background tasks until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Background scheduler starting");

        let mut promotion_ticker = interval(Duration::from_secs(5));
        let mut schedule_ticker = interval(Duration::from_secs(10));
        let mut lease_recovery_ticker = interval(Duration::from_secs(30));
        let mut metrics_ticker = interval(Duration::from_secs(15));
        let mut retention_ticker = interval(Duration::from_secs(300));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler shutdown signal received");
                        break;
                    }
                }

                _ = promotion_ticker.tick() => {
                    if let Err(e) = self.promote_delayed_jobs().await {
                        error!(error = %e, "Failed to promote delayed jobs");
                    }
                }

                _ = schedule_ticker.tick() => {
                    if let Err(e) = self.process_schedules().await {
                        error!(error = %e, "Failed to process schedules");
                    }
                }

                _ = lease_recovery_ticker.tick() => {
                    if let Err(e) = self.recover_stalled_jobs().await {
                        error!(error = %e, "Failed to recover stalled jobs");
                    }
                }

                _ = metrics_ticker.tick() => {
                    if let Err(e) = self.update_metrics().await {
                        error!(error = %e, "Failed to update metrics");
                    }
                }

                _ = retention_ticker.tick() => {
                    if let Err(e) = self.apply_retention().await {
                        error!(error = %e, "Failed to apply retention");
                    }
                }
            }
        }

        info!("Scheduler shutdown complete");
        Ok(())
    }

    /// Promote delayed jobs whose run_at has passed to waiting
    async fn promote_delayed_jobs(&self) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET
                status = 'waiting',
                updated_at = NOW()
            WHERE
                status = 'delayed'
                AND run_at <= NOW()
            "#,
        )
        .execute(&*self.db)
        .await?;

        let promoted = result.rows_affected();
        if promoted > 0 {
            info!(count = promoted, "Promoted delayed jobs to waiting");

            // Wake up workers waiting on pub/sub rather than the poll tick
            if let Some(ref cache) = self.cache {
                let job_types: Vec<(String,)> = sqlx::query_as(
                    r#"
                    SELECT DISTINCT job_type
                    FROM jobs
                    WHERE status = 'waiting'
                      AND run_at IS NOT NULL
                      AND updated_at > NOW() - INTERVAL '5 seconds'
                    "#,
                )
                .fetch_all(&*self.db)
                .await?;

                for (job_type,) in job_types {
                    let _ = cache
                        .publish(&QueueManager::channel(&job_type), "delayed_promoted")
                        .await;
                }
            }
        }

        Ok(())
    }

    /// Upper bound on schedules materialized per tick
    const MAX_SCHEDULES_PER_TICK: usize = 100;

    /// Materialize due recurring schedules into concrete jobs
    ///
    /// Each due row is claimed with FOR UPDATE SKIP LOCKED inside the
    /// same transaction that inserts the job and advances next_run_at,
    /// so the row lock is held until the advance commits. A concurrent
    /// instance either skips the locked row or, once the commit lands,
    /// no longer sees it as due; an occurrence fires exactly once.
    async fn process_schedules(&self) -> Result<()> {
        #[derive(sqlx::FromRow)]
        struct DueSchedule {
            id: String,
            job_type: String,
            cron_expression: String,
            payload: serde_json::Value,
            priority: i32,
            max_attempts: i32,
            backoff: String,
            backoff_delay_ms: i64,
            timeout_seconds: i32,
        }

        let mut processed = 0;

        for _ in 0..Self::MAX_SCHEDULES_PER_TICK {
            let mut tx = self.db.begin().await?;

            let schedule: Option<DueSchedule> = sqlx::query_as(
                r#"
                SELECT id, job_type, cron_expression, payload, priority,
                       max_attempts, backoff, backoff_delay_ms, timeout_seconds
                FROM schedules
                WHERE is_active = TRUE
                  AND next_run_at IS NOT NULL
                  AND next_run_at <= NOW()
                ORDER BY next_run_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some(schedule) = schedule else {
                tx.rollback().await?;
                break;
            };

            let now = Utc::now();
            let next_run = CronExpr::parse(&schedule.cron_expression)
                .ok()
                .and_then(|c| c.next_occurrence_after(now));

            let job_id = uuid::Uuid::new_v4().to_string();

            let job_result = sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_type, payload, status, priority,
                    max_attempts, backoff, backoff_delay_ms, timeout_seconds,
                    schedule_id, created_at, updated_at
                )
                VALUES ($1, $2, $3, 'waiting', $4, $5, $6, $7, $8, $9, $10, $10)
                "#,
            )
            .bind(&job_id)
            .bind(&schedule.job_type)
            .bind(&schedule.payload)
            .bind(schedule.priority)
            .bind(schedule.max_attempts)
            .bind(&schedule.backoff)
            .bind(schedule.backoff_delay_ms)
            .bind(schedule.timeout_seconds)
            .bind(&schedule.id)
            .bind(now)
            .execute(&mut *tx)
            .await;

            match job_result {
                Ok(_) => {
                    sqlx::query(
                        r#"
                        UPDATE schedules
                        SET last_run_at = $2, run_count = run_count + 1, next_run_at = $3, updated_at = $2
                        WHERE id = $1
                        "#,
                    )
                    .bind(&schedule.id)
                    .bind(now)
                    .bind(next_run)
                    .execute(&mut *tx)
                    .await?;

                    tx.commit().await?;

                    processed += 1;
                    self.metrics.jobs_enqueued_total.inc();

                    if let Some(ref cache) = self.cache {
                        let _ = cache
                            .publish(&QueueManager::channel(&schedule.job_type), "scheduled")
                            .await;
                    }
                }
                Err(e) => {
                    // The aborted transaction cannot run further statements
                    tx.rollback().await?;

                    error!(schedule_id = %schedule.id, error = %e, "Failed to materialize schedule");

                    // Still advance next_run_at so the schedule cannot wedge
                    sqlx::query(
                        "UPDATE schedules SET next_run_at = $2, updated_at = NOW() WHERE id = $1",
                    )
                    .bind(&schedule.id)
                    .bind(next_run)
                    .execute(&*self.db)
                    .await?;
                }
            }
        }

        if processed > 0 {
            info!(count = processed, "Materialized due schedules");
        }

        Ok(())
    }

    /// Recover active jobs whose lease has expired (worker crashed or hung)
    ///
    /// A stalled attempt counts against the retry budget.
    async fn recover_stalled_jobs(&self) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET
                status = 'waiting',
                claimed_by = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                started_at = NULL,
                run_at = NULL,
                attempts_made = attempts_made + 1,
                last_error = 'Lease expired (worker stalled)',
                updated_at = NOW()
            WHERE
                status = 'active'
                AND lease_expires_at < NOW()
                AND attempts_made + 1 < max_attempts
            "#,
        )
        .execute(&*self.db)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(count = recovered, "Recovered stalled jobs for retry");
            self.metrics.jobs_stalled_total.inc_by(recovered);
            self.metrics.jobs_retried_total.inc_by(recovered);
        }

        // Jobs out of retry budget go terminal
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET
                status = 'failed',
                claimed_by = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                attempts_made = attempts_made + 1,
                last_error = 'Lease expired (worker stalled); retry budget exhausted',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE
                status = 'active'
                AND lease_expires_at < NOW()
                AND attempts_made + 1 >= max_attempts
            "#,
        )
        .execute(&*self.db)
        .await?;

        let failed = result.rows_affected();
        if failed > 0 {
            warn!(count = failed, "Stalled jobs exhausted retry budget");
            self.metrics.jobs_stalled_total.inc_by(failed);
            self.metrics.jobs_failed_total.inc_by(failed);
        }

        Ok(())
    }

    /// Update Prometheus gauges from database state
    async fn update_metrics(&self) -> Result<()> {
        let counts: (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'waiting') as waiting,
                COUNT(*) FILTER (WHERE status = 'delayed') as delayed,
                COUNT(*) FILTER (WHERE status = 'active') as active
            FROM jobs
            "#,
        )
        .fetch_one(&*self.db)
        .await?;

        self.metrics.jobs_waiting.set(counts.0);
        self.metrics.jobs_delayed.set(counts.1);
        self.metrics.jobs_active.set(counts.2);

        // Age of the oldest claimable job, the key queue health signal
        let max_age: Option<(Option<i64>,)> = sqlx::query_as(
            r#"
            SELECT EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT
            FROM jobs
            WHERE status = 'waiting'
            "#,
        )
        .fetch_optional(&*self.db)
        .await?;

        match max_age {
            Some((Some(age),)) => self.metrics.oldest_waiting_age_seconds.set(age),
            _ => self.metrics.oldest_waiting_age_seconds.set(0),
        }

        debug!("Metrics updated");
        Ok(())
    }

    /// Delete terminal jobs past their retention window
    async fn apply_retention(&self) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE
                status = 'completed'
                AND completed_at < NOW() - make_interval(hours => $1)
            "#,
        )
        .bind(self.retention.completed_retention_hours as i32)
        .execute(&*self.db)
        .await?;

        let completed_removed = result.rows_affected();
        if completed_removed > 0 {
            info!(
                count = completed_removed,
                retention_hours = self.retention.completed_retention_hours,
                "Cleaned up old completed jobs"
            );
        }

        // Failed jobs are capped by count, keeping the newest for inspection
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'failed'
                ORDER BY updated_at DESC
                OFFSET $1
            )
            "#,
        )
        .bind(self.retention.failed_retention_cap as i64)
        .execute(&*self.db)
        .await?;

        let failed_removed = result.rows_affected();
        if failed_removed > 0 {
            info!(
                count = failed_removed,
                cap = self.retention.failed_retention_cap,
                "Trimmed failed jobs beyond retention cap"
            );
        }

        Ok(())
    }
}
