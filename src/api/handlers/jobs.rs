//! Job handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::api::middleware::ValidatedJson;
use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::models::{
    BackoffKind, EnqueueJobRequest, EnqueueJobResponse, Job, JobCounts, JobStatus, JobSummary,
    ListJobsQuery,
};
use crate::queue::EnqueueOptions;

/// Maximum jobs per list request
const MAX_JOBS_PER_PAGE: i64 = 100;

/// Validate job type filter for safe characters
fn validate_job_type_filter(name: &str) -> bool {
    name.len() <= 100
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Enqueue a new job
///
/// POST /api/v1/jobs
///
/// A `repeat` cron pattern creates a recurring schedule plus its first
/// occurrence instead of a one-shot job.
pub async fn create(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<EnqueueJobRequest>,
) -> AppResult<(StatusCode, Json<EnqueueJobResponse>)> {
    // The deployment cap may be tighter than the request-level bound
    let payload_size = serde_json::to_string(&request.payload)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .len();
    if payload_size > state.settings.queue.max_payload_size_bytes {
        return Err(AppError::PayloadTooLarge);
    }

    if request.repeat.is_some() && request.delay_ms.is_some_and(|ms| ms > 0) {
        return Err(AppError::BadRequest(
            "delay_ms cannot be combined with repeat; the cron expression determines run times"
                .to_string(),
        ));
    }

    let backoff = request
        .backoff
        .as_deref()
        .map(BackoffKind::try_from)
        .transpose()
        .map_err(AppError::BadRequest)?
        .unwrap_or_default();

    let options = EnqueueOptions {
        priority: request.priority.unwrap_or(0),
        max_attempts: request
            .max_attempts
            .unwrap_or(state.settings.queue.default_max_attempts),
        backoff,
        backoff_delay_ms: request
            .backoff_delay_ms
            .unwrap_or(state.settings.queue.default_backoff_delay_ms),
        timeout_seconds: request
            .timeout_seconds
            .unwrap_or(state.settings.queue.default_timeout_secs),
        run_at: request
            .delay_ms
            .filter(|&ms| ms > 0)
            .map(|ms| Utc::now() + Duration::milliseconds(ms)),
        schedule_id: None,
    };

    if let Some(ref cron_expression) = request.repeat {
        let (schedule, job) = state
            .queue
            .enqueue_repeating(&request.job_type, cron_expression, request.payload, options)
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?;

        state.metrics.jobs_enqueued_total.inc();

        return Ok((
            StatusCode::CREATED,
            Json(EnqueueJobResponse {
                id: job.id,
                status: job.status,
                schedule_id: Some(schedule.id),
            }),
        ));
    }

    let job = state
        .queue
        .enqueue(&request.job_type, request.payload, options)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to enqueue job");
            AppError::BadRequest(e.to_string())
        })?;

    state.metrics.jobs_enqueued_total.inc();

    Ok((
        StatusCode::CREATED,
        Json(EnqueueJobResponse {
            id: job.id,
            status: job.status,
            schedule_id: None,
        }),
    ))
}

/// List jobs with optional filtering
///
/// GET /api/v1/jobs
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> AppResult<Json<Vec<JobSummary>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_JOBS_PER_PAGE);
    let offset = query.offset.unwrap_or(0).max(0);

    let validated_job_type = query.job_type.as_ref().and_then(|t| {
        if validate_job_type_filter(t) {
            Some(t.clone())
        } else {
            tracing::warn!(job_type = %t, "Invalid job_type filter ignored");
            None
        }
    });

    let validated_status = query.status.as_ref().and_then(|s| {
        match JobStatus::try_from(s.clone()) {
            Ok(status) => Some(status.to_string()),
            Err(_) => {
                tracing::warn!(status = %s, "Invalid status filter ignored");
                None
            }
        }
    });

    // order_by/order_dir come from a whitelist, never raw user input
    let sql = format!(
        r#"
        SELECT * FROM jobs
        WHERE ($1::TEXT IS NULL OR job_type = $1)
          AND ($2::TEXT IS NULL OR status = $2)
        ORDER BY {} {}
        LIMIT $3 OFFSET $4
        "#,
        query.safe_order_by(),
        query.safe_order_dir(),
    );

    let jobs = sqlx::query_as::<_, Job>(&sql)
        .bind(&validated_job_type)
        .bind(&validated_status)
        .bind(limit)
        .bind(offset)
        .fetch_all(state.db.pool())
        .await?;

    let summaries: Vec<JobSummary> = jobs.into_iter().map(Into::into).collect();
    Ok(Json(summaries))
}

/// Query parameters for job counts
#[derive(Debug, Deserialize)]
pub struct CountsQuery {
    pub job_type: Option<String>,
}

/// Per-status job counts
///
/// GET /api/v1/jobs/counts
pub async fn counts(
    State(state): State<AppState>,
    Query(query): Query<CountsQuery>,
) -> AppResult<Json<JobCounts>> {
    let job_type = query.job_type.as_ref().and_then(|t| {
        if validate_job_type_filter(t) {
            Some(t.as_str())
        } else {
            None
        }
    });

    let counts = state
        .queue
        .counts(job_type)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(counts))
}

/// Get a job by ID
///
/// GET /api/v1/jobs/{id}
pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(&id)
        .fetch_optional(state.db.pool())
        .await?
        .ok_or_else(|| AppError::NotFound("Job not found".to_string()))?;

    Ok(Json(job))
}

/// Remove a job that has not started processing
///
/// DELETE /api/v1/jobs/{id}
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND status IN ('waiting', 'delayed')")
        .bind(&id)
        .execute(state.db.pool())
        .await?;

    if result.rows_affected() == 0 {
        let job_status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM jobs WHERE id = $1")
                .bind(&id)
                .fetch_optional(state.db.pool())
                .await?;

        match job_status {
            None => return Err(AppError::NotFound("Job not found".to_string())),
            Some(_) => {
                return Err(AppError::Conflict(
                    "Job cannot be removed (not in waiting or delayed state)".to_string(),
                ))
            }
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Re-submit a terminal failed job
///
/// POST /api/v1/jobs/{id}/retry
pub async fn retry(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Job>> {
    let job = state
        .queue
        .retry_failed(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let Some(job) = job else {
        let exists: Option<(String,)> = sqlx::query_as("SELECT status FROM jobs WHERE id = $1")
            .bind(&id)
            .fetch_optional(state.db.pool())
            .await?;

        return match exists {
            None => Err(AppError::NotFound("Job not found".to_string())),
            Some(_) => Err(AppError::Conflict(
                "Job cannot be retried (not in failed state)".to_string(),
            )),
        };
    };

    state.metrics.jobs_retried_total.inc();

    Ok(Json(job))
}
