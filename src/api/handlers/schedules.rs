//! Schedule handlers for recurring jobs
//!
//! CRUD operations for cron-based job schedules.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::api::middleware::ValidatedJson;
use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::models::{CreateScheduleRequest, CreateScheduleResponse, CronExpr, Schedule};

/// List all schedules
///
/// GET /api/v1/schedules
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListSchedulesQuery>,
) -> AppResult<Json<Vec<Schedule>>> {
    let schedules: Vec<Schedule> = sqlx::query_as(
        r#"
        SELECT *
        FROM schedules
        ORDER BY created_at DESC
        LIMIT $1
        "#,
    )
    .bind(params.safe_limit())
    .fetch_all(state.db.pool())
    .await?;

    Ok(Json(schedules))
}

/// Get a schedule by ID
///
/// GET /api/v1/schedules/{id}
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Schedule>> {
    let schedule: Option<Schedule> = sqlx::query_as("SELECT * FROM schedules WHERE id = $1")
        .bind(&id)
        .fetch_optional(state.db.pool())
        .await?;

    schedule
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Schedule not found".to_string()))
}

/// Create a new schedule
///
/// POST /api/v1/schedules
pub async fn create(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CreateScheduleRequest>,
) -> AppResult<(StatusCode, Json<CreateScheduleResponse>)> {
    let cron = CronExpr::parse(&req.cron_expression)
        .map_err(|e| AppError::BadRequest(format!("Invalid cron expression: {}", e)))?;

    let next_run = cron.next_occurrence_after(Utc::now());

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO schedules (
            id, job_type, cron_expression, payload, priority,
            max_attempts, backoff, backoff_delay_ms, timeout_seconds,
            is_active, next_run_at, run_count, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, $10, 0, $11, $11)
        "#,
    )
    .bind(&id)
    .bind(&req.job_type)
    .bind(&req.cron_expression)
    .bind(&req.payload)
    .bind(req.priority.unwrap_or(0))
    .bind(
        req.max_attempts
            .unwrap_or(state.settings.queue.default_max_attempts),
    )
    .bind(req.backoff.as_deref().unwrap_or("exponential"))
    .bind(
        req.backoff_delay_ms
            .unwrap_or(state.settings.queue.default_backoff_delay_ms),
    )
    .bind(
        req.timeout_seconds
            .unwrap_or(state.settings.queue.default_timeout_secs),
    )
    .bind(next_run)
    .bind(now)
    .execute(state.db.pool())
    .await?;

    info!(schedule_id = %id, job_type = %req.job_type, "Schedule created");

    Ok((
        StatusCode::CREATED,
        Json(CreateScheduleResponse {
            id,
            job_type: req.job_type,
            cron_expression: req.cron_expression,
            next_run_at: next_run,
        }),
    ))
}

/// Delete a schedule
///
/// DELETE /api/v1/schedules/{id}
///
/// Jobs already materialised from the schedule are kept; their
/// schedule_id is nulled by the foreign key.
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
        .bind(&id)
        .execute(state.db.pool())
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Schedule not found".to_string()));
    }

    info!(schedule_id = %id, "Schedule deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Pause a schedule
///
/// POST /api/v1/schedules/{id}/pause
pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Schedule>> {
    let schedule: Option<Schedule> = sqlx::query_as(
        r#"
        UPDATE schedules
        SET is_active = FALSE, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(&id)
    .fetch_optional(state.db.pool())
    .await?;

    schedule
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Schedule not found".to_string()))
}

/// Resume a schedule
///
/// POST /api/v1/schedules/{id}/resume
///
/// next_run_at is recomputed from now so missed occurrences are not
/// fired retroactively.
pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Schedule>> {
    let current: Option<Schedule> = sqlx::query_as("SELECT * FROM schedules WHERE id = $1")
        .bind(&id)
        .fetch_optional(state.db.pool())
        .await?;

    let current = current.ok_or_else(|| AppError::NotFound("Schedule not found".to_string()))?;

    let next_run = CronExpr::parse(&current.cron_expression)
        .ok()
        .and_then(|c| c.next_occurrence_after(Utc::now()));

    let schedule: Option<Schedule> = sqlx::query_as(
        r#"
        UPDATE schedules
        SET is_active = TRUE, next_run_at = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(&id)
    .bind(next_run)
    .fetch_optional(state.db.pool())
    .await?;

    schedule
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Schedule not found".to_string()))
}

/// Query parameters for listing schedules
#[derive(Debug, Deserialize)]
pub struct ListSchedulesQuery {
    pub limit: Option<u32>,
}

impl ListSchedulesQuery {
    /// Get limit with enforced maximum to prevent memory exhaustion
    pub fn safe_limit(&self) -> i64 {
        const MAX_SCHEDULE_LIMIT: u32 = 500;
        self.limit.unwrap_or(100).min(MAX_SCHEDULE_LIMIT) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_schedules_safe_limit() {
        let default = ListSchedulesQuery { limit: None };
        assert_eq!(default.safe_limit(), 100);

        let capped = ListSchedulesQuery { limit: Some(9999) };
        assert_eq!(capped.safe_limit(), 500);

        let small = ListSchedulesQuery { limit: Some(10) };
        assert_eq!(small.safe_limit(), 10);
    }
}
