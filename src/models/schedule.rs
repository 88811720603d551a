//! Schedule models for recurring jobs
//!
//! A schedule materialises one job per cron occurrence. Expressions use
//! six fields with seconds resolution, evaluated in UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// A recurring job definition
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Schedule {
    /// Unique schedule ID
    pub id: String,
    /// Job type for materialised jobs
    pub job_type: String,
    /// Cron expression (e.g., "0 */5 * * * *" for every 5 minutes)
    pub cron_expression: String,
    /// Payload for materialised jobs (JSON)
    pub payload: serde_json::Value,
    /// Job priority
    pub priority: i32,
    /// Max attempts for materialised jobs
    pub max_attempts: i32,
    /// Backoff strategy for materialised jobs
    pub backoff: String,
    /// Backoff base delay in milliseconds
    pub backoff_delay_ms: i64,
    /// Timeout in seconds
    pub timeout_seconds: i32,
    /// Whether the schedule is active; paused schedules materialise nothing
    pub is_active: bool,
    /// Last time a job was created from this schedule
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next scheduled run time
    pub next_run_at: Option<DateTime<Utc>>,
    /// Number of times this schedule has triggered
    pub run_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Maximum payload size for schedule payloads (1MB)
const MAX_SCHEDULE_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Validate schedule payload size
fn validate_schedule_payload_size(
    payload: &serde_json::Value,
) -> Result<(), validator::ValidationError> {
    let json_str = serde_json::to_string(payload).unwrap_or_default();
    if json_str.len() > MAX_SCHEDULE_PAYLOAD_SIZE {
        let mut err = validator::ValidationError::new("payload_too_large");
        err.message = Some(std::borrow::Cow::Owned(format!(
            "Payload too large: {} bytes (max: {} bytes)",
            json_str.len(),
            MAX_SCHEDULE_PAYLOAD_SIZE
        )));
        return Err(err);
    }
    Ok(())
}

/// Validate cron expressions at the API boundary
fn validate_cron_expression(expression: &str) -> Result<(), validator::ValidationError> {
    if let Err(reason) = CronExpr::parse(expression) {
        let mut err = validator::ValidationError::new("invalid_cron");
        err.message = Some(std::borrow::Cow::Owned(reason));
        return Err(err);
    }
    Ok(())
}

/// Request to create a new schedule
#[derive(Debug, Deserialize, Validate)]
pub struct CreateScheduleRequest {
    /// Job type for materialised jobs
    #[validate(length(min = 1, max = 100, message = "Job type must be 1-100 characters"))]
    pub job_type: String,
    /// Cron expression (6 fields, seconds first)
    #[validate(custom(function = "validate_cron_expression"))]
    pub cron_expression: String,
    /// Payload for materialised jobs (max 1MB)
    #[validate(custom(function = "validate_schedule_payload_size"))]
    pub payload: serde_json::Value,
    /// Priority (default 0)
    #[validate(range(min = -100, max = 100, message = "Priority must be -100 to 100"))]
    pub priority: Option<i32>,
    /// Max attempts (default from settings)
    #[validate(range(min = 1, max = 100, message = "Max attempts must be 1-100"))]
    pub max_attempts: Option<i32>,
    /// Backoff strategy: 'fixed' or 'exponential'
    pub backoff: Option<String>,
    /// Backoff base delay in milliseconds
    #[validate(range(
        min = 100,
        max = 3_600_000,
        message = "Backoff delay must be between 100ms and 1 hour"
    ))]
    pub backoff_delay_ms: Option<i64>,
    /// Timeout seconds (default from settings)
    #[validate(range(min = 1, max = 86400, message = "Timeout must be 1-86400 seconds"))]
    pub timeout_seconds: Option<i32>,
}

/// Response after creating a schedule
#[derive(Debug, Serialize)]
pub struct CreateScheduleResponse {
    pub id: String,
    pub job_type: String,
    pub cron_expression: String,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Parsed cron expression for scheduling
#[derive(Debug, Clone)]
pub struct CronExpr {
    pub second: CronField,
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    pub day_of_week: CronField,
}

/// A single field in a cron expression
#[derive(Debug, Clone)]
pub enum CronField {
    Any,
    Value(u8),
    Range(u8, u8),
    Step(u8),
    List(Vec<u8>),
}

impl CronExpr {
    /// Parse a cron expression string
    /// Supports: second minute hour day-of-month month day-of-week
    /// Examples:
    /// "0 * * * * *" - every minute
    /// "0 */5 * * * *" - every 5 minutes
    /// "0 0 */2 * * *" - every 2 hours
    /// "0 0 0 * * *" - daily at midnight
    /// "0 0 0 * * 1" - every Monday at midnight
    pub fn parse(expression: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expression.split_whitespace().collect();

        if parts.len() != 6 {
            return Err(format!(
                "Invalid cron expression: expected 6 fields, got {}",
                parts.len()
            ));
        }

        Ok(CronExpr {
            second: Self::parse_field(parts[0], 0, 59)?,
            minute: Self::parse_field(parts[1], 0, 59)?,
            hour: Self::parse_field(parts[2], 0, 23)?,
            day_of_month: Self::parse_field(parts[3], 1, 31)?,
            month: Self::parse_field(parts[4], 1, 12)?,
            day_of_week: Self::parse_field(parts[5], 0, 6)?,
        })
    }

    fn parse_field(field: &str, min: u8, max: u8) -> Result<CronField, String> {
        if field == "*" {
            return Ok(CronField::Any);
        }

        // Step values (*/5)
        if let Some(step) = field.strip_prefix("*/") {
            let step: u8 = step
                .parse()
                .map_err(|_| format!("Invalid step value: {}", step))?;
            // Step 0 would make value % step panic
            if step == 0 {
                return Err("Step value cannot be 0".to_string());
            }
            if step > max {
                return Err(format!(
                    "Step value {} exceeds maximum {} for this field",
                    step, max
                ));
            }
            return Ok(CronField::Step(step));
        }

        // Ranges (1-5)
        if field.contains('-') {
            let parts: Vec<&str> = field.split('-').collect();
            if parts.len() != 2 {
                return Err(format!("Invalid range: {}", field));
            }
            let start: u8 = parts[0]
                .parse()
                .map_err(|_| format!("Invalid range start: {}", parts[0]))?;
            let end: u8 = parts[1]
                .parse()
                .map_err(|_| format!("Invalid range end: {}", parts[1]))?;
            if start > end || start < min || end > max {
                return Err(format!("Range out of bounds: {}-{}", start, end));
            }
            return Ok(CronField::Range(start, end));
        }

        // Lists (1,3,5)
        if field.contains(',') {
            let values: Result<Vec<u8>, _> = field.split(',').map(|v| v.parse::<u8>()).collect();
            let values = values.map_err(|_| format!("Invalid list value in: {}", field))?;
            for &v in &values {
                if v < min || v > max {
                    return Err(format!("List value out of bounds: {}", v));
                }
            }
            return Ok(CronField::List(values));
        }

        // Single value
        let value: u8 = field
            .parse()
            .map_err(|_| format!("Invalid field value: {}", field))?;
        if value < min || value > max {
            return Err(format!("Value out of bounds: {}", value));
        }
        Ok(CronField::Value(value))
    }

    /// Check if a field matches a value
    fn field_matches(field: &CronField, value: u8) -> bool {
        match field {
            CronField::Any => true,
            CronField::Value(v) => *v == value,
            CronField::Range(start, end) => value >= *start && value <= *end,
            CronField::Step(step) => value % *step == 0,
            CronField::List(values) => values.contains(&value),
        }
    }

    /// Calculate the next occurrence strictly after the given time
    ///
    /// Steps by minutes or hours when those fields cannot match, so
    /// typical expressions resolve in a handful of iterations. Gives up
    /// after roughly a year of scanning.
    pub fn next_occurrence_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        use chrono::{Datelike, Duration, Timelike};

        let mut current = after + Duration::seconds(1);
        current = current.with_nanosecond(0).unwrap_or(current);

        let max_iterations = 525600; // one year in minutes
        let mut iterations = 0;

        while iterations < max_iterations {
            let second = current.second() as u8;
            let minute = current.minute() as u8;
            let hour = current.hour() as u8;
            let day = current.day() as u8;
            let month = current.month() as u8;
            let weekday = current.weekday().num_days_from_sunday() as u8;

            if Self::field_matches(&self.second, second)
                && Self::field_matches(&self.minute, minute)
                && Self::field_matches(&self.hour, hour)
                && Self::field_matches(&self.day_of_month, day)
                && Self::field_matches(&self.month, month)
                && Self::field_matches(&self.day_of_week, weekday)
            {
                return Some(current);
            }

            let step = if !Self::field_matches(&self.minute, minute)
                && !Self::field_matches(&self.hour, hour)
            {
                // Neither minute nor hour match, skip to next hour
                Duration::seconds(3600 - (minute as i64 * 60) - second as i64)
            } else if !Self::field_matches(&self.minute, minute) {
                // Skip to next minute
                Duration::seconds(60 - second as i64)
            } else if !Self::field_matches(&self.second, second) {
                Duration::seconds(1)
            } else {
                // Date-level mismatch, step by a minute
                Duration::seconds(60)
            };

            current += step.max(Duration::seconds(1));
            iterations += 1;
        }

        tracing::warn!(
            iterations = iterations,
            "next_occurrence_after hit iteration limit - possible invalid cron expression"
        );

        None
    }
}
