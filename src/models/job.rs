//! Job model and related types
//!
//! Jobs are the core unit of work in Conveyor. Each job carries a small
//! JSON payload and a retry policy, and moves through the lifecycle
//! delayed -> waiting -> active -> completed | failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// Job status enumeration
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is scheduled for the future (delay or retry backoff)
    Delayed,
    /// Job is eligible and waiting for a worker
    #[default]
    Waiting,
    /// Job is currently being processed under a lease
    Active,
    /// Job completed successfully
    Completed,
    /// Job failed terminally (retries exhausted or fatal error)
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Delayed => write!(f, "delayed"),
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "delayed" => Ok(JobStatus::Delayed),
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Constant delay between attempts
    Fixed,
    /// Delay doubles with every failed attempt
    #[default]
    Exponential,
}

/// Ceiling on any single retry delay
pub const MAX_BACKOFF_MS: i64 = 60 * 60 * 1000;

impl BackoffKind {
    /// Delay before the next attempt, given the number of failures so far.
    ///
    /// `failed_attempts` is at least 1 when a retry is being scheduled.
    /// Exponential growth is capped at one hour so a long retry tail
    /// stays bounded.
    pub fn delay_ms(&self, base_ms: i64, failed_attempts: i32) -> i64 {
        let base = base_ms.max(0);
        match self {
            BackoffKind::Fixed => base.min(MAX_BACKOFF_MS),
            BackoffKind::Exponential => {
                let shift = (failed_attempts - 1).clamp(0, 30) as u32;
                base.saturating_mul(1_i64 << shift).min(MAX_BACKOFF_MS)
            }
        }
    }
}

impl std::fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffKind::Fixed => write!(f, "fixed"),
            BackoffKind::Exponential => write!(f, "exponential"),
        }
    }
}

impl TryFrom<&str> for BackoffKind {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            _ => Err(format!("Invalid backoff kind: {}", s)),
        }
    }
}

/// Job entity representing a unit of work
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    /// Unique identifier
    pub id: String,
    /// Job type; handlers are registered per type
    pub job_type: String,
    /// Job payload (JSON)
    pub payload: serde_json::Value,
    /// Current status
    pub status: String,
    /// Result recorded from a successful handler return
    pub result: Option<serde_json::Value>,
    /// Priority (higher = claimed first)
    pub priority: i32,
    /// Execution attempts consumed so far
    pub attempts_made: i32,
    /// Maximum execution attempts
    pub max_attempts: i32,
    /// Backoff strategy ('fixed' or 'exponential')
    pub backoff: String,
    /// Backoff base delay in milliseconds
    pub backoff_delay_ms: i64,
    /// Handler execution deadline in seconds
    pub timeout_seconds: i32,
    /// Earliest eligibility time (delay or retry target)
    pub run_at: Option<DateTime<Utc>>,
    /// Most recent failure message
    pub last_error: Option<String>,
    /// Worker currently holding the lease
    pub claimed_by: Option<String>,
    /// Current lease ID
    pub lease_id: Option<String>,
    /// Lease expiration time
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Recurring schedule that materialised this job
    pub schedule_id: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When processing started
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Parsed backoff strategy; unknown values fall back to exponential.
    pub fn backoff_kind(&self) -> BackoffKind {
        BackoffKind::try_from(self.backoff.as_str()).unwrap_or_default()
    }
}

/// Maximum payload size in bytes (1MB)
pub const MAX_JOB_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Validate job payload size
fn validate_payload_size(payload: &serde_json::Value) -> Result<(), validator::ValidationError> {
    let json_str = serde_json::to_string(payload).unwrap_or_default();
    if json_str.len() > MAX_JOB_PAYLOAD_SIZE {
        let mut err = validator::ValidationError::new("payload_too_large");
        err.message = Some(std::borrow::Cow::Owned(format!(
            "Payload too large: {} bytes (max: {} bytes)",
            json_str.len(),
            MAX_JOB_PAYLOAD_SIZE
        )));
        return Err(err);
    }
    Ok(())
}

/// Validate job type characters
fn validate_job_type_chars(name: &str) -> Result<(), validator::ValidationError> {
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        let mut err = validator::ValidationError::new("invalid_job_type");
        err.message = Some(std::borrow::Cow::Borrowed(
            "Job type can only contain alphanumeric characters, dashes, underscores, and dots",
        ));
        return Err(err);
    }
    if name.starts_with('.') || name.starts_with('-') {
        let mut err = validator::ValidationError::new("invalid_job_type");
        err.message = Some(std::borrow::Cow::Borrowed(
            "Job type cannot start with dots or dashes",
        ));
        return Err(err);
    }
    Ok(())
}

/// Validate backoff kind strings in requests
fn validate_backoff_kind(value: &str) -> Result<(), validator::ValidationError> {
    if BackoffKind::try_from(value).is_err() {
        let mut err = validator::ValidationError::new("invalid_backoff");
        err.message = Some(std::borrow::Cow::Borrowed(
            "Backoff must be 'fixed' or 'exponential'",
        ));
        return Err(err);
    }
    Ok(())
}

/// Request to enqueue a new job
#[derive(Debug, Deserialize, Validate)]
pub struct EnqueueJobRequest {
    /// Job type (required)
    #[validate(length(min = 1, max = 100, message = "Job type must be 1-100 characters"))]
    #[validate(custom(function = "validate_job_type_chars"))]
    pub job_type: String,

    /// Job payload (required), validated for size
    #[validate(custom(function = "validate_payload_size"))]
    pub payload: serde_json::Value,

    /// Priority (default: 0)
    #[validate(range(min = -100, max = 100, message = "Priority must be between -100 and 100"))]
    pub priority: Option<i32>,

    /// Delay before the job becomes eligible, in milliseconds
    #[validate(range(
        min = 0,
        max = 2_592_000_000_i64,
        message = "Delay must be between 0 and 30 days"
    ))]
    pub delay_ms: Option<i64>,

    /// Cron pattern; creates a recurring schedule instead of a one-shot job
    pub repeat: Option<String>,

    /// Maximum attempts (default from settings)
    #[validate(range(min = 1, max = 100, message = "Max attempts must be between 1 and 100"))]
    pub max_attempts: Option<i32>,

    /// Backoff strategy: 'fixed' or 'exponential'
    #[validate(custom(function = "validate_backoff_kind"))]
    pub backoff: Option<String>,

    /// Backoff base delay in milliseconds
    #[validate(range(
        min = 100,
        max = 3_600_000,
        message = "Backoff delay must be between 100ms and 1 hour"
    ))]
    pub backoff_delay_ms: Option<i64>,

    /// Timeout in seconds (default from settings)
    #[validate(range(
        min = 1,
        max = 86400,
        message = "Timeout must be between 1 and 86400 seconds"
    ))]
    pub timeout_seconds: Option<i32>,
}

/// Response after enqueuing a job
#[derive(Debug, Serialize)]
pub struct EnqueueJobResponse {
    /// Job ID (for repeating jobs, the first materialised occurrence)
    pub id: String,
    /// Initial status
    pub status: String,
    /// Schedule ID when a `repeat` pattern was given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
}

/// Job summary for list responses
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub job_type: String,
    pub status: String,
    pub priority: i32,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub run_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            run_at: job.run_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Allowed order_by fields (whitelist to prevent SQL injection)
pub const ALLOWED_ORDER_BY_FIELDS: &[&str] = &[
    "created_at",
    "updated_at",
    "run_at",
    "completed_at",
    "priority",
    "status",
    "job_type",
    "attempts_made",
];

/// Query parameters for listing jobs
#[derive(Debug, Deserialize, Default)]
pub struct ListJobsQuery {
    /// Filter by job type
    pub job_type: Option<String>,
    /// Filter by status
    pub status: Option<String>,
    /// Maximum number of results (default: 50)
    pub limit: Option<i64>,
    /// Offset for pagination
    pub offset: Option<i64>,
    /// Order by field (default: created_at)
    pub order_by: Option<String>,
    /// Order direction (asc/desc, default: desc)
    pub order_dir: Option<String>,
}

impl ListJobsQuery {
    /// Get safe order_by field (validated against whitelist)
    pub fn safe_order_by(&self) -> &str {
        match &self.order_by {
            Some(field) if ALLOWED_ORDER_BY_FIELDS.contains(&field.as_str()) => field,
            _ => "created_at",
        }
    }

    /// Get safe order direction
    pub fn safe_order_dir(&self) -> &str {
        match &self.order_dir {
            Some(dir) if dir.eq_ignore_ascii_case("asc") => "ASC",
            _ => "DESC",
        }
    }
}

/// Per-status job counts; observability only, never used for control flow
#[derive(Debug, Serialize)]
pub struct JobCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::Waiting.to_string(), "waiting");
        assert_eq!(JobStatus::Active.to_string(), "active");
        assert_eq!(JobStatus::Delayed.to_string(), "delayed");
    }

    #[test]
    fn test_job_status_from_string() {
        assert_eq!(
            JobStatus::try_from("waiting".to_string()).unwrap(),
            JobStatus::Waiting
        );
        assert_eq!(
            JobStatus::try_from("failed".to_string()).unwrap(),
            JobStatus::Failed
        );
        assert!(JobStatus::try_from("invalid".to_string()).is_err());
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let kind = BackoffKind::Fixed;
        assert_eq!(kind.delay_ms(1000, 1), 1000);
        assert_eq!(kind.delay_ms(1000, 5), 1000);
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let kind = BackoffKind::Exponential;
        assert_eq!(kind.delay_ms(1000, 1), 1000);
        assert_eq!(kind.delay_ms(1000, 2), 2000);
        assert_eq!(kind.delay_ms(1000, 3), 4000);
        assert_eq!(kind.delay_ms(1000, 4), 8000);
    }

    #[test]
    fn test_backoff_is_non_decreasing() {
        for kind in [BackoffKind::Fixed, BackoffKind::Exponential] {
            let mut prev = 0;
            for attempt in 1..=20 {
                let delay = kind.delay_ms(500, attempt);
                assert!(delay >= prev, "{kind} backoff decreased at attempt {attempt}");
                prev = delay;
            }
        }
    }

    #[test]
    fn test_exponential_backoff_capped_at_one_hour() {
        let kind = BackoffKind::Exponential;
        assert_eq!(kind.delay_ms(1000, 30), MAX_BACKOFF_MS);
        // Shift is clamped, so huge attempt counts don't overflow
        assert_eq!(kind.delay_ms(1000, 1000), MAX_BACKOFF_MS);
    }

    #[test]
    fn test_backoff_kind_parse() {
        assert_eq!(BackoffKind::try_from("fixed").unwrap(), BackoffKind::Fixed);
        assert_eq!(
            BackoffKind::try_from("exponential").unwrap(),
            BackoffKind::Exponential
        );
        assert!(BackoffKind::try_from("linear").is_err());
    }

    #[test]
    fn test_enqueue_request_rejects_bad_job_type() {
        let request = EnqueueJobRequest {
            job_type: "-bad/name".to_string(),
            payload: serde_json::json!({}),
            priority: None,
            delay_ms: None,
            repeat: None,
            max_attempts: None,
            backoff: None,
            backoff_delay_ms: None,
            timeout_seconds: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_enqueue_request_rejects_oversized_payload() {
        let big = "x".repeat(MAX_JOB_PAYLOAD_SIZE + 1);
        let request = EnqueueJobRequest {
            job_type: "emails".to_string(),
            payload: serde_json::json!({ "blob": big }),
            priority: None,
            delay_ms: None,
            repeat: None,
            max_attempts: None,
            backoff: None,
            backoff_delay_ms: None,
            timeout_seconds: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_enqueue_request_accepts_valid_input() {
        let request = EnqueueJobRequest {
            job_type: "video.transcode".to_string(),
            payload: serde_json::json!({ "video_id": "v-123" }),
            priority: Some(10),
            delay_ms: Some(5000),
            repeat: None,
            max_attempts: Some(5),
            backoff: Some("exponential".to_string()),
            backoff_delay_ms: Some(2000),
            timeout_seconds: Some(600),
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_job_summary_from_job() {
        let now = Utc::now();
        let job = Job {
            id: "test-id".to_string(),
            job_type: "default".to_string(),
            payload: serde_json::json!({}),
            status: "waiting".to_string(),
            result: None,
            priority: 0,
            attempts_made: 0,
            max_attempts: 3,
            backoff: "exponential".to_string(),
            backoff_delay_ms: 1000,
            timeout_seconds: 300,
            run_at: None,
            last_error: None,
            claimed_by: None,
            lease_id: None,
            lease_expires_at: None,
            schedule_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        let summary = JobSummary::from(job.clone());
        assert_eq!(summary.id, job.id);
        assert_eq!(summary.job_type, job.job_type);
        assert_eq!(summary.attempts_made, 0);
    }

    #[test]
    fn test_safe_order_by_rejects_unknown_fields() {
        let query = ListJobsQuery {
            order_by: Some("payload; DROP TABLE jobs".to_string()),
            ..Default::default()
        };
        assert_eq!(query.safe_order_by(), "created_at");

        let query = ListJobsQuery {
            order_by: Some("priority".to_string()),
            order_dir: Some("asc".to_string()),
            ..Default::default()
        };
        assert_eq!(query.safe_order_by(), "priority");
        assert_eq!(query.safe_order_dir(), "ASC");
    }

    #[test]
    fn test_job_counts_total() {
        let counts = JobCounts {
            waiting: 10,
            delayed: 5,
            active: 3,
            completed: 100,
            failed: 2,
            total: 120,
        };

        let calculated =
            counts.waiting + counts.delayed + counts.active + counts.completed + counts.failed;
        assert_eq!(calculated, counts.total);
    }
}
