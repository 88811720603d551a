//! API tests for Conveyor
//!
//! These tests exercise the HTTP surface against a real PostgreSQL
//! container. Redis is intentionally absent; the service must degrade
//! gracefully without it.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use common::{assertions, fixtures, TestDatabase};

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).expect("Response body was not valid JSON")
}

fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn test_liveness_endpoint() {
    let db = TestDatabase::new().await;
    let app = db.app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health/live")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_readiness_with_database() {
    let db = TestDatabase::new().await;
    let app = db.app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health/ready")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_reports_degradation_fields() {
    let db = TestDatabase::new().await;
    let app = db.app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], true);
    // No Redis configured counts as healthy, not degraded
    assert_eq!(body["cache"], true);
}

#[tokio::test]
async fn test_not_found_route() {
    let db = TestDatabase::new().await;
    let app = db.app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/non-existent-route")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_enqueue_job_returns_created() {
    let db = TestDatabase::new().await;
    let app = db.app();

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/v1/jobs",
            &fixtures::enqueue_job_request("emails"),
        ))
        .await
        .unwrap();

    assertions::assert_created(response.status());
    let body = body_json(response).await;
    assert!(body["id"].is_string());
    assert_eq!(body["status"], "waiting");
    assert!(body.get("schedule_id").is_none());
}

#[tokio::test]
async fn test_enqueue_job_with_delay_is_delayed() {
    let db = TestDatabase::new().await;
    let app = db.app();

    let mut request = fixtures::enqueue_job_request("emails");
    request["delay_ms"] = serde_json::json!(60_000);

    let response = app
        .oneshot(json_request("POST", "/api/v1/jobs", &request))
        .await
        .unwrap();

    assertions::assert_created(response.status());
    let body = body_json(response).await;
    assert_eq!(body["status"], "delayed");
}

#[tokio::test]
async fn test_enqueue_job_rejects_invalid_job_type() {
    let db = TestDatabase::new().await;
    let app = db.app();

    let mut request = fixtures::enqueue_job_request("emails");
    request["job_type"] = serde_json::json!("-bad/name");

    let response = app
        .oneshot(json_request("POST", "/api/v1/jobs", &request))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_enqueue_job_rejects_missing_payload() {
    let db = TestDatabase::new().await;
    let app = db.app();

    let request = serde_json::json!({ "job_type": "emails" });

    let response = app
        .oneshot(json_request("POST", "/api/v1/jobs", &request))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_enqueue_job_rejects_payload_over_deployment_cap() {
    let db = TestDatabase::new().await;
    let app = db.app_with_payload_cap(2048);

    let mut request = fixtures::enqueue_job_request("emails");
    request["payload"] = serde_json::json!({ "blob": "x".repeat(4096) });

    let response = app
        .oneshot(json_request("POST", "/api/v1/jobs", &request))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(response).await;
    assert_eq!(body["code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn test_enqueue_job_rejects_delay_combined_with_repeat() {
    let db = TestDatabase::new().await;
    let app = db.app();

    let mut request = fixtures::enqueue_job_request("reports");
    request["repeat"] = serde_json::json!("0 0 * * * *");
    request["delay_ms"] = serde_json::json!(60_000);

    let response = app
        .oneshot(json_request("POST", "/api/v1/jobs", &request))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("delay_ms cannot be combined with repeat"));
}

#[tokio::test]
async fn test_enqueue_repeating_job_creates_schedule() {
    let db = TestDatabase::new().await;
    let app = db.app();

    let mut request = fixtures::enqueue_job_request("reports");
    request["repeat"] = serde_json::json!("0 0 * * * *");

    let response = app
        .oneshot(json_request("POST", "/api/v1/jobs", &request))
        .await
        .unwrap();

    assertions::assert_created(response.status());
    let body = body_json(response).await;
    assert_eq!(body["status"], "delayed");
    let schedule_id = body["schedule_id"].as_str().expect("schedule_id missing");

    let schedule: Option<(String, bool)> =
        sqlx::query_as("SELECT job_type, is_active FROM schedules WHERE id = $1")
            .bind(schedule_id)
            .fetch_optional(db.pool())
            .await
            .unwrap();

    let (job_type, is_active) = schedule.expect("Schedule row should exist");
    assert_eq!(job_type, "reports");
    assert!(is_active);
}

#[tokio::test]
async fn test_get_job_roundtrip() {
    let db = TestDatabase::new().await;

    let response = db
        .app()
        .oneshot(json_request(
            "POST",
            "/api/v1/jobs",
            &fixtures::enqueue_job_request("emails"),
        ))
        .await
        .unwrap();
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/jobs/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["job_type"], "emails");
    assert_eq!(body["attempts_made"], 0);
}

#[tokio::test]
async fn test_get_missing_job_is_not_found() {
    let db = TestDatabase::new().await;

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .uri("/api/v1/jobs/no-such-job")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assertions::assert_not_found(response.status());
}

#[tokio::test]
async fn test_delete_waiting_job() {
    let db = TestDatabase::new().await;

    let response = db
        .app()
        .oneshot(json_request(
            "POST",
            "/api/v1/jobs",
            &fixtures::enqueue_job_request("emails"),
        ))
        .await
        .unwrap();
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/jobs/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_delete_active_job_conflicts() {
    let db = TestDatabase::new().await;
    let queue = db.queue();

    let job = queue
        .enqueue(
            "emails",
            serde_json::json!({}),
            fixtures::default_options(),
        )
        .await
        .unwrap();
    let claimed = queue.claim("emails", "worker-1", 30).await.unwrap();
    assert_eq!(claimed.unwrap().id, job.id);

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/jobs/{}", job.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_retry_endpoint_requires_failed_state() {
    let db = TestDatabase::new().await;

    let response = db
        .app()
        .oneshot(json_request(
            "POST",
            "/api/v1/jobs",
            &fixtures::enqueue_job_request("emails"),
        ))
        .await
        .unwrap();
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    // Waiting job cannot be retried
    let response = db
        .app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/jobs/{}/retry", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Force the job terminal, then retry succeeds
    sqlx::query("UPDATE jobs SET status = 'failed', attempts_made = 3 WHERE id = $1")
        .bind(&id)
        .execute(db.pool())
        .await
        .unwrap();

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/jobs/{}/retry", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "waiting");
    assert_eq!(body["attempts_made"], 0);
}

#[tokio::test]
async fn test_job_counts_endpoint() {
    let db = TestDatabase::new().await;

    for _ in 0..3 {
        let response = db
            .app()
            .oneshot(json_request(
                "POST",
                "/api/v1/jobs",
                &fixtures::enqueue_job_request("emails"),
            ))
            .await
            .unwrap();
        assertions::assert_created(response.status());
    }

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .uri("/api/v1/jobs/counts?job_type=emails")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["waiting"], 3);
    assert_eq!(body["active"], 0);
    assert_eq!(body["total"], 3);
}

#[tokio::test]
async fn test_list_jobs_with_status_filter() {
    let db = TestDatabase::new().await;

    let response = db
        .app()
        .oneshot(json_request(
            "POST",
            "/api/v1/jobs",
            &fixtures::enqueue_job_request("emails"),
        ))
        .await
        .unwrap();
    assertions::assert_created(response.status());

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .uri("/api/v1/jobs?status=waiting")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .uri("/api/v1/jobs?status=completed")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let body = body_json(response).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_create_and_pause_schedule() {
    let db = TestDatabase::new().await;

    let response = db
        .app()
        .oneshot(json_request(
            "POST",
            "/api/v1/schedules",
            &fixtures::create_schedule_request("reports"),
        ))
        .await
        .unwrap();

    assertions::assert_created(response.status());
    let body = body_json(response).await;
    let id = body["id"].as_str().unwrap().to_string();
    assert!(body["next_run_at"].is_string());

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/schedules/{}/pause", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["is_active"], false);

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/schedules/{}/resume", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["is_active"], true);
    assert!(body["next_run_at"].is_string());
}

#[tokio::test]
async fn test_create_schedule_rejects_invalid_cron() {
    let db = TestDatabase::new().await;

    let mut request = fixtures::create_schedule_request("reports");
    request["cron_expression"] = serde_json::json!("every day at noon");

    let response = db
        .app()
        .oneshot(json_request("POST", "/api/v1/schedules", &request))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_schedule_keeps_materialised_jobs() {
    let db = TestDatabase::new().await;
    let queue = db.queue();

    let (schedule, job) = queue
        .enqueue_repeating(
            "reports",
            "0 0 * * * *",
            serde_json::json!({}),
            fixtures::default_options(),
        )
        .await
        .unwrap();

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/schedules/{}", schedule.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // The first occurrence survives with its schedule link cleared
    let remaining: (Option<String>,) =
        sqlx::query_as("SELECT schedule_id FROM jobs WHERE id = $1")
            .bind(&job.id)
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert!(remaining.0.is_none());
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_prometheus_format() {
    let db = TestDatabase::new().await;

    let response = db
        .app()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("conveyor_jobs_enqueued_total"));
}
