//! Observability module for Conveyor
//!
//! This module provides logging, metrics, and the standalone metrics server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TracingSettings;

/// Initialize tracing/logging from settings
pub fn init_tracing(settings: &TracingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("conveyor=debug,tower_http=debug,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(filter);

    if settings.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!(service = %settings.service_name, "Tracing initialized");
}

/// Metrics collection
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Throughput counters
    pub jobs_enqueued_total: IntCounter,
    pub jobs_completed_total: IntCounter,
    pub jobs_failed_total: IntCounter,
    pub jobs_retried_total: IntCounter,
    pub jobs_stalled_total: IntCounter,

    // Queue depth gauges
    pub jobs_waiting: IntGauge,
    pub jobs_delayed: IntGauge,
    pub jobs_active: IntGauge,
    pub oldest_waiting_age_seconds: IntGauge,

    // Handler latency
    pub job_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_enqueued_total =
            IntCounter::new("conveyor_jobs_enqueued_total", "Total jobs enqueued")
                .expect("metric creation failed");
        let jobs_completed_total = IntCounter::new(
            "conveyor_jobs_completed_total",
            "Total jobs completed successfully",
        )
        .expect("metric creation failed");
        let jobs_failed_total = IntCounter::new(
            "conveyor_jobs_failed_total",
            "Total jobs that failed terminally",
        )
        .expect("metric creation failed");
        let jobs_retried_total =
            IntCounter::new("conveyor_jobs_retried_total", "Total job retry attempts")
                .expect("metric creation failed");
        let jobs_stalled_total = IntCounter::new(
            "conveyor_jobs_stalled_total",
            "Total jobs recovered after a lease expired",
        )
        .expect("metric creation failed");

        let jobs_waiting = IntGauge::new("conveyor_jobs_waiting", "Number of waiting jobs")
            .expect("metric creation failed");
        let jobs_delayed = IntGauge::new("conveyor_jobs_delayed", "Number of delayed jobs")
            .expect("metric creation failed");
        let jobs_active = IntGauge::new(
            "conveyor_jobs_active",
            "Number of jobs currently being processed",
        )
        .expect("metric creation failed");
        let oldest_waiting_age_seconds = IntGauge::new(
            "conveyor_oldest_waiting_age_seconds",
            "Age of the oldest waiting job in seconds",
        )
        .expect("metric creation failed");

        let job_duration_opts = HistogramOpts::new(
            "conveyor_job_duration_seconds",
            "Job processing duration in seconds",
        )
        .buckets(vec![
            0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ]);
        let job_duration_seconds =
            Histogram::with_opts(job_duration_opts).expect("metric creation failed");

        registry
            .register(Box::new(jobs_enqueued_total.clone()))
            .unwrap();
        registry
            .register(Box::new(jobs_completed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(jobs_failed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(jobs_retried_total.clone()))
            .unwrap();
        registry
            .register(Box::new(jobs_stalled_total.clone()))
            .unwrap();
        registry.register(Box::new(jobs_waiting.clone())).unwrap();
        registry.register(Box::new(jobs_delayed.clone())).unwrap();
        registry.register(Box::new(jobs_active.clone())).unwrap();
        registry
            .register(Box::new(oldest_waiting_age_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(job_duration_seconds.clone()))
            .unwrap();

        Self {
            registry: Arc::new(registry),
            jobs_enqueued_total,
            jobs_completed_total,
            jobs_failed_total,
            jobs_retried_total,
            jobs_stalled_total,
            jobs_waiting,
            jobs_delayed,
            jobs_active,
            oldest_waiting_age_seconds,
            job_duration_seconds,
        }
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    /// Get all metric families for Prometheus scraping
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;

    // Pad to equal length so the comparison never short-circuits
    let max_len = a.len().max(b.len());
    let a_bytes: Vec<u8> = a
        .bytes()
        .chain(std::iter::repeat(0u8))
        .take(max_len)
        .collect();
    let b_bytes: Vec<u8> = b
        .bytes()
        .chain(std::iter::repeat(0u8))
        .take(max_len)
        .collect();

    let bytes_eq: bool = a_bytes.ct_eq(&b_bytes).into();

    a.len() == b.len() && bytes_eq
}

/// Simple in-memory rate limiter for the metrics endpoint
struct MetricsRateLimiter {
    requests: std::sync::atomic::AtomicU64,
    window_start: std::sync::atomic::AtomicU64,
}

impl MetricsRateLimiter {
    const MAX_REQUESTS_PER_MINUTE: u64 = 60;
    /// Grace period at window boundary to prevent burst bypass
    const WINDOW_GRACE_SECS: u64 = 5;

    fn new() -> Self {
        Self {
            requests: std::sync::atomic::AtomicU64::new(0),
            window_start: std::sync::atomic::AtomicU64::new(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_secs(),
            ),
        }
    }

    /// Window resets use compare_exchange so concurrent callers cannot
    /// both reset and bypass the limit.
    fn check_rate_limit(&self) -> bool {
        use std::sync::atomic::Ordering;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        loop {
            let window_start = self.window_start.load(Ordering::Acquire);

            if now - window_start >= 60 + Self::WINDOW_GRACE_SECS {
                match self.window_start.compare_exchange(
                    window_start,
                    now,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.requests.store(1, Ordering::Release);
                        return true;
                    }
                    Err(_) => {
                        // Another thread reset the window, retry with new window
                        continue;
                    }
                }
            }

            let requests = self.requests.fetch_add(1, Ordering::AcqRel);
            return requests < Self::MAX_REQUESTS_PER_MINUTE;
        }
    }
}

/// Start the standalone metrics server
///
/// The /metrics endpoint requires Bearer token authentication when a
/// token is configured. Token comparison is constant-time.
pub async fn start_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    metrics_token: Option<String>,
) {
    let metrics_clone = metrics.clone();
    let token = metrics_token.clone();
    let rate_limiter = Arc::new(MetricsRateLimiter::new());
    let rate_limiter_clone = rate_limiter.clone();

    let app = Router::new()
        .route(
            "/metrics",
            get(move |headers: axum::http::HeaderMap| {
                let rate_limiter = rate_limiter_clone.clone();
                let metrics = metrics_clone.clone();
                let token = token.clone();
                async move {
                    if !rate_limiter.check_rate_limit() {
                        return (
                            axum::http::StatusCode::TOO_MANY_REQUESTS,
                            "Rate limit exceeded for metrics endpoint".to_string(),
                        );
                    }

                    if let Some(ref expected_token) = token {
                        let auth_header =
                            headers.get("Authorization").and_then(|v| v.to_str().ok());

                        match auth_header {
                            Some(auth) if auth.starts_with("Bearer ") => {
                                let provided_token = &auth[7..];
                                if !constant_time_eq(provided_token, expected_token) {
                                    return (
                                        axum::http::StatusCode::UNAUTHORIZED,
                                        "Invalid metrics token".to_string(),
                                    );
                                }
                            }
                            _ => {
                                return (
                                    axum::http::StatusCode::UNAUTHORIZED,
                                    "Metrics endpoint requires Authorization: Bearer <token>"
                                        .to_string(),
                                );
                            }
                        }
                    }

                    (axum::http::StatusCode::OK, metrics.encode())
                }
            }),
        )
        .route("/health", get(|| async { "OK" }))
        .route("/ready", get(|| async { "READY" }));

    tracing::info!(%addr, token_required = metrics_token.is_some(), "Metrics server starting");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        metrics.jobs_enqueued_total.inc();
        metrics.jobs_waiting.set(10);

        let output = metrics.encode();
        assert!(output.contains("conveyor_jobs_enqueued_total"));
        assert!(output.contains("conveyor_jobs_waiting"));
    }

    #[test]
    fn test_all_counter_metrics() {
        let metrics = Metrics::new();

        metrics.jobs_enqueued_total.inc();
        metrics.jobs_completed_total.inc();
        metrics.jobs_failed_total.inc();
        metrics.jobs_retried_total.inc();
        metrics.jobs_stalled_total.inc();

        let output = metrics.encode();
        assert!(output.contains("conveyor_jobs_enqueued_total"));
        assert!(output.contains("conveyor_jobs_completed_total"));
        assert!(output.contains("conveyor_jobs_failed_total"));
        assert!(output.contains("conveyor_jobs_retried_total"));
        assert!(output.contains("conveyor_jobs_stalled_total"));
    }

    #[test]
    fn test_all_gauge_metrics() {
        let metrics = Metrics::new();

        metrics.jobs_waiting.set(100);
        metrics.jobs_delayed.set(25);
        metrics.jobs_active.set(50);
        metrics.oldest_waiting_age_seconds.set(3600);

        let output = metrics.encode();
        assert!(output.contains("conveyor_jobs_waiting 100"));
        assert!(output.contains("conveyor_jobs_delayed 25"));
        assert!(output.contains("conveyor_jobs_active 50"));
        assert!(output.contains("conveyor_oldest_waiting_age_seconds 3600"));
    }

    #[test]
    fn test_counter_inc_by() {
        let metrics = Metrics::new();

        metrics.jobs_enqueued_total.inc_by(5);
        metrics.jobs_retried_total.inc_by(3);

        let output = metrics.encode();
        assert!(output.contains("conveyor_jobs_enqueued_total 5"));
        assert!(output.contains("conveyor_jobs_retried_total 3"));
    }

    #[test]
    fn test_histogram_buckets() {
        let metrics = Metrics::new();

        metrics.job_duration_seconds.observe(0.001);
        metrics.job_duration_seconds.observe(0.1);
        metrics.job_duration_seconds.observe(1.0);
        metrics.job_duration_seconds.observe(10.0);
        metrics.job_duration_seconds.observe(100.0);

        let output = metrics.encode();
        assert!(output.contains("conveyor_job_duration_seconds_bucket"));
        assert!(output.contains("conveyor_job_duration_seconds_count 5"));
    }

    #[test]
    fn test_metrics_gather() {
        let metrics = Metrics::new();
        metrics.jobs_enqueued_total.inc();

        let families = metrics.gather();
        assert!(!families.is_empty());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret-token", "secret-token"));
        assert!(!constant_time_eq("secret-token", "secret-tokeN"));
        assert!(!constant_time_eq("short", "a-much-longer-token"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_rate_limiter_allows_within_window() {
        let limiter = MetricsRateLimiter::new();
        for _ in 0..MetricsRateLimiter::MAX_REQUESTS_PER_MINUTE {
            assert!(limiter.check_rate_limit());
        }
        assert!(!limiter.check_rate_limit());
    }
}
