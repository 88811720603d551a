//! API module for Conveyor
//!
//! This module contains all HTTP handlers, middleware, and routing.

pub mod handlers;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::cache::RedisCache;
use crate::config::Settings;
use crate::db::Database;
use crate::observability::Metrics;
use crate::queue::QueueManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub cache: Option<Arc<RedisCache>>,
    pub queue: QueueManager,
    pub metrics: Arc<Metrics>,
    pub settings: Settings,
}

impl AppState {
    pub fn new(
        db: Database,
        cache: Option<Arc<RedisCache>>,
        queue: QueueManager,
        metrics: Arc<Metrics>,
        settings: Settings,
    ) -> Self {
        Self {
            db,
            cache,
            queue,
            metrics,
            settings,
        }
    }
}

/// Build the main application router
///
/// CORS is configurable by environment: development allows any origin,
/// production mirrors the request origin and restricts methods/headers.
pub fn router(state: AppState) -> Router {
    use crate::config::Environment;

    let cors = if state.settings.server.environment == Environment::Production {
        tracing::info!("Production mode: Using restrictive CORS policy");
        CorsLayer::new()
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::DELETE,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                axum::http::header::HeaderName::from_static("x-request-id"),
            ])
            .allow_origin(tower_http::cors::AllowOrigin::mirror_request())
    } else {
        tracing::info!("Development mode: Using permissive CORS policy");
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    #[allow(deprecated)] // TimeoutLayer::new is deprecated but with_status_code is not yet stable
    let timeout_layer = TimeoutLayer::new(Duration::from_secs(30));

    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(timeout_layer)
        .layer(cors);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/live", get(handlers::health::liveness))
        .route("/health/ready", get(handlers::health::readiness))
        .route("/metrics", get(handlers::metrics::prometheus_metrics))
        .nest("/api/v1", api_v1_router())
        .layer(middleware)
        .with_state(state)
}

/// API v1 routes
fn api_v1_router() -> Router<AppState> {
    Router::new()
        // Jobs
        .route("/jobs", post(handlers::jobs::create))
        .route("/jobs", get(handlers::jobs::list))
        .route("/jobs/counts", get(handlers::jobs::counts))
        .route("/jobs/{id}", get(handlers::jobs::get))
        .route("/jobs/{id}", delete(handlers::jobs::remove))
        .route("/jobs/{id}/retry", post(handlers::jobs::retry))
        // Schedules (recurring jobs)
        .route("/schedules", get(handlers::schedules::list))
        .route("/schedules", post(handlers::schedules::create))
        .route("/schedules/{id}", get(handlers::schedules::get))
        .route("/schedules/{id}", delete(handlers::schedules::delete))
        .route("/schedules/{id}/pause", post(handlers::schedules::pause))
        .route("/schedules/{id}/resume", post(handlers::schedules::resume))
}
