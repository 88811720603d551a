//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::api::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: bool,
    pub cache: bool,
}

/// Basic health check endpoint
///
/// Redis is optional; a missing cache does not degrade the service,
/// workers fall back to polling.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_healthy = state.db.health_check().await.unwrap_or(false);
    let cache_healthy = if let Some(ref cache) = state.cache {
        cache.health_check().await.unwrap_or(false)
    } else {
        true
    };

    Json(HealthResponse {
        status: if db_healthy { "healthy" } else { "degraded" }.to_string(),
        database: db_healthy,
        cache: cache_healthy,
    })
}

/// Kubernetes liveness probe
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.db.health_check().await {
        Ok(true) => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}
