//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes probes.
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health/ready - Readiness probe (ready to serve traffic)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::routes::blocking;
use crate::api::state::AppState;

/// GET /health/live
///
/// Kubernetes liveness probe.
/// Returns 200 if the process is alive, no dependency checks.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// Kubernetes readiness probe.
/// Returns 200 while the storage answers requests.
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    let storage = state.storage.clone();
    match blocking(move || Ok(storage.series_count())).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// GET /health
///
/// Full health status with storage details.
pub async fn full_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let storage = state.storage.clone();
    let stats = blocking(move || Ok(storage.stats())).await;
    let (status, body) = match stats {
        Ok(s) => (
            StatusCode::OK,
            HealthResponse {
                status: "healthy".to_string(),
                storage: "ok".to_string(),
                series: s.index.series,
                partitions: s.table.partitions.len(),
                parts: s.table.parts,
                pending_rows: s.table.pending_rows,
                uptime_seconds: state.uptime_seconds(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        ),
        Err(e) => {
            tracing::warn!("health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                HealthResponse {
                    status: "unhealthy".to_string(),
                    storage: "error".to_string(),
                    series: 0,
                    partitions: 0,
                    parts: 0,
                    pending_rows: 0,
                    uptime_seconds: state.uptime_seconds(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            )
        }
    };
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let status = liveness().await;
        assert_eq!(status, StatusCode::OK);
    }
}
