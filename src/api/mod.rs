//! Strata HTTP API
//!
//! HTTP API layer for Strata, built with Axum.
//!
//! # Endpoints
//!
//! ## Import / Export
//! - `POST /api/v1/import` - JSON lines, one series per line
//! - `POST /api/v1/import/csv` - `selector,timestamp,value` records
//! - `GET /api/v1/export` - Matched series as JSON lines or CSV
//!
//! ## Labels and Series
//! - `GET /api/v1/labels` - Label names
//! - `GET /api/v1/label/:name/values` - Values of one label
//! - `GET /api/v1/series` - Label sets of matching series
//! - `GET /api/v1/series/count` - Number of live series
//! - `GET /api/v1/status/tag_entries` - Label names with their values
//!
//! ## Admin
//! - `POST /api/v1/admin/tsdb/delete_series` - Delete matching series
//! - `GET /snapshot/create|list|delete|delete_all` - Snapshots
//! - `GET /internal/force_flush` - Flush pending rows
//! - `GET /internal/force_merge` - Merge partitions
//! - `GET /internal/stats` - Storage statistics
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,no_run
//! use strata::api::{serve, ApiConfig, AppState};
//! use strata::ingest::{Importer, ImporterConfig};
//! use strata::storage::{StorageConfig, StorageEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Arc::new(StorageEngine::open(StorageConfig::new("./data"))?);
//!     let importer = Arc::new(Importer::new(Arc::clone(&storage), ImporterConfig::default())?);
//!     let config = ApiConfig::default();
//!
//!     let state = AppState::new(storage, importer, config.clone());
//!     serve(state, &config).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{ApiConfig, AppState};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_body_size;

    let api_routes = Router::new()
        // Import routes
        .route("/import", post(routes::import::import_json_lines))
        .route("/import/csv", post(routes::import::import_csv))
        // Export routes
        .route("/export", get(routes::export::export_data))
        // Label and series routes
        .route("/labels", get(routes::labels::label_names))
        .route("/label/:name/values", get(routes::labels::label_values))
        .route("/series", get(routes::labels::series))
        .route("/series/count", get(routes::labels::series_count))
        .route("/status/tag_entries", get(routes::labels::tag_entries))
        // Admin routes
        .route("/admin/tsdb/delete_series", post(routes::admin::delete_series));

    let snapshot_routes = Router::new()
        .route("/create", get(routes::admin::create_snapshot))
        .route("/list", get(routes::admin::list_snapshots))
        .route("/delete", get(routes::admin::delete_snapshot))
        .route("/delete_all", get(routes::admin::delete_all_snapshots));

    let internal_routes = Router::new()
        .route("/force_flush", get(routes::admin::force_flush))
        .route("/force_merge", get(routes::admin::force_merge))
        .route("/stats", get(routes::admin::stats));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    // Create shared state
    let shared_state = Arc::new(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/snapshot", snapshot_routes)
        .nest("/internal", internal_routes)
        .nest("/health", health_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(shared_state)
}

/// Start the API server
pub async fn serve(state: AppState, config: &ApiConfig) -> Result<(), ApiError> {
    let router = build_router(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Strata API listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("Strata API shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
