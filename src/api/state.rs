//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use crate::concurrency::ConcurrencyLimiter;
use crate::ingest::Importer;
use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Storage engine for reading/writing time-series data
    pub storage: Arc<StorageEngine>,
    /// Fans import bodies out to insert workers
    pub importer: Arc<Importer>,
    /// Bounds concurrent read requests
    pub search_limiter: Arc<ConcurrencyLimiter>,
    /// Bounds concurrent import requests
    pub insert_limiter: Arc<ConcurrencyLimiter>,
    /// API configuration
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(storage: Arc<StorageEngine>, importer: Arc<Importer>, config: ApiConfig) -> Self {
        Self {
            storage,
            importer,
            search_limiter: Arc::new(ConcurrencyLimiter::new(
                "search",
                config.max_concurrent_requests,
                Duration::from_millis(config.max_queue_duration_ms),
            )),
            insert_limiter: Arc::new(ConcurrencyLimiter::new(
                "insert",
                config.max_concurrent_inserts,
                Duration::from_millis(config.insert_queue_duration_ms),
            )),
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    pub max_concurrent_requests: usize,
    /// How long a read request may wait for a slot
    pub max_queue_duration_ms: u64,
    pub max_concurrent_inserts: usize,
    /// How long an import may wait for a slot
    pub insert_queue_duration_ms: u64,
    /// Enable data export endpoint
    pub enable_export: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            host: "0.0.0.0".to_string(),
            port: 8428,
            max_body_size: 64 * 1024 * 1024,
            max_concurrent_requests: cpus * 2,
            max_queue_duration_ms: 10_000,
            max_concurrent_inserts: cpus * 2,
            insert_queue_duration_ms: 60_000,
            enable_export: true,
        }
    }
}

impl ApiConfig {
    /// Create config with custom host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
