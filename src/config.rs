//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides, and
//! turns the result into the runtime configs of the storage engine, the
//! importer and the HTTP server.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig as RuntimeApiConfig;
use crate::ingest::ImporterConfig;
use crate::storage::{LabelLimits, SearchLimits, StorageConfig as RuntimeStorageConfig, WalSyncMode};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Retention in months of 31 days
    pub retention_months: u32,
    pub future_skew_ms: i64,
    pub flush_interval_ms: u64,
    /// 0 means one shard per CPU
    pub pending_shards: usize,
    pub max_rows_per_shard: usize,
    /// 0 means `max(4, CPUs)`
    pub small_merge_concurrency: usize,
    /// 0 means `max(4, CPUs)`
    pub big_merge_concurrency: usize,
    /// 0 derives the limit from the memory budget
    pub max_small_part_bytes: u64,
    pub max_big_part_bytes: u64,
    pub parts_to_merge: usize,
    pub max_parts_before_assist: usize,
    /// 0 disables deduplication
    pub dedup_interval_ms: i64,
    pub wal_enabled: bool,
    pub wal_sync: WalSyncMode,
    pub max_labels_per_series: usize,
    pub max_label_name_len: usize,
    pub max_label_value_len: usize,
    pub memory_allowed_percent: u8,
    pub maintenance_interval_ms: u64,
    /// 0 keeps snapshots forever
    pub snapshots_max_age_secs: u64,
    /// Insert workers of the importer; 0 means one per CPU
    pub insert_workers: usize,
    pub import_batch_size: usize,
    /// Mantissa bits kept for imported values
    pub precision_bits: u8,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("strata").to_string_lossy().to_string())
        .unwrap_or_else(|| "./strata_data".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        let engine = RuntimeStorageConfig::default();
        let importer = ImporterConfig::default();
        Self {
            data_dir: default_data_dir(),
            retention_months: engine.retention_months,
            future_skew_ms: engine.future_skew_ms,
            flush_interval_ms: engine.flush_interval_ms,
            pending_shards: engine.pending_shards,
            max_rows_per_shard: engine.max_rows_per_shard,
            small_merge_concurrency: engine.small_merge_concurrency,
            big_merge_concurrency: engine.big_merge_concurrency,
            max_small_part_bytes: engine.max_small_part_bytes,
            max_big_part_bytes: engine.max_big_part_bytes,
            parts_to_merge: engine.parts_to_merge,
            max_parts_before_assist: engine.max_parts_before_assist,
            dedup_interval_ms: engine.dedup_interval_ms,
            wal_enabled: engine.wal_enabled,
            wal_sync: engine.wal_sync,
            max_labels_per_series: engine.label_limits.max_labels_per_series,
            max_label_name_len: engine.label_limits.max_label_name_len,
            max_label_value_len: engine.label_limits.max_label_value_len,
            memory_allowed_percent: engine.memory_allowed_percent,
            maintenance_interval_ms: engine.maintenance_interval_ms,
            snapshots_max_age_secs: engine.snapshots_max_age_secs,
            insert_workers: importer.workers,
            import_batch_size: importer.batch_size,
            precision_bits: importer.precision_bits,
        }
    }
}

/// Search limits and request concurrency
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Most series one search may touch
    pub max_metrics: usize,
    pub max_tag_keys: usize,
    pub max_tag_values: usize,
    pub max_query_duration_ms: u64,
    pub max_concurrent_requests: usize,
    pub max_queue_duration_ms: u64,
    pub max_concurrent_inserts: usize,
    pub insert_queue_duration_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let limits = SearchLimits::default();
        let api = RuntimeApiConfig::default();
        Self {
            max_metrics: limits.max_metrics,
            max_tag_keys: limits.max_tag_keys,
            max_tag_values: limits.max_tag_values,
            max_query_duration_ms: limits.max_query_duration.as_millis() as u64,
            max_concurrent_requests: api.max_concurrent_requests,
            max_queue_duration_ms: api.max_queue_duration_ms,
            max_concurrent_inserts: api.max_concurrent_inserts,
            insert_queue_duration_ms: api.insert_queue_duration_ms,
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    pub enable_export: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let api = RuntimeApiConfig::default();
        Self {
            host: api.host,
            port: api.port,
            max_body_size: api.max_body_size,
            enable_export: api.enable_export,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("strata").join("config.toml")),
            Some(PathBuf::from("/etc/strata/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Storage overrides
        if let Some(data_dir) = var("STRATA_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Some(months) = var("STRATA_RETENTION_MONTHS").and_then(|v| v.parse().ok()) {
            self.storage.retention_months = months;
        }

        // API overrides
        if let Some(host) = var("STRATA_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = var("STRATA_API_PORT").and_then(|v| v.parse().ok()) {
            self.api.port = port;
        }
        if let Some(n) = var("STRATA_MAX_CONCURRENT_REQUESTS").and_then(|v| v.parse().ok()) {
            self.search.max_concurrent_requests = n;
        }

        // Logging overrides
        if let Some(level) = var("STRATA_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("STRATA_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Runtime configuration of the storage engine
    pub fn storage_config(&self) -> RuntimeStorageConfig {
        let s = &self.storage;
        let mut config = RuntimeStorageConfig::new(&s.data_dir);
        config.retention_months = s.retention_months;
        config.future_skew_ms = s.future_skew_ms;
        config.flush_interval_ms = s.flush_interval_ms;
        config.pending_shards = s.pending_shards;
        config.max_rows_per_shard = s.max_rows_per_shard;
        config.small_merge_concurrency = s.small_merge_concurrency;
        config.big_merge_concurrency = s.big_merge_concurrency;
        config.max_small_part_bytes = s.max_small_part_bytes;
        config.max_big_part_bytes = s.max_big_part_bytes;
        config.parts_to_merge = s.parts_to_merge;
        config.max_parts_before_assist = s.max_parts_before_assist;
        config.dedup_interval_ms = s.dedup_interval_ms;
        config.wal_enabled = s.wal_enabled;
        config.wal_sync = s.wal_sync;
        config.label_limits = LabelLimits {
            max_labels_per_series: s.max_labels_per_series,
            max_label_name_len: s.max_label_name_len,
            max_label_value_len: s.max_label_value_len,
        };
        config.memory_allowed_percent = s.memory_allowed_percent;
        config.maintenance_interval_ms = s.maintenance_interval_ms;
        config.snapshots_max_age_secs = s.snapshots_max_age_secs;
        config.search = SearchLimits {
            max_metrics: self.search.max_metrics,
            max_tag_keys: self.search.max_tag_keys,
            max_tag_values: self.search.max_tag_values,
            max_query_duration: Duration::from_millis(self.search.max_query_duration_ms),
        };
        config
    }

    pub fn importer_config(&self) -> ImporterConfig {
        ImporterConfig {
            workers: self.storage.insert_workers,
            batch_size: self.storage.import_batch_size,
            precision_bits: self.storage.precision_bits,
            ..ImporterConfig::default()
        }
    }

    /// Runtime configuration of the HTTP server
    pub fn api_config(&self) -> RuntimeApiConfig {
        RuntimeApiConfig {
            host: self.api.host.clone(),
            port: self.api.port,
            max_body_size: self.api.max_body_size,
            max_concurrent_requests: self.search.max_concurrent_requests,
            max_queue_duration_ms: self.search.max_queue_duration_ms,
            max_concurrent_inserts: self.search.max_concurrent_inserts,
            insert_queue_duration_ms: self.search.insert_queue_duration_ms,
            enable_export: self.api.enable_export,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("strata={},tower_http=info", config.level))
    });
    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing already initialised: {}", e);
    }
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Strata Configuration
#
# Environment variables override these settings:
# - STRATA_DATA_DIR
# - STRATA_RETENTION_MONTHS
# - STRATA_API_HOST
# - STRATA_API_PORT
# - STRATA_MAX_CONCURRENT_REQUESTS
# - STRATA_LOG_LEVEL
# - STRATA_LOG_FORMAT

[storage]
# Directory for parts, the index and snapshots
data_dir = "~/.local/share/strata"

# Rows older than this many 31-day months are dropped
retention_months = 1

# Rows further than this in the future are dropped (ms)
future_skew_ms = 172800000

# How often pending rows become parts (ms)
flush_interval_ms = 1000

# Pending row shards (0 = one per CPU) and rows per shard before a flush
pending_shards = 0
max_rows_per_shard = 8192

# Merge workers (0 = max(4, CPUs))
small_merge_concurrency = 0
big_merge_concurrency = 0

# Part size limits (0 = derived from the memory budget)
max_small_part_bytes = 0
max_big_part_bytes = 1099511627776

# Parts merged at once, and parts per partition before ingestion helps merging
parts_to_merge = 15
max_parts_before_assist = 64

# Keep one sample per interval (0 = off)
dedup_interval_ms = 0

# Write-ahead log for rows not yet in parts
wal_enabled = true
# every_write, batched or none
wal_sync = "batched"

# Rows breaking these limits are dropped
max_labels_per_series = 40
max_label_name_len = 256
max_label_value_len = 4096

# Share of physical memory the caches may use
memory_allowed_percent = 60

# Retention and snapshot housekeeping (ms), snapshot max age (s, 0 = keep)
maintenance_interval_ms = 10000
snapshots_max_age_secs = 0

# Importer
insert_workers = 0
import_batch_size = 10000
precision_bits = 64

[search]
max_metrics = 300000
max_tag_keys = 30000
max_tag_values = 100000
max_query_duration_ms = 30000

# Requests beyond these limits wait, then get 429 Too Many Requests
# (defaults: twice the CPU count)
# max_concurrent_requests = 8
max_queue_duration_ms = 10000
# max_concurrent_inserts = 8
insert_queue_duration_ms = 60000

[api]
host = "0.0.0.0"
port = 8428

# Maximum request body size (bytes)
max_body_size = 67108864

enable_export = true

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_template_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        let defaults = Config::default();
        assert_eq!(config.storage.retention_months, 1);
        assert_eq!(config.storage.wal_sync, WalSyncMode::Batched);
        assert_eq!(config.search.max_metrics, 300_000);
        assert_eq!(config.search.max_concurrent_requests, defaults.search.max_concurrent_requests);
        assert_eq!(config.api.port, 8428);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            data_dir = "/tmp/x"
            dedup_interval_ms = 60000

            [search]
            max_metrics = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.data_dir, "/tmp/x");
        assert_eq!(config.storage.parts_to_merge, 15);

        let runtime = config.storage_config();
        assert_eq!(runtime.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(runtime.dedup_interval_ms, 60_000);
        assert_eq!(runtime.search.max_metrics, 10);
        assert_eq!(runtime.search.max_tag_keys, 30_000);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STRATA_DATA_DIR", "/data"),
            ("STRATA_RETENTION_MONTHS", "12"),
            ("STRATA_API_PORT", "9000"),
            ("STRATA_MAX_CONCURRENT_REQUESTS", "3"),
            ("STRATA_LOG_FORMAT", "json"),
            ("STRATA_API_HOST", "127.0.0.1"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.storage.data_dir, "/data");
        assert_eq!(config.storage_config().retention_months, 12);
        let api = config.api_config();
        assert_eq!(api.addr(), "127.0.0.1:9000");
        assert_eq!(api.max_concurrent_requests, 3);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_bad_env_value_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|k| (k == "STRATA_API_PORT").then(|| "port".to_string()));
        assert_eq!(config.api.port, 8428);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(Config::load(&missing), Err(ConfigError::Io { .. })));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[storage\n").unwrap();
        assert!(matches!(Config::load(&bad), Err(ConfigError::Parse { .. })));
    }
}
