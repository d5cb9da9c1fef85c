//! Strata Storage Engine
//!
//! The engine is the explicit storage handle shared by every caller:
//! - Write path: MetricRow → TSID (caches → indexDB) → per-day marker → WAL → pending shard → part
//! - Read path: tag filters → indexDB → metric IDs → TSIDs → parts + pending rows → series
//!
//! Every public operation is tracked by a wait-group, so `must_close`
//! drains in-flight work before tearing anything down. Using the engine
//! after `must_close` started panics.

use crate::cache::{CacheStats, MemoryBudget, RecentHourCache, StorageCaches};
use crate::concurrency::WaitGroup;
use crate::encoding::{check_precision_bits, float::round_to_precision};
use crate::index::{IndexConfig, IndexDb, IndexStats, TagEntry, TagFilter, Truncated};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::metric_name::{LabelLimits, MetricName};
use crate::storage::partition::MergeLimits;
use crate::storage::search::{SearchContext, SeriesIter};
use crate::storage::snapshot::SnapshotManager;
use crate::storage::table::{DeletedMetricIds, Table, TableConfig, TableStats};
use crate::storage::tsid::Tsid;
use crate::storage::types::{
    timestamp_to_date, timestamp_to_hour, MetricRow, RawRow, TimeRange, MSECS_PER_DAY,
    MSECS_PER_HOUR,
};
use crate::storage::wal::WalSyncMode;
use chrono::Utc;
use crossbeam::channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use roaring::RoaringTreemap;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Dropped-row warnings are logged at most this often per reason
const DROPPED_ROWS_LOG_INTERVAL: Duration = Duration::from_secs(5);

const LOCK_FILE: &str = "flock.lock";
const RECENT_HOUR_FILE: &str = "recent_hour.bin";

/// Limits applied to searches and label enumeration
#[derive(Debug, Clone)]
pub struct SearchLimits {
    /// Most series a search may match before failing with `TooManyMatches`
    pub max_metrics: usize,
    pub max_tag_keys: usize,
    pub max_tag_values: usize,
    pub max_query_duration: Duration,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            max_metrics: 300_000,
            max_tag_keys: 30_000,
            max_tag_values: 100_000,
            max_query_duration: Duration::from_secs(30),
        }
    }
}

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for all data
    pub data_dir: PathBuf,
    /// Retention in months of 31 days
    pub retention_months: u32,
    /// Rows further in the future are dropped
    pub future_skew_ms: i64,
    pub flush_interval_ms: u64,
    /// Pending row shards; 0 means one per CPU
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
    pub label_limits: LabelLimits,
    /// Share of physical memory the caches may use
    pub memory_allowed_percent: u8,
    pub maintenance_interval_ms: u64,
    /// Snapshots older than this are removed; 0 keeps them
    pub snapshots_max_age_secs: u64,
    pub search: SearchLimits,
    pub index: IndexConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("strata_data"),
            retention_months: 1,
            future_skew_ms: 2 * MSECS_PER_DAY,
            flush_interval_ms: 1000,
            pending_shards: 0,
            max_rows_per_shard: 8192,
            small_merge_concurrency: 0,
            big_merge_concurrency: 0,
            max_small_part_bytes: 0,
            max_big_part_bytes: 1 << 40,
            parts_to_merge: 15,
            max_parts_before_assist: 64,
            dedup_interval_ms: 0,
            wal_enabled: true,
            wal_sync: WalSyncMode::Batched,
            label_limits: LabelLimits::default(),
            memory_allowed_percent: 60,
            maintenance_interval_ms: 10_000,
            snapshots_max_age_secs: 0,
            search: SearchLimits::default(),
            index: IndexConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn retention_ms(&self) -> i64 {
        i64::from(self.retention_months.max(1)) * 31 * MSECS_PER_DAY
    }

    /// Get path to the partitions directory
    pub fn partitions_dir(&self) -> PathBuf {
        self.data_dir.join("data")
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("indexdb")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    fn table_config(&self, budget: &MemoryBudget) -> TableConfig {
        let cpus = num_cpus::get();
        let or_default = |n: usize| if n == 0 { cpus.max(4) } else { n };
        let max_small_part_bytes = if self.max_small_part_bytes == 0 {
            (budget.allowed_bytes / 10 / 15).clamp(1 << 20, 512 << 20)
        } else {
            self.max_small_part_bytes
        };
        TableConfig {
            retention_ms: self.retention_ms(),
            flush_interval: Duration::from_millis(self.flush_interval_ms.max(1)),
            shards: if self.pending_shards == 0 { cpus } else { self.pending_shards },
            max_rows_per_shard: self.max_rows_per_shard.max(1),
            small_merge_concurrency: or_default(self.small_merge_concurrency),
            big_merge_concurrency: or_default(self.big_merge_concurrency),
            limits: MergeLimits {
                max_small_part_bytes,
                max_big_part_bytes: self.max_big_part_bytes,
                parts_to_merge: self.parts_to_merge.max(2),
                max_parts_before_assist: self.max_parts_before_assist.max(2),
            },
            dedup_interval_ms: self.dedup_interval_ms,
            wal_enabled: self.wal_enabled,
            wal_sync_mode: self.wal_sync,
        }
    }
}

/// Outcome of one `add_rows` call. Dropped rows are counted, not errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub rows_added: u64,
    pub too_small_timestamp_rows: u64,
    pub too_big_timestamp_rows: u64,
    /// Malformed names or label limit violations
    pub invalid_rows: u64,
    /// Rows whose series could not be registered
    pub index_failed_rows: u64,
    pub series_created: u64,
}

impl IngestStats {
    pub fn rows_dropped(&self) -> u64 {
        self.too_small_timestamp_rows
            + self.too_big_timestamp_rows
            + self.invalid_rows
            + self.index_failed_rows
    }
}

impl std::ops::AddAssign for IngestStats {
    fn add_assign(&mut self, o: Self) {
        self.rows_added += o.rows_added;
        self.too_small_timestamp_rows += o.too_small_timestamp_rows;
        self.too_big_timestamp_rows += o.too_big_timestamp_rows;
        self.invalid_rows += o.invalid_rows;
        self.index_failed_rows += o.index_failed_rows;
        self.series_created += o.series_created;
    }
}

#[derive(Debug, Default)]
struct IngestCounters {
    rows_added: AtomicU64,
    too_small_timestamp_rows: AtomicU64,
    too_big_timestamp_rows: AtomicU64,
    invalid_rows: AtomicU64,
    index_failed_rows: AtomicU64,
    series_created: AtomicU64,
}

impl IngestCounters {
    fn add(&self, s: &IngestStats) {
        self.rows_added.fetch_add(s.rows_added, Ordering::Relaxed);
        self.too_small_timestamp_rows
            .fetch_add(s.too_small_timestamp_rows, Ordering::Relaxed);
        self.too_big_timestamp_rows
            .fetch_add(s.too_big_timestamp_rows, Ordering::Relaxed);
        self.invalid_rows.fetch_add(s.invalid_rows, Ordering::Relaxed);
        self.index_failed_rows
            .fetch_add(s.index_failed_rows, Ordering::Relaxed);
        self.series_created
            .fetch_add(s.series_created, Ordering::Relaxed);
    }

    fn load(&self) -> IngestStats {
        IngestStats {
            rows_added: self.rows_added.load(Ordering::Relaxed),
            too_small_timestamp_rows: self.too_small_timestamp_rows.load(Ordering::Relaxed),
            too_big_timestamp_rows: self.too_big_timestamp_rows.load(Ordering::Relaxed),
            invalid_rows: self.invalid_rows.load(Ordering::Relaxed),
            index_failed_rows: self.index_failed_rows.load(Ordering::Relaxed),
            series_created: self.series_created.load(Ordering::Relaxed),
        }
    }
}

/// Limits repeated warnings to one per interval and reason
#[derive(Debug, Default)]
struct LogThrottle {
    last: Mutex<HashMap<&'static str, Instant>>,
}

impl LogThrottle {
    fn allow(&self, reason: &'static str) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match last.get(reason) {
            Some(t) if now.duration_since(*t) < DROPPED_ROWS_LOG_INTERVAL => false,
            _ => {
                last.insert(reason, now);
                true
            }
        }
    }
}

/// Exclusive lock on the data directory, held while the engine is open
#[derive(Debug)]
struct DirLock {
    _file: File,
}

impl DirLock {
    fn acquire(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        Self::flock(&file)?;
        Ok(Self { _file: file })
    }

    #[cfg(unix)]
    fn flock(file: &File) -> StorageResult<()> {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is valid for the lifetime of `file`
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(StorageError::Config(format!(
                "the data directory is in use by another process: {}",
                err
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn flock(_file: &File) -> StorageResult<()> {
        Ok(())
    }
}

/// Engine-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub table: TableStats,
    pub index: IndexStats,
    pub caches: Vec<CacheStats>,
    pub cache_sheds: u64,
    pub ingest: IngestStats,
    pub snapshots: usize,
    pub in_flight_operations: usize,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.table)?;
        writeln!(f, "Series:            {}", self.index.series)?;
        writeln!(f, "Deleted series:    {}", self.index.deleted_series)?;
        writeln!(
            f,
            "Rows added:        {} ({} dropped)",
            self.ingest.rows_added,
            self.ingest.rows_dropped()
        )?;
        writeln!(f, "Snapshots:         {}", self.snapshots)?;
        write!(f, "Cache sheds:       {}", self.cache_sheds)?;
        for c in &self.caches {
            write!(f, "\n  {}", c)?;
        }
        Ok(())
    }
}

struct Maintenance {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// The storage engine
pub struct StorageEngine {
    config: StorageConfig,
    table: Table,
    index: Arc<IndexDb>,
    caches: Arc<StorageCaches>,
    snapshots: Arc<SnapshotManager>,
    wg: WaitGroup,
    counters: IngestCounters,
    throttle: LogThrottle,
    maintenance: Mutex<Option<Maintenance>>,
    closed: AtomicBool,
    _lock: DirLock,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("data_dir", &self.config.data_dir)
            .finish()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl StorageEngine {
    /// Open the storage in `config.data_dir`, replaying unflushed rows
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let data_dir = config.data_dir.clone();
        Self::open_inner(config).map_err(|e| StorageError::Open {
            path: data_dir,
            source: Box::new(e),
        })
    }

    fn open_inner(config: StorageConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(config.cache_dir())?;
        let lock = DirLock::acquire(&config.data_dir.join(LOCK_FILE))?;

        let index = Arc::new(IndexDb::open(config.index_dir(), config.index.clone())?);
        let budget = MemoryBudget::detect(config.memory_allowed_percent);
        let now_hour = timestamp_to_hour(now_ms());
        let future_hours = (config.future_skew_ms.max(0) + MSECS_PER_HOUR - 1) / MSECS_PER_HOUR;
        let recent_hour = RecentHourCache::load(
            &config.cache_dir().join(RECENT_HOUR_FILE),
            now_hour,
            future_hours as u64,
        );
        let caches = Arc::new(StorageCaches::new(budget, recent_hour));

        let deleted: DeletedMetricIds = {
            let index = index.clone();
            Arc::new(move || index.deleted())
        };
        let table = Table::open(
            config.partitions_dir(),
            config.wal_dir(),
            config.table_config(&budget),
            deleted,
        )?;
        let snapshots = Arc::new(SnapshotManager::open(config.snapshots_dir())?);

        let engine = Self {
            config,
            table,
            index,
            caches,
            snapshots,
            wg: WaitGroup::new(),
            counters: IngestCounters::default(),
            throttle: LogThrottle::default(),
            maintenance: Mutex::new(None),
            closed: AtomicBool::new(false),
            _lock: lock,
        };
        engine.register_replayed_rows()?;
        engine.start_maintenance()?;

        tracing::info!(
            data_dir = ?engine.config.data_dir,
            retention_months = engine.config.retention_months,
            series = engine.index.series_count(),
            partitions = engine.table.partitions().len(),
            "Storage opened"
        );
        Ok(engine)
    }

    /// Rows recovered from the WAL still need their per-day markers
    fn register_replayed_rows(&self) -> StorageResult<()> {
        let rows = self.table.pending_rows();
        if rows.is_empty() {
            return Ok(());
        }
        let now_hour = timestamp_to_hour(now_ms());
        let mut dates: Vec<(u64, u64)> = Vec::new();
        for r in &rows {
            let hour = timestamp_to_hour(r.timestamp);
            self.caches.recent_hour.add(hour, r.tsid.metric_id, now_hour);
            let date = timestamp_to_date(r.timestamp);
            if !self.index.has_date(date, r.tsid.metric_id) {
                dates.push((date, r.tsid.metric_id));
            }
        }
        dates.sort_unstable();
        dates.dedup();
        self.index.add_dates(&dates)?;
        Ok(())
    }

    fn start_maintenance(&self) -> StorageResult<()> {
        let (stop, stop_rx) = bounded::<()>(0);
        let index = self.index.clone();
        let caches = self.caches.clone();
        let snapshots = self.snapshots.clone();
        let interval = Duration::from_millis(self.config.maintenance_interval_ms.max(10));
        let retention_ms = self.config.retention_ms();
        let max_age = Duration::from_secs(self.config.snapshots_max_age_secs);
        let handle = std::thread::Builder::new()
            .name("strata-maintenance".into())
            .spawn(move || {
                maintenance_loop(stop_rx, interval, index, caches, snapshots, retention_ms, max_age)
            })?;
        *self.maintenance.lock() = Some(Maintenance { stop, handle });
        Ok(())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    // ==================== Ingestion ====================

    /// Add decoded rows. Rows outside the accepted time window, with a
    /// malformed label set, or whose series cannot be registered are
    /// dropped and counted in the returned stats.
    pub fn add_rows(&self, rows: &[MetricRow], precision_bits: u8) -> StorageResult<IngestStats> {
        let _op = self.wg.enter("add_rows");
        check_precision_bits(precision_bits)?;

        let now = now_ms();
        let min_ts = now - self.config.retention_ms();
        let max_ts = now + self.config.future_skew_ms;
        let now_hour = timestamp_to_hour(now);
        let deleted = self.index.deleted();

        let mut stats = IngestStats::default();
        let mut raw = Vec::with_capacity(rows.len());
        let mut new_dates: Vec<(u64, u64)> = Vec::new();
        for row in rows {
            if row.timestamp < min_ts {
                stats.too_small_timestamp_rows += 1;
                continue;
            }
            if row.timestamp > max_ts {
                stats.too_big_timestamp_rows += 1;
                continue;
            }
            let Some(tsid) = self.resolve_tsid(&row.metric_name_raw, &deleted, &mut stats) else {
                continue;
            };
            let metric_id = tsid.metric_id;

            let date = timestamp_to_date(row.timestamp);
            if !self.caches.date_metric_id.has(date, metric_id) {
                if self.index.has_date(date, metric_id) {
                    self.caches.date_metric_id.set(date, metric_id);
                } else {
                    new_dates.push((date, metric_id));
                }
            }
            let hour = timestamp_to_hour(row.timestamp);
            self.caches.recent_hour.add(hour, metric_id, now_hour);
            raw.push(RawRow {
                tsid,
                timestamp: row.timestamp,
                value: round_to_precision(row.value, precision_bits),
                precision_bits,
            });
        }

        // Per-day markers go first so searches never miss buffered rows.
        if !new_dates.is_empty() {
            new_dates.sort_unstable();
            new_dates.dedup();
            self.index.add_dates(&new_dates)?;
            for (date, metric_id) in &new_dates {
                self.caches.date_metric_id.set(*date, *metric_id);
            }
        }
        stats.rows_added = raw.len() as u64;
        self.table.add_rows(raw)?;

        self.counters.add(&stats);
        self.log_dropped(&stats, min_ts, max_ts);
        Ok(stats)
    }

    /// TSID for a raw label set; `None` when the row must be dropped
    fn resolve_tsid(&self, raw: &[u8], deleted: &RoaringTreemap, stats: &mut IngestStats) -> Option<Tsid> {
        if let Some(tsid) = self.caches.tsid.get(&raw.to_vec()) {
            if !deleted.contains(tsid.metric_id) {
                return Some(tsid);
            }
        }
        let mn = match MetricName::from_raw(raw) {
            Ok(mn) => mn,
            Err(e) => {
                stats.invalid_rows += 1;
                if self.throttle.allow("invalid_metric_name") {
                    tracing::warn!(reason = "invalid_metric_name", "dropping row: {}", e);
                }
                return None;
            }
        };
        if let Err(reason) = mn.check_limits(&self.config.label_limits) {
            stats.invalid_rows += 1;
            if self.throttle.allow("label_limits") {
                tracing::warn!(reason = "label_limits", series = %mn, "dropping row: {}", reason);
            }
            return None;
        }
        let key = mn.marshal();
        match self.index.get_or_create_tsid(&mn, &key) {
            Ok((tsid, created)) => {
                if created {
                    stats.series_created += 1;
                }
                self.caches.tsid.put(raw.to_vec(), tsid);
                self.caches.metric_id.put(tsid.metric_id, tsid);
                Some(tsid)
            }
            Err(e) => {
                stats.index_failed_rows += 1;
                if self.throttle.allow("index_failure") {
                    tracing::warn!(reason = "index_failure", series = %mn, "dropping row: {}", e);
                }
                None
            }
        }
    }

    fn log_dropped(&self, stats: &IngestStats, min_ts: i64, max_ts: i64) {
        if stats.too_small_timestamp_rows > 0 && self.throttle.allow("too_small_timestamp") {
            tracing::warn!(
                reason = "too_small_timestamp",
                rows = stats.too_small_timestamp_rows,
                min_timestamp = min_ts,
                "dropping rows older than the retention"
            );
        }
        if stats.too_big_timestamp_rows > 0 && self.throttle.allow("too_big_timestamp") {
            tracing::warn!(
                reason = "too_big_timestamp",
                rows = stats.too_big_timestamp_rows,
                max_timestamp = max_ts,
                "dropping rows too far in the future"
            );
        }
    }

    // ==================== Search ====================

    /// The part of `tr` inside the retention; `None` if nothing is left
    fn effective_range(&self, tr: &TimeRange) -> Option<TimeRange> {
        let min_ts = now_ms() - self.config.retention_ms();
        TimeRange::try_new(tr.min_timestamp.max(min_ts), tr.max_timestamp)
    }

    /// Metric IDs matching `filters` with samples in `tr`
    fn matching_ids(&self, filters: &[TagFilter], tr: &TimeRange) -> StorageResult<Arc<RoaringTreemap>> {
        let ids = self
            .index
            .search_metric_ids(filters, tr, self.config.search.max_metrics)?;
        // inside the last two hours the recent-hour sets are exact
        let now_hour = timestamp_to_hour(now_ms());
        let (min_hour, max_hour) = (
            timestamp_to_hour(tr.min_timestamp),
            timestamp_to_hour(tr.max_timestamp),
        );
        if tr.min_timestamp > 0 && max_hour <= now_hour {
            if let Some(recent) = self
                .caches
                .recent_hour
                .metric_ids_for(min_hour, max_hour, now_hour)
            {
                return Ok(Arc::new(&*ids & &recent));
            }
        }
        Ok(ids)
    }

    /// Series matching `filters` with their samples in `tr`.
    ///
    /// The iterator decodes lazily and stops early once `ctx` is cancelled
    /// or its deadline passes.
    pub fn search(&self, filters: &[TagFilter], tr: &TimeRange, ctx: SearchContext) -> StorageResult<SeriesIter> {
        let _op = self.wg.enter("search");
        ctx.check()?;
        let Some(tr) = self.effective_range(tr) else {
            return Ok(SeriesIter::empty());
        };
        let ids = self.matching_ids(filters, &tr)?;
        let series = self.index.resolve(&ids);
        ctx.check()?;
        let view = self.table.view(&tr, &ids);
        Ok(SeriesIter::new(series, view, tr, self.config.dedup_interval_ms, ctx))
    }

    /// Names of the series matching `filters`, sorted by TSID
    pub fn search_metric_names(&self, filters: &[TagFilter], tr: &TimeRange) -> StorageResult<Vec<MetricName>> {
        let _op = self.wg.enter("search_metric_names");
        let Some(tr) = self.effective_range(tr) else {
            return Ok(Vec::new());
        };
        let ids = self.matching_ids(filters, &tr)?;
        Ok(self
            .index
            .resolve(&ids)
            .into_iter()
            .map(|(_, mn)| (*mn).clone())
            .collect())
    }

    /// Label names of matching series, capped at `limit` and `max_tag_keys`
    pub fn search_label_names(
        &self,
        filters: &[TagFilter],
        tr: &TimeRange,
        limit: usize,
    ) -> StorageResult<Truncated<String>> {
        let _op = self.wg.enter("search_label_names");
        let limit = limit.min(self.config.search.max_tag_keys);
        self.index
            .search_label_names(filters, tr, limit, self.config.search.max_metrics)
    }

    /// Values of one label, capped at `limit` and `max_tag_values`
    pub fn search_label_values(
        &self,
        key: &str,
        filters: &[TagFilter],
        tr: &TimeRange,
        limit: usize,
    ) -> StorageResult<Truncated<String>> {
        let _op = self.wg.enter("search_label_values");
        let limit = limit.min(self.config.search.max_tag_values);
        self.index
            .search_label_values(key, filters, tr, limit, self.config.search.max_metrics)
    }

    /// Label names with their values
    pub fn search_tag_entries(&self, max_keys: usize, max_values: usize) -> Truncated<TagEntry> {
        let _op = self.wg.enter("search_tag_entries");
        self.index.search_tag_entries(
            max_keys.min(self.config.search.max_tag_keys),
            max_values.min(self.config.search.max_tag_values),
        )
    }

    /// Live series, from index metadata
    pub fn series_count(&self) -> u64 {
        let _op = self.wg.enter("series_count");
        self.index.series_count()
    }

    pub fn get_metric_name(&self, metric_id: u64) -> StorageResult<MetricName> {
        let _op = self.wg.enter("get_metric_name");
        self.index
            .get_metric_name(metric_id)
            .map(|mn| (*mn).clone())
            .ok_or_else(|| StorageError::NotFound(format!("metric ID {}", metric_id)))
    }

    /// TSID of a live series
    pub fn get_tsid(&self, metric_id: u64) -> Option<Tsid> {
        let _op = self.wg.enter("get_tsid");
        if let Some(tsid) = self.caches.metric_id.get(&metric_id) {
            return Some(tsid);
        }
        let tsid = self.index.get_tsid(metric_id)?;
        self.caches.metric_id.put(metric_id, tsid);
        Some(tsid)
    }

    // ==================== Deletion ====================

    /// Delete every series matching `filters`; returns how many.
    /// Their samples disappear from searches at once and from disk at
    /// the next merge of their parts.
    pub fn delete_series(&self, filters: &[TagFilter]) -> StorageResult<u64> {
        let _op = self.wg.enter("delete_series");
        if filters.is_empty() {
            return Err(StorageError::InvalidFilter(
                "at least one filter is required to delete series".into(),
            ));
        }
        let ids = self
            .index
            .delete_series(filters, self.config.search.max_metrics)?;
        if !ids.is_empty() {
            self.caches.tsid.reset();
            for id in ids.iter() {
                self.caches.metric_id.remove(&id);
            }
        }
        Ok(ids.len())
    }

    // ==================== Snapshots ====================

    pub fn create_snapshot(&self) -> StorageResult<String> {
        let _op = self.wg.enter("create_snapshot");
        self.index.sync()?;
        self.snapshots.create(&self.table, &self.index)
    }

    pub fn list_snapshots(&self) -> StorageResult<Vec<String>> {
        let _op = self.wg.enter("list_snapshots");
        self.snapshots.list()
    }

    pub fn delete_snapshot(&self, name: &str) -> StorageResult<()> {
        let _op = self.wg.enter("delete_snapshot");
        self.snapshots.delete(name)
    }

    pub fn delete_stale_snapshots(&self, max_age: Duration) -> StorageResult<usize> {
        let _op = self.wg.enter("delete_stale_snapshots");
        self.snapshots.delete_stale(max_age)
    }

    pub fn snapshot_path(&self, name: &str) -> PathBuf {
        self.snapshots.path(name)
    }

    // ==================== Maintenance ====================

    /// Write all pending rows to parts
    pub fn force_flush(&self) -> StorageResult<()> {
        let _op = self.wg.enter("force_flush");
        self.table.flush()?;
        self.index.sync()
    }

    /// Merge the parts of every partition whose name starts with
    /// `partition_prefix` (`""` for all); returns how many were merged
    pub fn force_merge(&self, partition_prefix: &str) -> StorageResult<usize> {
        let _op = self.wg.enter("force_merge");
        let merged = self.table.force_merge(partition_prefix)?;
        tracing::info!(prefix = %partition_prefix, partitions = merged, "Force merge finished");
        Ok(merged)
    }

    /// Drop partitions outside the retention and compact the index
    pub fn enforce_retention(&self) -> StorageResult<usize> {
        let _op = self.wg.enter("enforce_retention");
        let dropped = self.table.enforce_retention();
        let min_date = timestamp_to_date(now_ms() - self.config.retention_ms());
        self.index.compact(min_date)?;
        Ok(dropped)
    }

    pub fn stats(&self) -> StorageStats {
        let _op = self.wg.enter("stats");
        StorageStats {
            table: self.table.stats(),
            index: self.index.stats(),
            caches: self.caches.stats(),
            cache_sheds: self.caches.sheds(),
            ingest: self.counters.load(),
            snapshots: self.snapshots.list().map(|s| s.len()).unwrap_or(0),
            in_flight_operations: self.wg.in_flight().saturating_sub(1),
        }
    }

    /// Wait for in-flight operations, then flush and release everything.
    /// Any later call on this engine panics.
    pub fn must_close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let started = Instant::now();
        self.wg.wait_and_block();
        if let Some(m) = self.maintenance.lock().take() {
            drop(m.stop);
            if m.handle.join().is_err() {
                tracing::error!("The maintenance thread panicked");
            }
        }
        self.table.must_close()?;
        self.index.sync()?;
        let path = self.config.cache_dir().join(RECENT_HOUR_FILE);
        if let Err(e) = self.caches.recent_hour.save(&path) {
            tracing::warn!(path = ?path, "cannot save the recent hour cache: {}", e);
        }
        tracing::info!(
            data_dir = ?self.config.data_dir,
            elapsed = ?started.elapsed(),
            "Storage closed"
        );
        Ok(())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(e) = self.must_close() {
            tracing::error!("Failed to close storage: {}", e);
        }
    }
}

fn maintenance_loop(
    stop: Receiver<()>,
    interval: Duration,
    index: Arc<IndexDb>,
    caches: Arc<StorageCaches>,
    snapshots: Arc<SnapshotManager>,
    retention_ms: i64,
    snapshots_max_age: Duration,
) {
    loop {
        select! {
            recv(stop) -> _ => return,
            default(interval) => {},
        }
        if caches.maintain() {
            index.shed_caches();
        }
        let min_date = timestamp_to_date(now_ms() - retention_ms);
        if let Err(e) = index.maintain(min_date) {
            tracing::error!("Index maintenance failed: {}", e);
        }
        if !snapshots_max_age.is_zero() {
            match snapshots.delete_stale(snapshots_max_age) {
                Ok(0) => {}
                Ok(n) => tracing::info!(snapshots = n, "Removed stale snapshots"),
                Err(e) => tracing::error!("Cannot remove stale snapshots: {}", e),
            }
        }
    }
}
