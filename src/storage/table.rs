//! Table: the monthly partitions plus rows waiting for a flush
//!
//! Accepted rows go to the write-ahead log and then to one of several
//! pending shards. The flusher thread moves pending rows into new parts,
//! each in the partition of the row's calendar month, and background
//! workers merge parts within a partition. Two worker groups exist so
//! that big merges never starve small ones.
//!
//! Searches see every row exactly once: a flush holds the visibility lock
//! while it takes the shards and again while it publishes the new parts,
//! and the rows in between stay readable through the `flushing` buffer.
//!
//! Lock order: `flush_lock` → `wal` → `visibility` → shard.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::merge::{MergeFilter, MergeStats};
use crate::storage::part::PartHandle;
use crate::storage::partition::{
    parse_partition_name, MergeKind, MergeLimits, Partition, PartitionStats,
};
use crate::storage::types::{month_bounds, timestamp_to_month, RawRow, TimeRange, MSECS_PER_DAY};
use crate::storage::wal::{WalSyncMode, WriteAheadLog};
use chrono::Utc;
use crossbeam::channel::{bounded, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringTreemap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Idle wait of a merge worker between polls
const MERGE_IDLE: Duration = Duration::from_secs(1);

/// How often the flusher drops partitions outside the retention
const RETENTION_CHECK: Duration = Duration::from_secs(60);

/// Source of the currently deleted metric IDs, consulted by merges
pub type DeletedMetricIds = Arc<dyn Fn() -> Arc<RoaringTreemap> + Send + Sync>;

type MonthKey = (i32, u32);

/// Table settings, already resolved to concrete values
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub retention_ms: i64,
    pub flush_interval: Duration,
    /// Number of pending row shards
    pub shards: usize,
    /// A shard holding this many rows wakes the flusher
    pub max_rows_per_shard: usize,
    /// Small merge worker threads; 0 disables background small merges
    pub small_merge_concurrency: usize,
    /// Big merge worker threads; 0 disables background big merges
    pub big_merge_concurrency: usize,
    pub limits: MergeLimits,
    /// 0 disables deduplication during merges
    pub dedup_interval_ms: i64,
    pub wal_enabled: bool,
    pub wal_sync_mode: WalSyncMode,
}

impl Default for TableConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            retention_ms: 31 * MSECS_PER_DAY,
            flush_interval: Duration::from_secs(1),
            shards: cpus.max(1),
            max_rows_per_shard: 8192,
            small_merge_concurrency: cpus.max(4),
            big_merge_concurrency: cpus.max(4),
            limits: MergeLimits::default(),
            dedup_interval_ms: 0,
            wal_enabled: true,
            wal_sync_mode: WalSyncMode::Batched,
        }
    }
}

/// Table counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableStats {
    pub partitions: Vec<PartitionStats>,
    pub parts: u64,
    pub rows: u64,
    pub size_bytes: u64,
    pub pending_rows: u64,
    pub flushes: u64,
    pub rows_flushed: u64,
    pub small_merges: u64,
    pub big_merges: u64,
    pub assisted_merges: u64,
    pub forced_merges: u64,
    pub rows_merged: u64,
    pub rows_deleted: u64,
    pub rows_expired: u64,
    pub rows_deduplicated: u64,
    pub partitions_dropped: u64,
}

impl fmt::Display for TableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Partitions:        {}", self.partitions.len())?;
        writeln!(f, "Parts:             {}", self.parts)?;
        writeln!(f, "Rows:              {}", self.rows)?;
        writeln!(f, "Size:              {} bytes", self.size_bytes)?;
        writeln!(f, "Pending rows:      {}", self.pending_rows)?;
        writeln!(f, "Flushes:           {}", self.flushes)?;
        writeln!(
            f,
            "Merges:            {} small, {} big, {} assisted, {} forced",
            self.small_merges, self.big_merges, self.assisted_merges, self.forced_merges
        )?;
        writeln!(f, "Rows merged:       {}", self.rows_merged)?;
        write!(
            f,
            "Rows dropped:      {} deleted, {} expired, {} duplicates",
            self.rows_deleted, self.rows_expired, self.rows_deduplicated
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    pending_rows: AtomicU64,
    flushes: AtomicU64,
    rows_flushed: AtomicU64,
    small_merges: AtomicU64,
    big_merges: AtomicU64,
    assisted_merges: AtomicU64,
    forced_merges: AtomicU64,
    rows_merged: AtomicU64,
    rows_deleted: AtomicU64,
    rows_expired: AtomicU64,
    rows_deduplicated: AtomicU64,
    partitions_dropped: AtomicU64,
}

/// Parts and pending rows visible to one search
#[derive(Debug, Default)]
pub struct TableView {
    pub parts: Vec<Arc<PartHandle>>,
    /// Rows not yet in a part, in arrival order
    pub pending: Vec<RawRow>,
}

struct TableInner {
    dir: PathBuf,
    config: TableConfig,
    partitions: RwLock<BTreeMap<MonthKey, Arc<Partition>>>,
    shards: Vec<Mutex<Vec<RawRow>>>,
    next_shard: AtomicUsize,
    wal: Mutex<Option<WriteAheadLog>>,
    /// Rows taken by the flush in progress
    flushing: Mutex<Arc<Vec<RawRow>>>,
    visibility: RwLock<()>,
    flush_lock: Mutex<()>,
    deleted: DeletedMetricIds,
    /// Cancels running merges at shutdown
    stopping: AtomicBool,
    needs_assist: AtomicBool,
    flush_wake: Sender<()>,
    merge_wake: Sender<()>,
    counters: Counters,
}

/// The set of partitions of one storage
pub struct Table {
    inner: Arc<TableInner>,
    stop: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("dir", &self.inner.dir)
            .field("partitions", &self.inner.partitions.read().len())
            .finish()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl Table {
    /// Open the partitions under `dir` and replay the log in `wal_dir`.
    /// Partitions entirely outside the retention are removed unopened.
    pub fn open(
        dir: impl AsRef<Path>,
        wal_dir: impl AsRef<Path>,
        config: TableConfig,
        deleted: DeletedMetricIds,
    ) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let partitions = load_partitions(&dir, now_ms() - config.retention_ms)?;

        let shards: Vec<Mutex<Vec<RawRow>>> =
            (0..config.shards.max(1)).map(|_| Mutex::new(Vec::new())).collect();
        let mut replayed = 0u64;
        let wal = if config.wal_enabled {
            let (wal, rows) = WriteAheadLog::open(wal_dir.as_ref(), config.wal_sync_mode)?;
            replayed = rows.len() as u64;
            let per_shard = rows.len().div_ceil(shards.len()).max(1);
            for (shard, chunk) in shards.iter().zip(rows.chunks(per_shard)) {
                shard.lock().extend_from_slice(chunk);
            }
            Some(wal)
        } else {
            None
        };
        if replayed > 0 {
            tracing::info!(rows = replayed, "Recovered pending rows from the WAL");
        }

        let (flush_wake, flush_rx) = bounded(1);
        let (merge_wake, merge_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let inner = Arc::new(TableInner {
            dir,
            config,
            partitions: RwLock::new(partitions),
            shards,
            next_shard: AtomicUsize::new(0),
            wal: Mutex::new(wal),
            flushing: Mutex::new(Arc::new(Vec::new())),
            visibility: RwLock::new(()),
            flush_lock: Mutex::new(()),
            deleted,
            stopping: AtomicBool::new(false),
            needs_assist: AtomicBool::new(false),
            flush_wake,
            merge_wake,
            counters: Counters::default(),
        });
        inner.counters.pending_rows.store(replayed, Ordering::Relaxed);
        inner.update_assist_flag();

        let mut workers = Vec::new();
        {
            let inner = inner.clone();
            let stop = stop_rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name("strata-flusher".into())
                    .spawn(move || flush_worker(inner, stop, flush_rx))?,
            );
        }
        let groups = [
            (MergeKind::Small, inner.config.small_merge_concurrency, "small"),
            (MergeKind::Big, inner.config.big_merge_concurrency, "big"),
        ];
        for (kind, count, label) in groups {
            for i in 0..count {
                let inner = inner.clone();
                let stop = stop_rx.clone();
                let wake = merge_rx.clone();
                workers.push(
                    std::thread::Builder::new()
                        .name(format!("strata-{}-merge-{}", label, i))
                        .spawn(move || merge_worker(inner, kind, stop, wake))?,
                );
            }
        }

        Ok(Self {
            inner,
            stop: Mutex::new(Some(stop_tx)),
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        })
    }

    /// Buffer resolved rows until the next flush.
    ///
    /// The caller may be asked to merge parts when a partition has more
    /// parts than background merges keep up with.
    pub fn add_rows(&self, rows: Vec<RawRow>) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let inner = &self.inner;
        let n = rows.len() as u64;
        let full = {
            let mut wal = inner.wal.lock();
            if let Some(wal) = wal.as_mut() {
                wal.append_batch(&rows)?;
            }
            let idx = inner.next_shard.fetch_add(1, Ordering::Relaxed) % inner.shards.len();
            let mut shard = inner.shards[idx].lock();
            shard.extend(rows);
            shard.len() >= inner.config.max_rows_per_shard
        };
        let pending = inner.counters.pending_rows.fetch_add(n, Ordering::Relaxed) + n;
        if full {
            let _ = inner.flush_wake.try_send(());
        }
        // The flusher fell behind; flush inline.
        let hard_limit = (inner.shards.len() * inner.config.max_rows_per_shard * 4) as u64;
        if pending > hard_limit {
            inner.flush()?;
        }
        if inner.needs_assist.load(Ordering::Relaxed) {
            inner.assist_merge();
        }
        Ok(())
    }

    /// Move every pending row into parts
    pub fn flush(&self) -> StorageResult<()> {
        self.inner.flush()
    }

    /// Parts and pending rows overlapping `range`; pending rows are
    /// restricted to `metric_ids`
    pub fn view(&self, range: &TimeRange, metric_ids: &RoaringTreemap) -> TableView {
        let inner = &self.inner;
        let _vis = inner.visibility.read();
        let mut view = TableView::default();
        for p in inner.partitions.read().values() {
            let r = p.range();
            if !range.overlaps(r.min_timestamp, r.max_timestamp) {
                continue;
            }
            view.parts
                .extend(p.parts().iter().filter(|h| h.part.overlaps(range)).cloned());
        }
        let wanted =
            |r: &&RawRow| range.contains(r.timestamp) && metric_ids.contains(r.tsid.metric_id);
        view.pending.extend(inner.flushing.lock().iter().filter(wanted).copied());
        for shard in &inner.shards {
            view.pending.extend(shard.lock().iter().filter(wanted).copied());
        }
        view
    }

    /// Copy of every row not yet in a part
    pub fn pending_rows(&self) -> Vec<RawRow> {
        let inner = &self.inner;
        let _vis = inner.visibility.read();
        let mut rows: Vec<RawRow> = inner.flushing.lock().iter().copied().collect();
        for shard in &inner.shards {
            rows.extend_from_slice(&shard.lock());
        }
        rows
    }

    /// Merge all parts of the partitions whose name starts with `prefix`
    /// into one part each. Returns the number of partitions merged.
    pub fn force_merge(&self, prefix: &str) -> StorageResult<usize> {
        let inner = &self.inner;
        let mut merged = 0;
        for p in inner.partitions() {
            if !p.name().starts_with(prefix) {
                continue;
            }
            if inner.force_merge_partition(&p)? {
                merged += 1;
            }
        }
        Ok(merged)
    }

    /// Drop partitions entirely outside the retention; returns how many
    pub fn enforce_retention(&self) -> usize {
        self.inner.enforce_retention()
    }

    /// Flush, then hard-link every live part under `dst/<partition>`
    pub fn snapshot_to(&self, dst: &Path) -> StorageResult<()> {
        self.inner.flush()?;
        std::fs::create_dir_all(dst)?;
        for p in self.inner.partitions() {
            p.snapshot_to(&dst.join(p.name()))
                .map_err(|e| e.in_partition(p.name()))?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn retention_ms(&self) -> i64 {
        self.inner.config.retention_ms
    }

    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.inner.partitions()
    }

    pub fn pending_rows_count(&self) -> u64 {
        self.inner.counters.pending_rows.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TableStats {
        let c = &self.inner.counters;
        let partitions: Vec<PartitionStats> =
            self.inner.partitions().iter().map(|p| p.stats()).collect();
        TableStats {
            parts: partitions.iter().map(|p| p.parts).sum(),
            rows: partitions.iter().map(|p| p.rows).sum(),
            size_bytes: partitions.iter().map(|p| p.size_bytes).sum(),
            partitions,
            pending_rows: c.pending_rows.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            rows_flushed: c.rows_flushed.load(Ordering::Relaxed),
            small_merges: c.small_merges.load(Ordering::Relaxed),
            big_merges: c.big_merges.load(Ordering::Relaxed),
            assisted_merges: c.assisted_merges.load(Ordering::Relaxed),
            forced_merges: c.forced_merges.load(Ordering::Relaxed),
            rows_merged: c.rows_merged.load(Ordering::Relaxed),
            rows_deleted: c.rows_deleted.load(Ordering::Relaxed),
            rows_expired: c.rows_expired.load(Ordering::Relaxed),
            rows_deduplicated: c.rows_deduplicated.load(Ordering::Relaxed),
            partitions_dropped: c.partitions_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop background workers, flush pending rows and sync the log
    pub fn must_close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = &self.inner;
        inner.stopping.store(true, Ordering::Release);
        // disconnecting the channel stops every worker
        self.stop.lock().take();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("A table worker panicked");
            }
        }
        inner.flush()?;
        if let Some(wal) = inner.wal.lock().as_mut() {
            wal.sync()?;
        }
        tracing::debug!(dir = ?inner.dir, "Table closed");
        Ok(())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if let Err(e) = self.must_close() {
            tracing::error!("Failed to close table: {}", e);
        }
    }
}

impl TableInner {
    fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions.read().values().cloned().collect()
    }

    fn partition_for(&self, key: MonthKey) -> StorageResult<Arc<Partition>> {
        if let Some(p) = self.partitions.read().get(&key) {
            return Ok(p.clone());
        }
        let mut partitions = self.partitions.write();
        if let Some(p) = partitions.get(&key) {
            return Ok(p.clone());
        }
        let p = Arc::new(Partition::create(&self.dir, key.0, key.1)?);
        tracing::info!(partition = %p.name(), "Created partition");
        partitions.insert(key, p.clone());
        Ok(p)
    }

    fn flush(&self) -> StorageResult<()> {
        let _flush = self.flush_lock.lock();
        let (rows, sealed) = {
            let mut wal = self.wal.lock();
            let _vis = self.visibility.write();
            if self.shards.iter().all(|s| s.lock().is_empty()) {
                return Ok(());
            }
            let sealed = match wal.as_mut() {
                Some(wal) => Some(wal.rotate()?),
                None => None,
            };
            let mut rows = Vec::new();
            for shard in &self.shards {
                rows.append(&mut shard.lock());
            }
            let rows = Arc::new(rows);
            *self.flushing.lock() = rows.clone();
            (rows, sealed)
        };

        let mut groups: BTreeMap<MonthKey, Vec<RawRow>> = BTreeMap::new();
        for r in rows.iter() {
            groups.entry(timestamp_to_month(r.timestamp)).or_default().push(*r);
        }
        let mut groups: Vec<(MonthKey, Vec<RawRow>)> = groups.into_iter().collect();

        let mut error = None;
        let mut written = Vec::new();
        for (i, (key, group)) in groups.iter_mut().enumerate() {
            let result = self
                .partition_for(*key)
                .and_then(|p| Ok((p.write_rows(group)?, p)));
            match result {
                Ok((part, p)) => written.push((i, p, part)),
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }

        let vis = self.visibility.write();
        let mut published = vec![false; groups.len()];
        if error.is_none() {
            for (i, p, part) in written {
                if let Some(part) = part {
                    if let Err(e) = p.publish(part) {
                        error = Some(e);
                        break;
                    }
                }
                published[i] = true;
            }
        }
        *self.flushing.lock() = Arc::new(Vec::new());
        if let Some(e) = error {
            // Unpublished rows go back to the buffer
            let mut restored = Vec::new();
            for (i, (_, group)) in groups.into_iter().enumerate() {
                if !published[i] {
                    restored.extend(group);
                }
            }
            self.shards[0].lock().extend_from_slice(&restored);
            drop(vis);
            let restored_len = restored.len() as u64;
            self.counters
                .pending_rows
                .fetch_sub(rows.len() as u64 - restored_len, Ordering::Relaxed);
            // Published rows must not be replayed after a restart, so the
            // sealed segment is swapped for one holding only the rest.
            if restored_len < rows.len() as u64 {
                if let (Some(seq), Some(wal)) = (sealed, self.wal.lock().as_mut()) {
                    if let Err(we) = wal.replace_sealed(seq, &restored) {
                        tracing::error!(rows = restored_len, "Cannot rewrite the WAL after a failed flush: {}", we);
                    }
                }
            }
            return Err(e);
        }
        drop(vis);

        let n = rows.len() as u64;
        self.counters.pending_rows.fetch_sub(n, Ordering::Relaxed);
        self.counters.rows_flushed.fetch_add(n, Ordering::Relaxed);
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        if let Some(seq) = sealed {
            if let Some(wal) = self.wal.lock().as_ref() {
                wal.remove_sealed(seq)?;
            }
        }
        tracing::debug!(rows = n, partitions = groups.len(), "Flushed pending rows");
        self.update_assist_flag();
        let _ = self.merge_wake.try_send(());
        Ok(())
    }

    fn merge_filter(&self) -> MergeFilter {
        MergeFilter {
            deleted_metric_ids: (self.deleted)(),
            min_timestamp: now_ms() - self.config.retention_ms,
            dedup_interval_ms: self.config.dedup_interval_ms,
        }
    }

    fn record_merge(&self, kind: MergeKind, stats: &MergeStats) {
        let c = &self.counters;
        let counter = match kind {
            MergeKind::Small => &c.small_merges,
            MergeKind::Big => &c.big_merges,
            MergeKind::Assisted => &c.assisted_merges,
            MergeKind::Forced => &c.forced_merges,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        c.rows_merged.fetch_add(stats.rows_read, Ordering::Relaxed);
        c.rows_deleted.fetch_add(stats.rows_deleted, Ordering::Relaxed);
        c.rows_expired.fetch_add(stats.rows_expired, Ordering::Relaxed);
        c.rows_deduplicated
            .fetch_add(stats.rows_deduplicated, Ordering::Relaxed);
    }

    fn run_merge(&self, p: &Partition, parts: Vec<Arc<PartHandle>>, kind: MergeKind) -> StorageResult<()> {
        let stats = p.merge(parts, kind, &self.merge_filter(), &self.stopping)?;
        self.record_merge(kind, &stats);
        Ok(())
    }

    /// Run one merge of `kind` in the newest partition that has one;
    /// returns false when there was nothing to do
    fn merge_once(&self, kind: MergeKind) -> bool {
        for p in self.partitions().iter().rev() {
            if self.stopping.load(Ordering::Acquire) {
                return false;
            }
            let Some(parts) = p.pick_merge(kind, &self.config.limits) else {
                continue;
            };
            match self.run_merge(p, parts, kind) {
                Ok(()) => return true,
                Err(StorageError::Cancelled) => return false,
                Err(e) => {
                    tracing::error!(partition = %p.name(), kind = ?kind, "Merge failed: {}", e);
                }
            }
        }
        false
    }

    fn update_assist_flag(&self) {
        let max = self.config.limits.max_parts_before_assist;
        let needed = self
            .partitions
            .read()
            .values()
            .any(|p| p.parts().len() > max);
        self.needs_assist.store(needed, Ordering::Relaxed);
    }

    /// Merge the smallest parts of the most fragmented partition
    fn assist_merge(&self) {
        let max = self.config.limits.max_parts_before_assist;
        let target = self
            .partitions()
            .into_iter()
            .filter(|p| p.parts().len() > max)
            .max_by_key(|p| p.parts().len());
        if let Some(p) = target {
            if let Some(parts) = p.pick_merge(MergeKind::Assisted, &self.config.limits) {
                let n = parts.len();
                match self.run_merge(&p, parts, MergeKind::Assisted) {
                    Ok(()) => tracing::debug!(partition = %p.name(), parts = n, "Assisted merge"),
                    Err(StorageError::Cancelled) => {}
                    Err(e) => tracing::warn!(partition = %p.name(), "Assisted merge failed: {}", e),
                }
            }
        }
        self.update_assist_flag();
    }

    /// Returns true if the partition was merged
    fn force_merge_partition(&self, p: &Partition) -> StorageResult<bool> {
        let mut merged = false;
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return Err(StorageError::Cancelled);
            }
            let parts = p.parts();
            if parts.is_empty() || (merged && parts.len() <= 1) {
                break;
            }
            match p.pick_merge(MergeKind::Forced, &self.config.limits) {
                Some(claimed) => {
                    self.run_merge(p, claimed, MergeKind::Forced)?;
                    merged = true;
                }
                // background merges own the parts; wait for them
                None if parts.iter().any(|h| h.is_in_merge()) => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                None => break,
            }
        }
        Ok(merged)
    }

    fn enforce_retention(&self) -> usize {
        let min_ts = now_ms() - self.config.retention_ms;
        let removed: Vec<Arc<Partition>> = {
            let mut partitions = self.partitions.write();
            let expired: Vec<MonthKey> = partitions
                .iter()
                .filter(|(_, p)| p.range().max_timestamp < min_ts)
                .map(|(k, _)| *k)
                .collect();
            expired
                .iter()
                .filter_map(|k| partitions.remove(k))
                .collect()
        };
        for p in &removed {
            p.mark_for_removal();
            tracing::info!(partition = %p.name(), "Dropped partition outside the retention");
        }
        self.counters
            .partitions_dropped
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed.len()
    }
}

fn load_partitions(dir: &Path, min_ts: i64) -> StorageResult<BTreeMap<MonthKey, Arc<Partition>>> {
    let mut partitions = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let Some((year, month)) = parse_partition_name(&name) else {
            tracing::warn!(dir = ?path, "Skipping unknown directory");
            continue;
        };
        if month_bounds(year, month).max_timestamp < min_ts {
            tracing::info!(partition = %name, "Removing partition outside the retention");
            std::fs::remove_dir_all(&path)?;
            continue;
        }
        partitions.insert((year, month), Arc::new(Partition::open(&path)?));
    }
    tracing::info!(partitions = partitions.len(), dir = ?dir, "Partitions loaded");
    Ok(partitions)
}

fn flush_worker(inner: Arc<TableInner>, stop: Receiver<()>, wake: Receiver<()>) {
    let mut last_retention = Instant::now();
    loop {
        select! {
            recv(stop) -> _ => return,
            recv(wake) -> _ => {},
            default(inner.config.flush_interval) => {},
        }
        if let Err(e) = inner.flush() {
            tracing::error!("Background flush failed: {}", e);
        }
        if last_retention.elapsed() >= RETENTION_CHECK {
            inner.enforce_retention();
            last_retention = Instant::now();
        }
    }
}

fn merge_worker(inner: Arc<TableInner>, kind: MergeKind, stop: Receiver<()>, wake: Receiver<()>) {
    loop {
        select! {
            recv(stop) -> _ => return,
            recv(wake) -> _ => {},
            default(MERGE_IDLE) => {},
        }
        while inner.merge_once(kind) {}
        inner.update_assist_flag();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tsid::Tsid;
    use tempfile::tempdir;

    fn no_deletes() -> DeletedMetricIds {
        Arc::new(|| Arc::new(RoaringTreemap::new()))
    }

    fn quiet_config() -> TableConfig {
        TableConfig {
            retention_ms: 100 * 365 * MSECS_PER_DAY,
            flush_interval: Duration::from_secs(3600),
            shards: 2,
            small_merge_concurrency: 0,
            big_merge_concurrency: 0,
            ..TableConfig::default()
        }
    }

    fn rows(metric_id: u64, start: i64, step: i64, n: i64) -> Vec<RawRow> {
        (0..n)
            .map(|i| RawRow {
                tsid: Tsid {
                    metric_id,
                    ..Tsid::default()
                },
                timestamp: start + i * step,
                value: i as f64,
                precision_bits: 64,
            })
            .collect()
    }

    fn ids(list: &[u64]) -> RoaringTreemap {
        list.iter().copied().collect()
    }

    fn visible_rows(table: &Table, range: &TimeRange, metric_ids: &RoaringTreemap) -> u64 {
        let view = table.view(range, metric_ids);
        let mut n = view.pending.len() as u64;
        for h in &view.parts {
            for i in 0..h.part.blocks.len() {
                if metric_ids.contains(h.part.blocks[i].tsid.metric_id) {
                    n += h.part.read_block(i).unwrap().rows_count() as u64;
                }
            }
        }
        n
    }

    // 2024-05-01T00:00:00Z
    const MAY_2024: i64 = 1_714_521_600_000;

    #[test]
    fn test_rows_visible_before_and_after_flush() {
        let dir = tempdir().unwrap();
        let table = Table::open(dir.path().join("data"), dir.path().join("wal"), quiet_config(), no_deletes()).unwrap();
        table.add_rows(rows(1, MAY_2024, 1000, 50)).unwrap();
        table.add_rows(rows(2, MAY_2024, 1000, 10)).unwrap();

        let all = TimeRange::all();
        assert_eq!(visible_rows(&table, &all, &ids(&[1])), 50);
        assert_eq!(table.pending_rows_count(), 60);

        table.flush().unwrap();
        assert_eq!(table.pending_rows_count(), 0);
        assert_eq!(visible_rows(&table, &all, &ids(&[1])), 50);
        assert_eq!(visible_rows(&table, &all, &ids(&[1, 2])), 60);
        assert_eq!(table.stats().rows, 60);
    }

    #[test]
    fn test_rows_land_in_their_month() {
        let dir = tempdir().unwrap();
        let table = Table::open(dir.path().join("data"), dir.path().join("wal"), quiet_config(), no_deletes()).unwrap();
        // one sample per day across the end of May
        table.add_rows(rows(1, MAY_2024 + 28 * MSECS_PER_DAY, MSECS_PER_DAY, 6)).unwrap();
        table.flush().unwrap();

        let names: Vec<String> = table.partitions().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["2024_05", "2024_06"]);
        let stats = table.stats();
        assert_eq!(stats.partitions[0].rows, 3);
        assert_eq!(stats.partitions[1].rows, 3);
    }

    #[test]
    fn test_wal_replay_after_crash() {
        let dir = tempdir().unwrap();
        let (data, wal) = (dir.path().join("data"), dir.path().join("wal"));
        {
            let table = Table::open(&data, &wal, quiet_config(), no_deletes()).unwrap();
            table.add_rows(rows(1, MAY_2024, 1000, 20)).unwrap();
            table.inner.wal.lock().as_mut().unwrap().sync().unwrap();
            // simulate a crash: nothing is flushed
            std::mem::forget(table);
        }
        let table = Table::open(&data, &wal, quiet_config(), no_deletes()).unwrap();
        assert_eq!(table.pending_rows_count(), 20);
        table.flush().unwrap();
        drop(table);

        // flushed rows are not replayed again
        let table = Table::open(&data, &wal, quiet_config(), no_deletes()).unwrap();
        assert_eq!(table.pending_rows_count(), 0);
        assert_eq!(table.stats().rows, 20);
    }

    #[test]
    fn test_force_merge_drops_deleted_series() {
        let dir = tempdir().unwrap();
        let deleted = Arc::new(ids(&[2]));
        let provider: DeletedMetricIds = {
            let deleted = deleted.clone();
            Arc::new(move || deleted.clone())
        };
        let table = Table::open(dir.path().join("data"), dir.path().join("wal"), quiet_config(), provider).unwrap();
        for id in 1..=3 {
            table.add_rows(rows(id, MAY_2024, 1000, 100)).unwrap();
            table.flush().unwrap();
        }
        assert_eq!(table.stats().parts, 3);

        assert_eq!(table.force_merge("2024").unwrap(), 1);
        assert_eq!(table.force_merge("2023").unwrap(), 0);
        let stats = table.stats();
        assert_eq!(stats.parts, 1);
        assert_eq!(stats.rows, 200);
        assert_eq!(stats.rows_deleted, 100);
        assert_eq!(stats.forced_merges, 1);
    }

    #[test]
    fn test_assisted_merge_limits_part_count() {
        let dir = tempdir().unwrap();
        let mut config = quiet_config();
        config.limits.max_parts_before_assist = 3;
        let table = Table::open(dir.path().join("data"), dir.path().join("wal"), config, no_deletes()).unwrap();
        for i in 0..12 {
            table.add_rows(rows(i, MAY_2024, 1000, 10)).unwrap();
            table.flush().unwrap();
        }
        let stats = table.stats();
        assert!(stats.assisted_merges > 0);
        assert!(stats.parts <= 4, "parts: {}", stats.parts);
        assert_eq!(stats.rows, 120);
    }

    #[test]
    fn test_retention_drops_whole_partitions() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        {
            let table = Table::open(&data, dir.path().join("wal"), quiet_config(), no_deletes()).unwrap();
            table.add_rows(rows(1, MAY_2024, 1000, 10)).unwrap();
            table.add_rows(rows(1, now_ms(), 1000, 10)).unwrap();
            table.flush().unwrap();
            assert_eq!(table.partitions().len(), 2);
        }
        let config = TableConfig {
            retention_ms: 31 * MSECS_PER_DAY,
            ..quiet_config()
        };
        let table = Table::open(&data, dir.path().join("wal"), config, no_deletes()).unwrap();
        assert_eq!(table.partitions().len(), 1);
        assert!(!data.join("2024_05").exists());
        assert_eq!(table.enforce_retention(), 0);
    }

    #[test]
    fn test_background_merges_run() {
        let dir = tempdir().unwrap();
        let mut config = quiet_config();
        config.small_merge_concurrency = 1;
        config.limits.parts_to_merge = 2;
        let table = Table::open(dir.path().join("data"), dir.path().join("wal"), config, no_deletes()).unwrap();
        for i in 0..4 {
            table.add_rows(rows(i, MAY_2024, 1000, 10)).unwrap();
            table.flush().unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while table.stats().small_merges == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(table.stats().small_merges > 0);
        table.must_close().unwrap();
        assert_eq!(table.stats().rows, 40);
    }

    #[test]
    fn test_snapshot_links_parts() {
        let dir = tempdir().unwrap();
        let table = Table::open(dir.path().join("data"), dir.path().join("wal"), quiet_config(), no_deletes()).unwrap();
        table.add_rows(rows(1, MAY_2024, 1000, 10)).unwrap();
        let dst = dir.path().join("snap");
        table.snapshot_to(&dst).unwrap();
        let reopened = Partition::open(&dst.join("2024_05")).unwrap();
        assert_eq!(reopened.stats().rows, 10);
    }
}
