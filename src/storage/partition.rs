//! Monthly partition of parts
//!
//! A partition is a directory `YYYY_MM` holding immutable part files and
//! `parts.json`, the authoritative list of live parts. The list is
//! replaced atomically (tmp + rename) after every flush and merge; part
//! files it does not name are leftovers of an interrupted merge and are
//! removed at open.
//!
//! The in-memory part list is copy-on-write: readers clone an
//! `Arc<Vec<Arc<PartHandle>>>` and keep using it while merges swap in a
//! new list.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::merge::{merge_parts, write_raw_rows, MergeFilter, MergeStats};
use crate::storage::part::{sync_parent_dir, Part, PartHandle, PartWriter, PART_EXTENSION};
use crate::storage::types::{month_bounds, RawRow, TimeRange};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const PARTS_FILE: &str = "parts.json";

/// Parts whose size ratio is below this are not worth merging
const MIN_MERGE_MULTIPLIER: f64 = 1.7;

/// Limits used when picking parts to merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeLimits {
    /// Upper bound of a small merge's output
    pub max_small_part_bytes: u64,
    /// Upper bound of a big merge's output
    pub max_big_part_bytes: u64,
    /// Most parts merged at once
    pub parts_to_merge: usize,
    /// Part count above which ingestion helps merging
    pub max_parts_before_assist: usize,
}

impl Default for MergeLimits {
    fn default() -> Self {
        Self {
            max_small_part_bytes: 64 * 1024 * 1024,
            max_big_part_bytes: 1 << 40,
            parts_to_merge: 15,
            max_parts_before_assist: 64,
        }
    }
}

/// Which worker pool a merge belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Small,
    Big,
    Assisted,
    Forced,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PartsList {
    parts: Vec<String>,
}

/// Counters of one partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub name: String,
    pub parts: u64,
    pub rows: u64,
    pub size_bytes: u64,
    pub parts_in_merge: u64,
}

type PartList = Arc<Vec<Arc<PartHandle>>>;

pub struct Partition {
    name: String,
    dir: PathBuf,
    range: TimeRange,
    parts: RwLock<PartList>,
    /// Serializes list swaps and `parts.json` writes
    swap_lock: Mutex<()>,
    next_seq: AtomicU64,
    /// Remove the directory when the last reference goes away
    must_remove: AtomicBool,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("name", &self.name)
            .field("parts", &self.parts.read().len())
            .finish()
    }
}

/// Directory name of the partition holding `(year, month)`
pub fn partition_name(year: i32, month: u32) -> String {
    format!("{:04}_{:02}", year, month)
}

/// Parse a `YYYY_MM` directory name
pub fn parse_partition_name(name: &str) -> Option<(i32, u32)> {
    let (y, m) = name.split_once('_')?;
    if y.len() != 4 || m.len() != 2 {
        return None;
    }
    let year = y.parse().ok()?;
    let month = m.parse().ok()?;
    (1..=12).contains(&month).then_some((year, month))
}

fn part_seq(file_name: &str) -> Option<u64> {
    let stem = file_name.strip_suffix(&format!(".{}", PART_EXTENSION))?;
    u64::from_str_radix(stem, 16).ok()
}

impl Partition {
    /// Create an empty partition under `parent`
    pub fn create(parent: &Path, year: i32, month: u32) -> StorageResult<Self> {
        let name = partition_name(year, month);
        let dir = parent.join(&name);
        std::fs::create_dir_all(&dir)?;
        let partition = Self::with_parts(name.clone(), dir, year, month, Vec::new(), 1);
        partition
            .write_parts_list(&[])
            .map_err(|e| e.in_partition(&name))?;
        sync_parent_dir(&partition.dir)?;
        tracing::debug!(partition = %name, "Partition created");
        Ok(partition)
    }

    /// Open the partition in `dir`, dropping files `parts.json` does not list
    pub fn open(dir: &Path) -> StorageResult<Self> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        Self::open_inner(dir, &name).map_err(|e| e.in_partition(name))
    }

    fn open_inner(dir: &Path, name: &str) -> StorageResult<Self> {
        let (year, month) = parse_partition_name(name)
            .ok_or_else(|| StorageError::Corruption(format!("not a partition name: {:?}", name)))?;

        let list_path = dir.join(PARTS_FILE);
        let listed: Option<Vec<String>> = if list_path.exists() {
            let data = std::fs::read(&list_path)?;
            let list: PartsList = serde_json::from_slice(&data)?;
            Some(list.parts)
        } else {
            None
        };

        let mut max_seq = 0u64;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(file) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if file.ends_with(".tmp") {
                std::fs::remove_file(&path)?;
                continue;
            }
            let Some(seq) = part_seq(&file) else { continue };
            max_seq = max_seq.max(seq);
            let keep = listed.as_ref().map(|l| l.contains(&file)).unwrap_or(true);
            if keep {
                names.push(file);
            } else {
                tracing::info!(partition = %name, part = %file, "Removing part left by an interrupted merge");
                std::fs::remove_file(&path)?;
            }
        }
        if let Some(listed) = &listed {
            if let Some(missing) = listed.iter().find(|p| !names.contains(p)) {
                return Err(StorageError::Corruption(format!(
                    "{} lists missing part {}",
                    PARTS_FILE, missing
                )));
            }
        }
        names.sort();

        let mut parts = Vec::with_capacity(names.len());
        for file in &names {
            parts.push(Arc::new(PartHandle::new(Part::open(dir.join(file))?)));
        }
        let partition = Self::with_parts(name.to_string(), dir.to_path_buf(), year, month, parts, max_seq + 1);
        if listed.is_none() {
            partition.write_parts_list(&names)?;
        }
        Ok(partition)
    }

    fn with_parts(
        name: String,
        dir: PathBuf,
        year: i32,
        month: u32,
        parts: Vec<Arc<PartHandle>>,
        next_seq: u64,
    ) -> Self {
        Self {
            name,
            dir,
            range: month_bounds(year, month),
            parts: RwLock::new(Arc::new(parts)),
            swap_lock: Mutex::new(()),
            next_seq: AtomicU64::new(next_seq),
            must_remove: AtomicBool::new(false),
        }
    }

    fn write_parts_list(&self, names: &[String]) -> StorageResult<()> {
        let data = serde_json::to_vec_pretty(&PartsList {
            parts: names.to_vec(),
        })?;
        let path = self.dir.join(PARTS_FILE);
        let tmp = self.dir.join(format!("{}.tmp", PARTS_FILE));
        std::fs::write(&tmp, data)?;
        std::fs::File::open(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        sync_parent_dir(&path)
    }

    fn next_part_path(&self) -> PathBuf {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{:016X}.{}", seq, PART_EXTENSION))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Timestamps this partition may hold
    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Current parts; stays valid across concurrent merges
    pub fn parts(&self) -> PartList {
        self.parts.read().clone()
    }

    /// Replace `removed` with `added` in the live list and persist it
    fn swap(&self, removed: &[Arc<PartHandle>], added: Option<Arc<PartHandle>>) -> StorageResult<()> {
        let _guard = self.swap_lock.lock();
        let current = self.parts();
        let mut next: Vec<Arc<PartHandle>> = current
            .iter()
            .filter(|p| !removed.iter().any(|r| Arc::ptr_eq(p, r)))
            .cloned()
            .collect();
        next.extend(added.clone());
        let names: Vec<String> = next.iter().map(|p| p.part.name()).collect();
        self.write_parts_list(&names)?;
        if let Some(p) = &added {
            p.keep();
        }
        *self.parts.write() = Arc::new(next);
        for p in removed {
            p.mark_for_drop();
        }
        Ok(())
    }

    /// Write `rows` (all inside this partition's month) as a new part.
    /// Returns the number of rows written.
    pub fn add_rows(&self, rows: &mut [RawRow]) -> StorageResult<u64> {
        let written = rows.len() as u64;
        if let Some(part) = self.write_rows(rows)? {
            self.publish(part)?;
        }
        Ok(written)
    }

    /// Write `rows` into a part file without making it visible.
    /// Dropping the returned handle unpublished deletes the file.
    pub fn write_rows(&self, rows: &mut [RawRow]) -> StorageResult<Option<Arc<PartHandle>>> {
        if rows.is_empty() {
            return Ok(None);
        }
        let mut writer = PartWriter::create(self.next_part_path()).map_err(|e| e.in_partition(&self.name))?;
        let written = match write_raw_rows(rows, &mut writer) {
            Ok(n) => n,
            Err(e) => {
                writer.abort();
                return Err(e.in_partition(&self.name));
            }
        };
        let part = match writer.finish().map_err(|e| e.in_partition(&self.name))? {
            Some(path) => {
                let handle = PartHandle::new(Part::open(&path).map_err(|e| e.in_partition(&self.name))?);
                handle.mark_for_drop();
                Some(Arc::new(handle))
            }
            None => None,
        };
        tracing::debug!(partition = %self.name, rows = written, "Flushed rows to a new part");
        Ok(part)
    }

    /// Add a part produced by [`Partition::write_rows`] to the live list
    pub fn publish(&self, part: Arc<PartHandle>) -> StorageResult<()> {
        self.swap(&[], Some(part)).map_err(|e| e.in_partition(&self.name))
    }

    /// Pick and claim parts for a merge of the given kind
    pub fn pick_merge(&self, kind: MergeKind, limits: &MergeLimits) -> Option<Vec<Arc<PartHandle>>> {
        let _guard = self.swap_lock.lock();
        let current = self.parts();
        let free: Vec<Arc<PartHandle>> = current.iter().filter(|p| !p.is_in_merge()).cloned().collect();
        let picked = match kind {
            MergeKind::Small => select_parts(free, limits.parts_to_merge, limits.max_small_part_bytes),
            MergeKind::Big => select_parts(free, limits.parts_to_merge, limits.max_big_part_bytes)
                .filter(|p| total_size(p) > limits.max_small_part_bytes),
            MergeKind::Assisted => {
                // smallest parts first, ignoring the size ratio
                let mut free = free;
                free.sort_by_key(|p| p.part.size_bytes());
                free.truncate(limits.parts_to_merge);
                (free.len() >= 2).then_some(free)
            }
            MergeKind::Forced => (!free.is_empty()).then_some(free),
        }?;
        for (i, p) in picked.iter().enumerate() {
            if !p.try_start_merge() {
                for q in &picked[..i] {
                    q.finish_merge();
                }
                return None;
            }
        }
        Some(picked)
    }

    /// Merge claimed `parts` into one, then swap it in
    pub fn merge(
        &self,
        parts: Vec<Arc<PartHandle>>,
        kind: MergeKind,
        filter: &MergeFilter,
        stop: &AtomicBool,
    ) -> StorageResult<MergeStats> {
        let result = self.merge_claimed(&parts, filter, stop);
        for p in &parts {
            p.finish_merge();
        }
        let stats = result.map_err(|e| match e {
            StorageError::Cancelled => e,
            e => e.in_partition(&self.name),
        })?;
        if matches!(kind, MergeKind::Big | MergeKind::Forced) {
            tracing::info!(partition = %self.name, parts = parts.len(), rows = stats.rows_written, kind = ?kind, "Merged parts");
        } else {
            tracing::debug!(partition = %self.name, parts = parts.len(), rows = stats.rows_written, kind = ?kind, "Merged parts");
        }
        Ok(stats)
    }

    fn merge_claimed(
        &self,
        parts: &[Arc<PartHandle>],
        filter: &MergeFilter,
        stop: &AtomicBool,
    ) -> StorageResult<MergeStats> {
        let mut writer = PartWriter::create(self.next_part_path())?;
        let stats = match merge_parts(parts, &mut writer, filter, stop) {
            Ok(s) => s,
            Err(e) => {
                writer.abort();
                return Err(e);
            }
        };
        let merged = match writer.finish()? {
            Some(path) => Some(Arc::new(PartHandle::new(Part::open(&path)?))),
            None => None,
        };
        self.swap(parts, merged)?;
        Ok(stats)
    }

    /// Hard-link every live part and `parts.json` into `dst`
    pub fn snapshot_to(&self, dst: &Path) -> StorageResult<()> {
        let _guard = self.swap_lock.lock();
        std::fs::create_dir_all(dst)?;
        for p in self.parts().iter() {
            std::fs::hard_link(&p.part.path, dst.join(p.part.name()))?;
        }
        std::fs::copy(self.dir.join(PARTS_FILE), dst.join(PARTS_FILE))?;
        Ok(())
    }

    /// Delete all files once every reader is done
    pub fn mark_for_removal(&self) {
        self.must_remove.store(true, Ordering::Release);
        for p in self.parts().iter() {
            p.mark_for_drop();
        }
    }

    pub fn stats(&self) -> PartitionStats {
        let parts = self.parts();
        PartitionStats {
            name: self.name.clone(),
            parts: parts.len() as u64,
            rows: parts.iter().map(|p| p.part.rows_count()).sum(),
            size_bytes: parts.iter().map(|p| p.part.size_bytes()).sum(),
            parts_in_merge: parts.iter().filter(|p| p.is_in_merge()).count() as u64,
        }
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        if self.must_remove.load(Ordering::Acquire) {
            if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                tracing::warn!(partition = %self.name, "cannot remove partition directory: {}", e);
            }
        }
    }
}

fn total_size(parts: &[Arc<PartHandle>]) -> u64 {
    parts.iter().map(|p| p.part.size_bytes()).sum()
}

/// Choose the run of similar-sized parts whose merge gives the best
/// output/largest-input ratio without exceeding `max_out_bytes`
fn select_parts(mut src: Vec<Arc<PartHandle>>, max_parts: usize, max_out_bytes: u64) -> Option<Vec<Arc<PartHandle>>> {
    let max_in_bytes = (max_out_bytes as f64 / MIN_MERGE_MULTIPLIER) as u64;
    src.retain(|p| p.part.size_bytes() <= max_in_bytes);
    if src.len() < 2 {
        return None;
    }
    src.sort_by_key(|p| p.part.size_bytes());

    let max_src = max_parts.min(src.len());
    let min_src = ((max_src + 1) / 2).max(2);
    let mut best: Option<&[Arc<PartHandle>]> = None;
    let mut best_m = 0f64;
    for n in min_src..=max_src {
        for window in src.windows(n) {
            let first = window[0].part.size_bytes().max(1);
            let last = window[n - 1].part.size_bytes().max(1);
            // too big a difference in size
            if first * (n as u64) < last {
                continue;
            }
            let out = total_size(window);
            if out > max_out_bytes {
                continue;
            }
            let m = out as f64 / last as f64;
            if m < best_m {
                continue;
            }
            best_m = m;
            best = Some(window);
        }
    }
    let min_m = (max_parts as f64 / 2.0).max(MIN_MERGE_MULTIPLIER);
    if best_m < min_m {
        return None;
    }
    best.map(|w| w.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tsid::Tsid;
    use tempfile::tempdir;

    fn rows(metric_id: u64, start: i64, n: i64) -> Vec<RawRow> {
        (0..n)
            .map(|i| RawRow {
                tsid: Tsid {
                    metric_id,
                    ..Tsid::default()
                },
                timestamp: start + i * 1000,
                value: i as f64,
                precision_bits: 64,
            })
            .collect()
    }

    // 2024-05-01T00:00:00Z
    const MAY_2024: i64 = 1_714_521_600_000;

    #[test]
    fn test_partition_names() {
        assert_eq!(partition_name(2024, 5), "2024_05");
        assert_eq!(parse_partition_name("2024_05"), Some((2024, 5)));
        assert_eq!(parse_partition_name("2024_13"), None);
        assert_eq!(parse_partition_name("snapshots"), None);
    }

    #[test]
    fn test_add_rows_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let p = Partition::create(dir.path(), 2024, 5).unwrap();
            assert!(p.range().contains(MAY_2024));
            p.add_rows(&mut rows(1, MAY_2024, 10)).unwrap();
            p.add_rows(&mut rows(2, MAY_2024, 5)).unwrap();
            assert_eq!(p.stats().parts, 2);
            assert_eq!(p.stats().rows, 15);
        }
        let p = Partition::open(&dir.path().join("2024_05")).unwrap();
        assert_eq!(p.stats().parts, 2);
        assert_eq!(p.stats().rows, 15);
    }

    #[test]
    fn test_forced_merge_swaps_parts() {
        let dir = tempdir().unwrap();
        let p = Partition::create(dir.path(), 2024, 5).unwrap();
        for id in 0..4 {
            p.add_rows(&mut rows(id, MAY_2024, 100)).unwrap();
        }
        let old: Vec<PathBuf> = p.parts().iter().map(|h| h.part.path.clone()).collect();

        let picked = p.pick_merge(MergeKind::Forced, &MergeLimits::default()).unwrap();
        assert_eq!(picked.len(), 4);
        // claimed parts are not offered twice
        assert!(p.pick_merge(MergeKind::Forced, &MergeLimits::default()).is_none());
        let stats = p
            .merge(picked, MergeKind::Forced, &MergeFilter::none(), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(stats.rows_written, 400);
        assert_eq!(p.stats().parts, 1);
        assert!(old.iter().all(|path| !path.exists()));
    }

    #[test]
    fn test_readers_keep_merged_parts_alive() {
        let dir = tempdir().unwrap();
        let p = Partition::create(dir.path(), 2024, 5).unwrap();
        p.add_rows(&mut rows(1, MAY_2024, 10)).unwrap();
        p.add_rows(&mut rows(2, MAY_2024, 10)).unwrap();
        let reader = p.parts();
        let picked = p.pick_merge(MergeKind::Forced, &MergeLimits::default()).unwrap();
        p.merge(picked, MergeKind::Forced, &MergeFilter::none(), &AtomicBool::new(false))
            .unwrap();

        assert!(reader.iter().all(|h| h.part.path.exists()));
        assert_eq!(reader[0].part.read_block(0).unwrap().rows_count(), 10);
        let paths: Vec<PathBuf> = reader.iter().map(|h| h.part.path.clone()).collect();
        drop(reader);
        assert!(paths.iter().all(|path| !path.exists()));
    }

    #[test]
    fn test_unlisted_parts_removed_at_open() {
        let dir = tempdir().unwrap();
        {
            let p = Partition::create(dir.path(), 2024, 5).unwrap();
            p.add_rows(&mut rows(1, MAY_2024, 10)).unwrap();
        }
        let pdir = dir.path().join("2024_05");
        std::fs::copy(
            pdir.join("0000000000000001.part"),
            pdir.join("00000000000000FF.part"),
        )
        .unwrap();
        std::fs::write(pdir.join("0000000000000100.part.tmp"), b"partial").unwrap();

        let p = Partition::open(&pdir).unwrap();
        assert_eq!(p.stats().parts, 1);
        assert!(!pdir.join("00000000000000FF.part").exists());
        assert!(!pdir.join("0000000000000100.part.tmp").exists());
    }

    #[test]
    fn test_select_parts_prefers_similar_sizes() {
        let dir = tempdir().unwrap();
        let p = Partition::create(dir.path(), 2024, 5).unwrap();
        for id in 0..10 {
            p.add_rows(&mut rows(id, MAY_2024, 50)).unwrap();
        }
        let limits = MergeLimits {
            parts_to_merge: 10,
            ..MergeLimits::default()
        };
        let picked = p.pick_merge(MergeKind::Small, &limits).unwrap();
        assert_eq!(picked.len(), 10);
        for h in &picked {
            h.finish_merge();
        }

        // two parts are not worth a regular merge, only an assisted one
        let q = Partition::create(dir.path(), 2024, 6).unwrap();
        q.add_rows(&mut rows(1, MAY_2024 + 31 * 86_400_000, 50)).unwrap();
        q.add_rows(&mut rows(2, MAY_2024 + 31 * 86_400_000, 50)).unwrap();
        assert!(q.pick_merge(MergeKind::Small, &limits).is_none());
        assert_eq!(q.pick_merge(MergeKind::Assisted, &limits).unwrap().len(), 2);
    }

    #[test]
    fn test_select_parts_skips_outsized_part() {
        let dir = tempdir().unwrap();
        let p = Partition::create(dir.path(), 2024, 5).unwrap();
        for id in 0..6 {
            p.add_rows(&mut rows(id, MAY_2024, 50)).unwrap();
        }
        let mut big = rows(100, MAY_2024, 20_000);
        for (i, r) in big.iter_mut().enumerate() {
            r.value = ((i * 7919) % 10_007) as f64 / 3.0;
        }
        p.add_rows(&mut big).unwrap();

        let picked = select_parts(p.parts().to_vec(), 10, u64::MAX).unwrap();
        assert_eq!(picked.len(), 6);
        assert!(picked.iter().all(|h| h.part.rows_count() == 50));
    }

    #[test]
    fn test_snapshot_links_parts() {
        let dir = tempdir().unwrap();
        let p = Partition::create(dir.path(), 2024, 5).unwrap();
        p.add_rows(&mut rows(1, MAY_2024, 10)).unwrap();
        let snap = dir.path().join("snap").join("2024_05");
        p.snapshot_to(&snap).unwrap();
        let copy = Partition::open(&snap).unwrap();
        assert_eq!(copy.stats().rows, 10);
    }
}
