//! Point-in-time snapshots
//!
//! A snapshot is a directory `snapshots/<name>/` holding hard links to the
//! live parts under `data/` and a compacted copy of the index under
//! `indexdb/`. Parts are immutable, so linking them never blocks ingestion
//! and the tree can be copied with a plain recursive copy.
//!
//! Names look like `20240501120000-17C3A5B2D4E6F801`: the UTC creation
//! time followed by a unique counter.

use crate::index::IndexDb;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::part::sync_parent_dir;
use crate::storage::table::Table;
use chrono::{NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const NAME_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Creates and removes snapshots under one directory
#[derive(Debug)]
pub struct SnapshotManager {
    dir: PathBuf,
    next_idx: AtomicU64,
}

/// Check that `name` was produced by [`SnapshotManager::create`]
pub fn validate_name(name: &str) -> StorageResult<()> {
    snapshot_time(name)
        .map(|_| ())
        .ok_or_else(|| StorageError::NotFound(format!("invalid snapshot name {:?}", name)))
}

/// Creation time encoded in a snapshot name
fn snapshot_time(name: &str) -> Option<NaiveDateTime> {
    let (time, idx) = name.split_once('-')?;
    if time.len() != 14 || idx.is_empty() || !idx.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(time, NAME_TIME_FORMAT).ok()
}

impl SnapshotManager {
    /// Use `dir`, removing snapshots left half-written by a crash
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                tracing::info!(path = ?path, "Removing incomplete snapshot");
                std::fs::remove_dir_all(&path)?;
            }
        }
        let seed = Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
        Ok(Self {
            dir,
            next_idx: AtomicU64::new(seed),
        })
    }

    fn new_name(&self) -> String {
        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:08X}", Utc::now().format(NAME_TIME_FORMAT), idx)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Snapshot `table` and `index`; returns the new snapshot's name
    pub fn create(&self, table: &Table, index: &IndexDb) -> StorageResult<String> {
        let name = self.new_name();
        let tmp = self.dir.join(format!("{}.tmp", name));
        let result = table
            .snapshot_to(&tmp.join("data"))
            .and_then(|_| index.snapshot_to(&tmp.join("indexdb")));
        if let Err(e) = result {
            if let Err(cleanup) = std::fs::remove_dir_all(&tmp) {
                tracing::warn!(path = ?tmp, "cannot remove incomplete snapshot: {}", cleanup);
            }
            return Err(e);
        }
        let dst = self.path(&name);
        std::fs::rename(&tmp, &dst)?;
        sync_parent_dir(&dst)?;
        tracing::info!(snapshot = %name, "Snapshot created");
        Ok(name)
    }

    /// Names of all snapshots, oldest first
    pub fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if snapshot_time(name).is_some() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn delete(&self, name: &str) -> StorageResult<()> {
        validate_name(name)?;
        let path = self.path(name);
        if !path.exists() {
            return Err(StorageError::NotFound(format!("snapshot {}", name)));
        }
        std::fs::remove_dir_all(&path)?;
        tracing::info!(snapshot = %name, "Snapshot deleted");
        Ok(())
    }

    /// Delete snapshots older than `max_age`; returns how many
    pub fn delete_stale(&self, max_age: Duration) -> StorageResult<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| StorageError::Config(format!("snapshot max age: {}", e)))?;
        let deadline = Utc::now().naive_utc() - max_age;
        let mut deleted = 0;
        for name in self.list()? {
            if snapshot_time(&name).map(|t| t < deadline).unwrap_or(false) {
                self.delete(&name)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexConfig;
    use crate::storage::metric_name::MetricName;
    use crate::storage::table::{DeletedMetricIds, TableConfig};
    use crate::storage::types::RawRow;
    use roaring::RoaringTreemap;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_names() {
        assert!(validate_name("20240501120000-0000000A").is_ok());
        assert!(validate_name("20241301120000-0A").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("20240501120000-xyz").is_err());
    }

    #[test]
    fn test_create_list_delete() {
        let dir = tempdir().unwrap();
        let deleted: DeletedMetricIds = Arc::new(|| Arc::new(RoaringTreemap::new()));
        let config = TableConfig {
            retention_ms: i64::MAX / 2,
            small_merge_concurrency: 0,
            big_merge_concurrency: 0,
            ..TableConfig::default()
        };
        let table = Table::open(dir.path().join("data"), dir.path().join("wal"), config, deleted).unwrap();
        let index = IndexDb::open(dir.path().join("indexdb"), IndexConfig::default()).unwrap();
        let mn = MetricName::new("cpu", vec![]);
        let (tsid, _) = index.get_or_create_tsid(&mn, &mn.marshal()).unwrap();
        table
            .add_rows(vec![RawRow {
                tsid,
                timestamp: 1_714_521_600_000,
                value: 1.0,
                precision_bits: 64,
            }])
            .unwrap();

        let snapshots = SnapshotManager::open(dir.path().join("snapshots")).unwrap();
        let first = snapshots.create(&table, &index).unwrap();
        let second = snapshots.create(&table, &index).unwrap();
        assert_ne!(first, second);
        assert_eq!(snapshots.list().unwrap(), vec![first.clone(), second.clone()]);

        let root = snapshots.path(&first);
        assert!(root.join("data/2024_05/parts.json").exists());
        let reopened = IndexDb::open(root.join("indexdb"), IndexConfig::default()).unwrap();
        assert_eq!(reopened.lookup_tsid(&mn.marshal()), Some(tsid));

        snapshots.delete(&first).unwrap();
        assert!(matches!(snapshots.delete(&first), Err(StorageError::NotFound(_))));
        assert_eq!(snapshots.list().unwrap(), vec![second]);
        assert_eq!(snapshots.delete_stale(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(snapshots.delete_stale(Duration::ZERO).unwrap(), 1);
    }
}
