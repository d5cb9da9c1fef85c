//! Durable, append-only log of index items
//!
//! Layout inside the index directory:
//!
//! ```text
//! indexdb/
//!   items.merged                 compacted snapshot of all live items
//!   items_0000000000000003.log   sealed segment
//!   items_0000000000000004.log   active segment
//! ```
//!
//! Records use the WAL framing (length + bincode + CRC32). Compaction
//! seals the active segment, writes a fresh snapshot next to the old one,
//! swaps it in with a rename and then deletes the sealed segments.

use crate::index::items::IndexItem;
use crate::storage::error::StorageResult;
use crate::storage::part::sync_parent_dir;
use crate::storage::wal::{read_frame, write_frame, WalSyncMode};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const MERGED_FILE: &str = "items.merged";

/// Items per record in the compacted snapshot
const SNAPSHOT_CHUNK: usize = 4096;

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("items_{:016X}.log", seq))
}

fn list_segments(dir: &Path) -> StorageResult<Vec<u64>> {
    let mut seqs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(seq) = name
            .strip_prefix("items_")
            .and_then(|s| s.strip_suffix(".log"))
            .and_then(|s| u64::from_str_radix(s, 16).ok())
        {
            seqs.push(seq);
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

/// Segmented item log
pub struct ItemLog {
    dir: PathBuf,
    writer: BufWriter<File>,
    seq: u64,
    active_bytes: u64,
    sync_mode: WalSyncMode,
}

impl ItemLog {
    /// Open the log and return every item recorded so far, in order
    pub fn open(dir: impl AsRef<Path>, sync_mode: WalSyncMode) -> StorageResult<(Self, Vec<IndexItem>)> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        // Leftover of an interrupted compaction
        let _ = std::fs::remove_file(dir.join(format!("{}.tmp", MERGED_FILE)));

        let mut items = Vec::new();
        let merged = dir.join(MERGED_FILE);
        if merged.exists() {
            read_file(&merged, &mut items)?;
        }
        let seqs = list_segments(&dir)?;
        for &seq in &seqs {
            read_file(&segment_path(&dir, seq), &mut items)?;
        }

        let seq = seqs.last().map(|s| s + 1).unwrap_or(1);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&dir, seq))?;
        Ok((
            Self {
                dir,
                writer: BufWriter::new(file),
                seq,
                active_bytes: 0,
                sync_mode,
            },
            items,
        ))
    }

    /// Append items as one record; they are replayed together or not at all
    pub fn append(&mut self, items: &[IndexItem]) -> StorageResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let data = bincode::serialize(items)?;
        write_frame(&mut self.writer, &data)?;
        self.active_bytes += 8 + data.len() as u64;
        match self.sync_mode {
            WalSyncMode::EveryWrite => self.sync()?,
            WalSyncMode::Batched | WalSyncMode::None => self.writer.flush()?,
        }
        Ok(())
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.writer.flush()?;
        if self.sync_mode != WalSyncMode::None {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Bytes appended to the active segment
    pub fn active_bytes(&self) -> u64 {
        self.active_bytes
    }

    /// Seal the active segment; returns its sequence number
    pub fn rotate(&mut self) -> StorageResult<u64> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        let sealed = self.seq;
        self.seq += 1;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.dir, self.seq))?;
        self.writer = BufWriter::new(file);
        self.active_bytes = 0;
        Ok(sealed)
    }

    /// Number of sealed segments waiting for compaction
    pub fn sealed_segments(&self) -> StorageResult<usize> {
        Ok(list_segments(&self.dir)?
            .into_iter()
            .filter(|&s| s != self.seq)
            .count())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Replace the snapshot with `items` and drop segments up to `sealed`.
///
/// Takes no lock on the log: it only touches files the active writer no
/// longer uses.
pub fn write_snapshot(dir: &Path, items: &[IndexItem], sealed: u64) -> StorageResult<()> {
    let merged = dir.join(MERGED_FILE);
    let tmp = dir.join(format!("{}.tmp", MERGED_FILE));
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for chunk in items.chunks(SNAPSHOT_CHUNK) {
            let data = bincode::serialize(chunk)?;
            write_frame(&mut writer, &data)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, &merged)?;
    sync_parent_dir(&merged)?;

    for seq in list_segments(dir)? {
        if seq <= sealed {
            std::fs::remove_file(segment_path(dir, seq))?;
        }
    }
    Ok(())
}

/// Read all valid records; a torn tail ends the file
fn read_file(path: &Path, items: &mut Vec<IndexItem>) -> StorageResult<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = 0u64;
    loop {
        match read_frame(&mut reader) {
            Ok(Some(data)) => {
                let batch: Vec<IndexItem> = bincode::deserialize(&data)?;
                items.extend(batch);
                records += 1;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(
                    "index log {:?} is truncated after {} records: {}",
                    path,
                    records,
                    e
                );
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(d: u64) -> IndexItem {
        IndexItem::Date {
            date: d,
            metric_id: d * 10,
        }
    }

    #[test]
    fn test_items_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let (mut log, items) = ItemLog::open(dir.path(), WalSyncMode::EveryWrite).unwrap();
            assert!(items.is_empty());
            log.append(&[date(1), date(2)]).unwrap();
            log.append(&[date(3)]).unwrap();
        }
        let (_log, items) = ItemLog::open(dir.path(), WalSyncMode::EveryWrite).unwrap();
        assert_eq!(items, vec![date(1), date(2), date(3)]);
    }

    #[test]
    fn test_snapshot_replaces_sealed_segments() {
        let dir = tempdir().unwrap();
        {
            let (mut log, _) = ItemLog::open(dir.path(), WalSyncMode::Batched).unwrap();
            log.append(&[date(1), date(2)]).unwrap();
            let sealed = log.rotate().unwrap();
            log.append(&[date(3)]).unwrap();
            assert_eq!(log.sealed_segments().unwrap(), 1);
            // compaction dropped item 1
            write_snapshot(log.dir(), &[date(2)], sealed).unwrap();
            assert_eq!(log.sealed_segments().unwrap(), 0);
            log.sync().unwrap();
        }
        let (_log, items) = ItemLog::open(dir.path(), WalSyncMode::Batched).unwrap();
        assert_eq!(items, vec![date(2), date(3)]);
    }
}
