//! Write-Ahead Log (WAL) for rows that are not yet in a part
//!
//! Every accepted batch of raw rows is appended to the active segment
//! before it enters the in-memory buffers. A flush rotates the log first,
//! so the sealed segments hold exactly the rows being flushed; they are
//! deleted once the resulting parts are durable. On open, all remaining
//! segments are replayed in order.
//!
//! Format per entry:
//! - length: u32 (4 bytes)
//! - data: [u8; length] (bincode `Vec<RawRow>`)
//! - crc: u32 (4 bytes, CRC32 of length + data)

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::RawRow;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Largest accepted entry, guards against reading garbage lengths
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// Rows per entry when rows are copied back into the log
const REWRITE_BATCH_ROWS: usize = 64 * 1024;

/// Sync strategy for WAL writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncMode {
    /// Fsync after every write (safest, slowest)
    EveryWrite,
    /// Fsync in batches (balanced)
    #[default]
    Batched,
    /// No fsync, rely on OS (fastest, risk of loss)
    None,
}

/// Segmented write-ahead log
pub struct WriteAheadLog {
    dir: PathBuf,
    writer: BufWriter<File>,
    /// Sequence number of the active segment
    seq: u64,
    entry_count: u64,
    bytes_since_sync: usize,
    sync_mode: WalSyncMode,
    sync_threshold: usize,
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{:016X}.wal", seq))
}

fn list_segments(dir: &Path) -> StorageResult<Vec<u64>> {
    let mut seqs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "wal").unwrap_or(false) {
            if let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| u64::from_str_radix(s, 16).ok())
            {
                seqs.push(seq);
            }
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

/// Write one record: length (4) + data (N) + crc (4)
pub(crate) fn write_frame<W: Write>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = (data.len() as u32).to_le_bytes();
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len);
    hasher.update(data);
    let crc = hasher.finalize();

    writer.write_all(&len)?;
    writer.write_all(data)?;
    writer.write_all(&crc.to_le_bytes())
}

/// Read one record written by [`write_frame`]; `None` at a clean EOF
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> StorageResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_ENTRY_SIZE {
        return Err(StorageError::WalError(format!(
            "Entry length too large: {}",
            len
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    let stored_crc = u32::from_le_bytes(crc_buf);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len_buf);
    hasher.update(&data);
    let computed_crc = hasher.finalize();

    if stored_crc != computed_crc {
        return Err(StorageError::Corruption(format!(
            "CRC mismatch: stored={}, computed={}",
            stored_crc, computed_crc
        )));
    }
    Ok(Some(data))
}

impl WriteAheadLog {
    /// Open the log in `dir`, returning it with the rows to replay
    pub fn open(dir: impl AsRef<Path>, sync_mode: WalSyncMode) -> StorageResult<(Self, Vec<RawRow>)> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let seqs = list_segments(&dir)?;
        let mut rows = Vec::new();
        for &seq in &seqs {
            let path = segment_path(&dir, seq);
            let recovered = Self::recover_segment(&path)?;
            if !recovered.is_empty() {
                tracing::info!(segment = ?path, rows = recovered.len(), "Replaying WAL segment");
            }
            rows.extend(recovered);
        }

        // Replayed segments stay until the rows they hold are flushed.
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
                entry_count: 0,
                bytes_since_sync: 0,
                sync_mode,
                sync_threshold: 64 * 1024, // 64KB default batch
            },
            rows,
        ))
    }

    /// Append one batch of rows
    pub fn append_batch(&mut self, rows: &[RawRow]) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let data = bincode::serialize(rows)?;
        if data.len() > MAX_ENTRY_SIZE {
            return Err(StorageError::WalError(format!(
                "batch of {} bytes exceeds the entry limit",
                data.len()
            )));
        }

        write_frame(&mut self.writer, &data)?;

        self.entry_count += 1;
        self.bytes_since_sync += 8 + data.len();

        self.maybe_sync()
    }

    /// Conditionally sync based on mode and threshold
    fn maybe_sync(&mut self) -> StorageResult<()> {
        match self.sync_mode {
            WalSyncMode::EveryWrite => {
                self.sync()?;
            }
            WalSyncMode::Batched => {
                if self.bytes_since_sync >= self.sync_threshold {
                    self.sync()?;
                }
            }
            WalSyncMode::None => {
                // Just flush the buffer, no fsync
                self.writer.flush()?;
            }
        }
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> StorageResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.bytes_since_sync = 0;
        Ok(())
    }

    /// Seal the active segment and start a new one.
    /// Returns the sequence number of the sealed segment.
    pub fn rotate(&mut self) -> StorageResult<u64> {
        self.sync()?;
        let sealed = self.seq;
        self.seq += 1;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.dir, self.seq))?;
        self.writer = BufWriter::new(file);
        self.entry_count = 0;
        Ok(sealed)
    }

    /// Delete sealed segments up to and including `seq`
    pub fn remove_sealed(&self, seq: u64) -> StorageResult<()> {
        for s in list_segments(&self.dir)? {
            if s <= seq && s != self.seq {
                std::fs::remove_file(segment_path(&self.dir, s))?;
            }
        }
        Ok(())
    }

    /// Replace sealed segments up to `seq` by `rows`, appended to the
    /// active segment before the old segments go away
    pub fn replace_sealed(&mut self, seq: u64, rows: &[RawRow]) -> StorageResult<()> {
        for batch in rows.chunks(REWRITE_BATCH_ROWS) {
            self.append_batch(batch)?;
        }
        self.sync()?;
        self.remove_sealed(seq)
    }

    /// Read all valid entries of one segment; stops at the first torn entry
    fn recover_segment(path: &Path) -> StorageResult<Vec<RawRow>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut rows = Vec::new();
        let mut entries = 0u64;

        loop {
            match Self::read_entry_from(&mut reader) {
                Ok(Some(batch)) => {
                    rows.extend(batch);
                    entries += 1;
                }
                Ok(None) => break, // EOF
                Err(e) => {
                    tracing::warn!("WAL recovery of {:?} stopped at entry {}: {}", path, entries, e);
                    break;
                }
            }
        }

        Ok(rows)
    }

    /// Read a single entry from a reader
    fn read_entry_from<R: Read>(reader: &mut R) -> StorageResult<Option<Vec<RawRow>>> {
        match read_frame(reader)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Entries appended to the active segment
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Total size of all segments on disk
    pub fn size_bytes(&self) -> StorageResult<u64> {
        let mut total = 0;
        for s in list_segments(&self.dir)? {
            total += std::fs::metadata(segment_path(&self.dir, s))?.len();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tsid::Tsid;
    use std::io::{Seek, SeekFrom};
    use tempfile::tempdir;

    fn rows(n: i64) -> Vec<RawRow> {
        (0..n)
            .map(|i| RawRow {
                tsid: Tsid {
                    metric_id: i as u64,
                    ..Tsid::default()
                },
                timestamp: i * 1000,
                value: i as f64,
                precision_bits: 64,
            })
            .collect()
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let (mut wal, replay) = WriteAheadLog::open(dir.path(), WalSyncMode::EveryWrite).unwrap();
            assert!(replay.is_empty());
            wal.append_batch(&rows(3)).unwrap();
            wal.append_batch(&rows(2)).unwrap();
            assert_eq!(wal.entry_count(), 2);
        }
        let (_wal, replay) = WriteAheadLog::open(dir.path(), WalSyncMode::EveryWrite).unwrap();
        assert_eq!(replay.len(), 5);
        assert_eq!(replay[4].timestamp, 1000);
    }

    #[test]
    fn test_rotate_and_remove() {
        let dir = tempdir().unwrap();
        let (mut wal, _) = WriteAheadLog::open(dir.path(), WalSyncMode::Batched).unwrap();
        wal.append_batch(&rows(10)).unwrap();
        let sealed = wal.rotate().unwrap();
        wal.append_batch(&rows(1)).unwrap();
        wal.sync().unwrap();
        wal.remove_sealed(sealed).unwrap();
        drop(wal);

        let (_wal, replay) = WriteAheadLog::open(dir.path(), WalSyncMode::Batched).unwrap();
        assert_eq!(replay.len(), 1);
    }

    #[test]
    fn test_replace_sealed_keeps_only_given_rows() {
        let dir = tempdir().unwrap();
        {
            let (mut wal, _) = WriteAheadLog::open(dir.path(), WalSyncMode::Batched).unwrap();
            let all = rows(10);
            wal.append_batch(&all).unwrap();
            let sealed = wal.rotate().unwrap();
            // rows 0..6 reached parts; the rest must survive a restart once
            wal.replace_sealed(sealed, &all[6..]).unwrap();
            assert_eq!(wal.entry_count(), 1);
        }
        let (_wal, replay) = WriteAheadLog::open(dir.path(), WalSyncMode::Batched).unwrap();
        let ids: Vec<u64> = replay.iter().map(|r| r.tsid.metric_id).collect();
        assert_eq!(ids, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_crc_corruption_stops_replay() {
        let dir = tempdir().unwrap();
        {
            let (mut wal, _) = WriteAheadLog::open(dir.path(), WalSyncMode::EveryWrite).unwrap();
            wal.append_batch(&rows(4)).unwrap();
        }
        {
            use std::io::Write;
            let path = segment_path(dir.path(), 1);
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(10)).unwrap();
            file.write_all(&[0xFF, 0xFF]).unwrap();
        }
        let (_wal, replay) = WriteAheadLog::open(dir.path(), WalSyncMode::EveryWrite).unwrap();
        assert!(replay.is_empty());
    }
}
