//! Part file format
//!
//! A part is an immutable file of blocks sorted by (TSID, min timestamp).
//! It is written once by a flush or a merge, then only read.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (64 bytes)                       │
//! │   magic: [u8; 4] = "STRP"               │
//! │   version: u16                          │
//! │   block_count: u32                      │
//! │   rows_count: u64                       │
//! │   min_timestamp: i64                    │
//! │   max_timestamp: i64                    │
//! │   reserved: [u8; 26]                    │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ BLOCK PAYLOADS (variable)               │
//! │   timestamps column + values column     │
//! ├─────────────────────────────────────────┤
//! │ FOOTER                                  │
//! │   block_headers: [BlockHeader; N]       │
//! │   footer_size: u32                      │
//! │   footer_checksum: u32                  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Files are written as `<name>.tmp`, synced and renamed, so a part file
//! that exists under its final name is always complete.

use crate::storage::block::{Block, BlockHeader, BLOCK_HEADER_SIZE, MAX_ROWS_PER_BLOCK};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tsid::Tsid;
use crate::storage::types::TimeRange;
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Magic bytes for part file identification
const PART_MAGIC: [u8; 4] = *b"STRP";

/// Current part format version
const PART_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 64;

/// File extension of part files
pub const PART_EXTENSION: &str = "part";

/// Part file header
#[derive(Debug, Clone, PartialEq)]
pub struct PartHeader {
    pub version: u16,
    pub block_count: u32,
    pub rows_count: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl PartHeader {
    fn new() -> Self {
        Self {
            version: PART_VERSION,
            block_count: 0,
            rows_count: 0,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&PART_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..10].copy_from_slice(&self.block_count.to_le_bytes());
        buf[10..18].copy_from_slice(&self.rows_count.to_le_bytes());
        buf[18..26].copy_from_slice(&self.min_timestamp.to_le_bytes());
        buf[26..34].copy_from_slice(&self.max_timestamp.to_le_bytes());
        // bytes 34-59 reserved

        let checksum = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StorageError::InvalidPart(format!(
                "file of {} bytes is too small for a header",
                buf.len()
            )));
        }
        let stored_checksum = u32::from_le_bytes([buf[60], buf[61], buf[62], buf[63]]);
        let computed_checksum = crc32fast::hash(&buf[0..60]);
        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "Header checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }
        if buf[0..4] != PART_MAGIC {
            return Err(StorageError::InvalidPart(format!(
                "Invalid magic: {:?}",
                &buf[0..4]
            )));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > PART_VERSION {
            return Err(StorageError::InvalidPart(format!(
                "Unsupported version: {}",
                version
            )));
        }
        let mut b8 = [0u8; 8];
        let mut u64_at = |i: usize| {
            b8.copy_from_slice(&buf[i..i + 8]);
            u64::from_le_bytes(b8)
        };
        let rows_count = u64_at(10);
        let min_timestamp = u64_at(18) as i64;
        let max_timestamp = u64_at(26) as i64;
        Ok(Self {
            version,
            block_count: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            rows_count,
            min_timestamp,
            max_timestamp,
        })
    }
}

/// Streams sorted blocks into a new part file
pub struct PartWriter {
    final_path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    header: PartHeader,
    blocks: Vec<BlockHeader>,
    offset: u64,
    last_key: Option<(Tsid, i64)>,
}

impl PartWriter {
    /// Start writing the part that will live at `path`
    pub fn create(path: impl AsRef<Path>) -> StorageResult<Self> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("part.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        let header = PartHeader::new();
        writer.write_all(&header.to_bytes())?;
        Ok(Self {
            final_path,
            tmp_path,
            writer,
            header,
            blocks: Vec::new(),
            offset: HEADER_SIZE as u64,
            last_key: None,
        })
    }

    /// Append a block. Blocks must arrive in (TSID, timestamp) order;
    /// blocks larger than the row limit are split.
    pub fn write_block(&mut self, block: &Block) -> StorageResult<()> {
        if block.is_empty() {
            return Ok(());
        }
        if block.rows_count() <= MAX_ROWS_PER_BLOCK {
            return self.write_chunk(block);
        }
        for start in (0..block.rows_count()).step_by(MAX_ROWS_PER_BLOCK) {
            let end = (start + MAX_ROWS_PER_BLOCK).min(block.rows_count());
            let chunk = Block {
                tsid: block.tsid,
                timestamps: block.timestamps[start..end].to_vec(),
                values: block.values[start..end].to_vec(),
                precision_bits: block.precision_bits,
            };
            self.write_chunk(&chunk)?;
        }
        Ok(())
    }

    fn write_chunk(&mut self, block: &Block) -> StorageResult<()> {
        let key = (block.tsid, block.timestamps[0]);
        if let Some(last) = self.last_key {
            if key < last {
                return Err(StorageError::InvalidPart(format!(
                    "blocks out of order: {:?} after {:?}",
                    key, last
                )));
            }
        }
        self.last_key = Some(key);

        let (mut bh, payload) = block.marshal()?;
        bh.offset = self.offset;
        self.writer.write_all(&payload)?;
        self.offset += payload.len() as u64;

        self.header.block_count += 1;
        self.header.rows_count += u64::from(bh.rows_count);
        self.header.min_timestamp = self.header.min_timestamp.min(bh.min_timestamp);
        self.header.max_timestamp = self.header.max_timestamp.max(bh.max_timestamp);
        self.blocks.push(bh);
        Ok(())
    }

    /// Rows written so far
    pub fn rows_count(&self) -> u64 {
        self.header.rows_count
    }

    /// Give up on the part and remove the temporary file
    pub fn abort(self) {
        let tmp = self.tmp_path.clone();
        drop(self.writer);
        if let Err(e) = std::fs::remove_file(&tmp) {
            tracing::warn!(path = ?tmp, "cannot remove unfinished part: {}", e);
        }
    }

    /// Write the footer, sync and move the file to its final name.
    /// Returns `None` (and removes the temporary file) when no rows were written.
    pub fn finish(mut self) -> StorageResult<Option<PathBuf>> {
        if self.blocks.is_empty() {
            drop(self.writer);
            std::fs::remove_file(&self.tmp_path)?;
            return Ok(None);
        }

        let mut footer = Vec::with_capacity(self.blocks.len() * BLOCK_HEADER_SIZE);
        for bh in &self.blocks {
            bh.marshal(&mut footer);
        }
        let checksum = crc32fast::hash(&footer);
        self.writer.write_all(&footer)?;
        self.writer.write_all(&(footer.len() as u32).to_le_bytes())?;
        self.writer.write_all(&checksum.to_le_bytes())?;

        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&self.header.to_bytes())?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        drop(self.writer);

        std::fs::rename(&self.tmp_path, &self.final_path)?;
        sync_parent_dir(&self.final_path)?;
        Ok(Some(self.final_path))
    }
}

/// Fsync the directory holding `path` so a rename is durable
pub fn sync_parent_dir(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// An open, memory-mapped part
pub struct Part {
    pub path: PathBuf,
    pub header: PartHeader,
    /// Sorted by (TSID, min timestamp)
    pub blocks: Vec<BlockHeader>,
    mmap: Mmap,
    size_bytes: u64,
}

impl std::fmt::Debug for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Part")
            .field("path", &self.path)
            .field("blocks", &self.blocks.len())
            .field("rows", &self.header.rows_count)
            .finish()
    }
}

impl Part {
    /// Open an existing part file, validating header and footer
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        Self::open_inner(&path).map_err(|e| e.in_part(&path))
    }

    fn open_inner(path: &Path) -> StorageResult<Self> {
        let file = File::open(path)?;
        let size_bytes = file.metadata()?.len();
        // SAFETY: part files are immutable once renamed into place
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let header = PartHeader::from_bytes(&mmap)?;
        let blocks = Self::read_footer(&mmap, &header)?;

        Ok(Self {
            path: path.to_path_buf(),
            header,
            blocks,
            mmap,
            size_bytes,
        })
    }

    fn read_footer(data: &[u8], header: &PartHeader) -> StorageResult<Vec<BlockHeader>> {
        let len = data.len();
        if len < HEADER_SIZE + 8 {
            return Err(StorageError::InvalidPart("missing footer".into()));
        }
        let footer_size =
            u32::from_le_bytes([data[len - 8], data[len - 7], data[len - 6], data[len - 5]])
                as usize;
        let stored_checksum =
            u32::from_le_bytes([data[len - 4], data[len - 3], data[len - 2], data[len - 1]]);
        if footer_size + 8 + HEADER_SIZE > len {
            return Err(StorageError::InvalidPart(format!(
                "footer size {} exceeds file size {}",
                footer_size, len
            )));
        }
        let footer = &data[len - 8 - footer_size..len - 8];
        let computed_checksum = crc32fast::hash(footer);
        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption("Footer checksum mismatch".into()));
        }
        if footer.len() != header.block_count as usize * BLOCK_HEADER_SIZE {
            return Err(StorageError::InvalidPart(format!(
                "footer holds {} bytes for {} blocks",
                footer.len(),
                header.block_count
            )));
        }

        let payload_end = (len - 8 - footer_size) as u64;
        let mut blocks = Vec::with_capacity(header.block_count as usize);
        for chunk in footer.chunks_exact(BLOCK_HEADER_SIZE) {
            let bh = BlockHeader::unmarshal(chunk)?;
            if bh.offset < HEADER_SIZE as u64 || bh.offset + bh.payload_size() as u64 > payload_end
            {
                return Err(StorageError::InvalidPart(format!(
                    "block at offset {} overruns the payload area",
                    bh.offset
                )));
            }
            blocks.push(bh);
        }
        Ok(blocks)
    }

    /// Decode the block at `idx`
    pub fn read_block(&self, idx: usize) -> StorageResult<Block> {
        let bh = self.blocks.get(idx).ok_or_else(|| {
            StorageError::InvalidPart(format!("Block index out of range: {}", idx))
        })?;
        let start = bh.offset as usize;
        let end = start + bh.payload_size();
        bh.decode(&self.mmap[start..end])
            .map_err(|e| e.in_part(&self.path))
    }

    /// Indices of the blocks of `tsid` overlapping `range`
    pub fn block_indices(&self, tsid: &Tsid, range: &TimeRange) -> std::ops::Range<usize> {
        let start = self.blocks.partition_point(|b| b.tsid < *tsid);
        let end = start + self.blocks[start..].partition_point(|b| b.tsid == *tsid);
        let mut lo = start;
        while lo < end && self.blocks[lo].max_timestamp < range.min_timestamp {
            lo += 1;
        }
        let mut hi = lo;
        while hi < end && self.blocks[hi].min_timestamp <= range.max_timestamp {
            hi += 1;
        }
        lo..hi
    }

    pub fn overlaps(&self, range: &TimeRange) -> bool {
        range.overlaps(self.header.min_timestamp, self.header.max_timestamp)
    }

    pub fn rows_count(&self) -> u64 {
        self.header.rows_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// File name without directory
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Shared handle to a live part
///
/// Readers and merges hold `Arc<PartHandle>`. When a merge replaces the
/// part it sets `must_drop`; the file is removed once the last reference
/// goes away, so in-flight readers never see it vanish.
#[derive(Debug)]
pub struct PartHandle {
    pub part: Part,
    in_merge: AtomicBool,
    must_drop: AtomicBool,
}

impl PartHandle {
    pub fn new(part: Part) -> Self {
        Self {
            part,
            in_merge: AtomicBool::new(false),
            must_drop: AtomicBool::new(false),
        }
    }

    /// Claim the part for a merge; false if another merge owns it
    pub fn try_start_merge(&self) -> bool {
        self.in_merge
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_merge(&self) {
        self.in_merge.store(false, Ordering::Release);
    }

    pub fn is_in_merge(&self) -> bool {
        self.in_merge.load(Ordering::Acquire)
    }

    /// Delete the file once the last reference is dropped
    pub fn mark_for_drop(&self) {
        self.must_drop.store(true, Ordering::Release);
    }

    /// Undo [`PartHandle::mark_for_drop`] once the part is listed
    pub fn keep(&self) {
        self.must_drop.store(false, Ordering::Release);
    }
}

impl Drop for PartHandle {
    fn drop(&mut self) {
        if self.must_drop.load(Ordering::Acquire) {
            match std::fs::remove_file(&self.part.path) {
                Ok(()) => {}
                // the whole partition directory is already gone
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = ?self.part.path, "cannot remove merged part: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tsid(id: u64) -> Tsid {
        Tsid {
            metric_group_id: 7,
            job_id: 0,
            instance_id: 0,
            metric_id: id,
        }
    }

    fn write_part(path: &Path, blocks: &[Block]) -> PathBuf {
        let mut w = PartWriter::create(path).unwrap();
        for b in blocks {
            w.write_block(b).unwrap();
        }
        w.finish().unwrap().unwrap()
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let blocks = vec![
            Block::new(tsid(1), vec![10, 20, 30], vec![1.0, 2.0, 3.0], 64),
            Block::new(tsid(2), vec![15, 25], vec![0.5, 0.25], 64),
        ];
        let path = write_part(&dir.path().join("0000000000000001.part"), &blocks);
        assert!(!path.with_extension("part.tmp").exists());

        let part = Part::open(&path).unwrap();
        assert_eq!(part.header.block_count, 2);
        assert_eq!(part.rows_count(), 5);
        assert_eq!(part.header.min_timestamp, 10);
        assert_eq!(part.header.max_timestamp, 30);
        assert_eq!(part.read_block(0).unwrap(), blocks[0]);
        assert_eq!(part.read_block(1).unwrap(), blocks[1]);
    }

    #[test]
    fn test_large_block_is_split() {
        let dir = tempdir().unwrap();
        let n = MAX_ROWS_PER_BLOCK * 2 + 5;
        let ts: Vec<i64> = (0..n as i64).collect();
        let vs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let path = write_part(
            &dir.path().join("a.part"),
            &[Block::new(tsid(1), ts, vs, 64)],
        );
        let part = Part::open(&path).unwrap();
        assert_eq!(part.header.block_count, 3);
        assert_eq!(part.rows_count(), n as u64);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let dir = tempdir().unwrap();
        let mut w = PartWriter::create(dir.path().join("a.part")).unwrap();
        w.write_block(&Block::new(tsid(2), vec![1], vec![1.0], 64)).unwrap();
        assert!(w
            .write_block(&Block::new(tsid(1), vec![1], vec![1.0], 64))
            .is_err());
    }

    #[test]
    fn test_empty_writer_leaves_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.part");
        let w = PartWriter::create(&path).unwrap();
        assert!(w.finish().unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_block_indices() {
        let dir = tempdir().unwrap();
        let blocks = vec![
            Block::new(tsid(1), vec![10, 20], vec![1.0, 2.0], 64),
            Block::new(tsid(2), vec![10, 20], vec![1.0, 2.0], 64),
            Block::new(tsid(2), vec![30, 40], vec![1.0, 2.0], 64),
            Block::new(tsid(3), vec![10], vec![1.0], 64),
        ];
        let part = Part::open(write_part(&dir.path().join("a.part"), &blocks)).unwrap();
        let all = TimeRange::all();
        assert_eq!(part.block_indices(&tsid(2), &all), 1..3);
        assert_eq!(
            part.block_indices(&tsid(2), &TimeRange::try_new(25, 100).unwrap()),
            2..3
        );
        assert!(part.block_indices(&tsid(9), &all).is_empty());
    }

    #[test]
    fn test_corrupt_footer_detected() {
        let dir = tempdir().unwrap();
        let path = write_part(
            &dir.path().join("a.part"),
            &[Block::new(tsid(1), vec![1, 2], vec![1.0, 2.0], 64)],
        );
        let mut data = std::fs::read(&path).unwrap();
        let n = data.len();
        data[n - 20] ^= 0xff;
        std::fs::write(&path, data).unwrap();
        assert!(Part::open(&path).is_err());
    }

    #[test]
    fn test_handle_drop_removes_marked_file() {
        let dir = tempdir().unwrap();
        let path = write_part(
            &dir.path().join("a.part"),
            &[Block::new(tsid(1), vec![1], vec![1.0], 64)],
        );
        let handle = std::sync::Arc::new(PartHandle::new(Part::open(&path).unwrap()));
        let reader = handle.clone();
        handle.mark_for_drop();
        drop(handle);
        assert!(path.exists());
        drop(reader);
        assert!(!path.exists());
    }
}
