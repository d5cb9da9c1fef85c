//! Blocks: time-ordered columnar runs of samples for one TSID
//!
//! A block payload is the encoded timestamps column followed by the encoded
//! values column. Everything needed to decode it lives in the fixed-size
//! `BlockHeader`, which parts keep in their footer.
//!
//! Header layout (83 bytes, little endian):
//! ```text
//! tsid            [u8; 24]  big endian, sortable
//! min_timestamp   i64
//! max_timestamp   i64
//! first_timestamp i64
//! first_value     i64
//! rows_count      u32
//! offset          u64       payload offset inside the part file
//! timestamps_size u32
//! values_size     u32
//! timestamps_type u8
//! values_type     u8
//! precision_bits  u8
//! checksum        u32       CRC32 of the payload
//! ```

use crate::encoding::{self, MarshalType};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tsid::{Tsid, TSID_SIZE};

/// Marshaled size of a block header
pub const BLOCK_HEADER_SIZE: usize = 83;

/// Upper bound on rows in one block
pub const MAX_ROWS_PER_BLOCK: usize = 8 * 1024;

/// Decoded block
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub tsid: Tsid,
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
    pub precision_bits: u8,
}

impl Block {
    /// Create a block; rows are sorted by timestamp
    pub fn new(tsid: Tsid, timestamps: Vec<i64>, values: Vec<f64>, precision_bits: u8) -> Self {
        let mut b = Self {
            tsid,
            timestamps,
            values,
            precision_bits,
        };
        b.sort_rows();
        b
    }

    pub fn rows_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    fn sort_rows(&mut self) {
        if self.timestamps.windows(2).all(|w| w[0] <= w[1]) {
            return;
        }
        let mut rows: Vec<(i64, f64)> = self
            .timestamps
            .iter()
            .copied()
            .zip(self.values.iter().copied())
            .collect();
        rows.sort_by_key(|r| r.0);
        self.timestamps = rows.iter().map(|r| r.0).collect();
        self.values = rows.iter().map(|r| r.1).collect();
    }

    /// Keep only rows for which `keep(timestamp)` is true
    pub fn retain_timestamps(&mut self, mut keep: impl FnMut(i64) -> bool) {
        let mut j = 0;
        for i in 0..self.timestamps.len() {
            if keep(self.timestamps[i]) {
                self.timestamps[j] = self.timestamps[i];
                self.values[j] = self.values[i];
                j += 1;
            }
        }
        self.timestamps.truncate(j);
        self.values.truncate(j);
    }

    /// Encode the block, returning its header (offset unset) and payload
    pub fn marshal(&self) -> StorageResult<(BlockHeader, Vec<u8>)> {
        if self.is_empty() {
            return Err(StorageError::InvalidPart("cannot marshal an empty block".into()));
        }
        if self.timestamps.len() != self.values.len() {
            return Err(StorageError::InvalidPart(format!(
                "block has {} timestamps and {} values",
                self.timestamps.len(),
                self.values.len()
            )));
        }
        let ts = encoding::marshal_timestamps(&self.timestamps);
        let vs = encoding::marshal_values(&self.values, self.precision_bits);

        let mut payload = Vec::with_capacity(ts.data.len() + vs.data.len());
        payload.extend_from_slice(&ts.data);
        payload.extend_from_slice(&vs.data);

        let header = BlockHeader {
            tsid: self.tsid,
            min_timestamp: self.timestamps[0],
            max_timestamp: self.timestamps[self.timestamps.len() - 1],
            first_timestamp: ts.first_value,
            first_value: vs.first_value,
            rows_count: self.timestamps.len() as u32,
            offset: 0,
            timestamps_size: ts.data.len() as u32,
            values_size: vs.data.len() as u32,
            timestamps_type: ts.marshal_type,
            values_type: vs.marshal_type,
            precision_bits: self.precision_bits,
            checksum: crc32fast::hash(&payload),
        };
        Ok((header, payload))
    }
}

/// Location and decoding parameters of one block inside a part
#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub tsid: Tsid,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub first_timestamp: i64,
    pub first_value: i64,
    pub rows_count: u32,
    pub offset: u64,
    pub timestamps_size: u32,
    pub values_size: u32,
    pub timestamps_type: MarshalType,
    pub values_type: MarshalType,
    pub precision_bits: u8,
    pub checksum: u32,
}

impl BlockHeader {
    /// Total payload size in bytes
    pub fn payload_size(&self) -> usize {
        self.timestamps_size as usize + self.values_size as usize
    }

    pub fn marshal(&self, dst: &mut Vec<u8>) {
        self.tsid.marshal(dst);
        dst.extend_from_slice(&self.min_timestamp.to_le_bytes());
        dst.extend_from_slice(&self.max_timestamp.to_le_bytes());
        dst.extend_from_slice(&self.first_timestamp.to_le_bytes());
        dst.extend_from_slice(&self.first_value.to_le_bytes());
        dst.extend_from_slice(&self.rows_count.to_le_bytes());
        dst.extend_from_slice(&self.offset.to_le_bytes());
        dst.extend_from_slice(&self.timestamps_size.to_le_bytes());
        dst.extend_from_slice(&self.values_size.to_le_bytes());
        dst.push(self.timestamps_type as u8);
        dst.push(self.values_type as u8);
        dst.push(self.precision_bits);
        dst.extend_from_slice(&self.checksum.to_le_bytes());
    }

    pub fn unmarshal(src: &[u8]) -> StorageResult<Self> {
        if src.len() < BLOCK_HEADER_SIZE {
            return Err(StorageError::InvalidPart(format!(
                "block header needs {} bytes, got {}",
                BLOCK_HEADER_SIZE,
                src.len()
            )));
        }
        let i64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&src[i..i + 8]);
            i64::from_le_bytes(b)
        };
        let u32_at = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&src[i..i + 4]);
            u32::from_le_bytes(b)
        };
        let tsid = Tsid::unmarshal(&src[..TSID_SIZE])?;
        let base = TSID_SIZE;
        let header = Self {
            tsid,
            min_timestamp: i64_at(base),
            max_timestamp: i64_at(base + 8),
            first_timestamp: i64_at(base + 16),
            first_value: i64_at(base + 24),
            rows_count: u32_at(base + 32),
            offset: i64_at(base + 36) as u64,
            timestamps_size: u32_at(base + 44),
            values_size: u32_at(base + 48),
            timestamps_type: MarshalType::try_from(src[base + 52])?,
            values_type: MarshalType::try_from(src[base + 53])?,
            precision_bits: src[base + 54],
            checksum: u32_at(base + 55),
        };
        encoding::check_precision_bits(header.precision_bits)?;
        if header.rows_count == 0 || header.min_timestamp > header.max_timestamp {
            return Err(StorageError::InvalidPart(format!(
                "invalid block header: rows={} min_ts={} max_ts={}",
                header.rows_count, header.min_timestamp, header.max_timestamp
            )));
        }
        Ok(header)
    }

    /// Decode the block from its payload
    pub fn decode(&self, payload: &[u8]) -> StorageResult<Block> {
        if payload.len() != self.payload_size() {
            return Err(StorageError::Corruption(format!(
                "block payload is {} bytes, header says {}",
                payload.len(),
                self.payload_size()
            )));
        }
        let computed = crc32fast::hash(payload);
        if computed != self.checksum {
            return Err(StorageError::Corruption(format!(
                "block checksum mismatch: stored={}, computed={}",
                self.checksum, computed
            )));
        }
        let (ts_data, values_data) = payload.split_at(self.timestamps_size as usize);
        let count = self.rows_count as usize;
        let timestamps = encoding::unmarshal_timestamps(
            ts_data,
            self.timestamps_type,
            self.first_timestamp,
            count,
        )?;
        let values =
            encoding::unmarshal_values(values_data, self.values_type, self.first_value, count)?;
        Ok(Block {
            tsid: self.tsid,
            timestamps,
            values,
            precision_bits: self.precision_bits,
        })
    }
}
