//! Columnar encoding for block timestamps and values
//!
//! Every column is described by a [`MarshalType`] and a first value stored
//! in the block header, so constant columns need no payload at all.
//!
//! Strategy:
//! 1. Timestamps are always encoded losslessly as an int64 column
//! 2. Values are rounded to `precision_bits` significant bits
//! 3. Integral values take the int64 column path (const, delta const,
//!    delta or delta2)
//! 4. Other values are XOR encoded against their predecessor
//! 5. Payloads of at least 128 bytes are LZ4 compressed when that saves
//!    more than 10%

pub mod float;
pub mod int;

use crate::storage::error::{StorageError, StorageResult};

pub use float::{relative_error_bound, round_to_precision};
pub use int::{get_bytes, get_varint, get_varuint, put_bytes, put_varint, put_varuint};

/// Smallest payload worth compressing
const MIN_COMPRESSIBLE_SIZE: usize = 128;

/// Largest integer magnitude an `f64` represents exactly
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// Encoding used for one column of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MarshalType {
    Lz4NearestDelta2 = 1,
    DeltaConst = 2,
    Const = 3,
    Lz4NearestDelta = 4,
    NearestDelta2 = 5,
    NearestDelta = 6,
    Xor = 7,
    Lz4Xor = 8,
}

impl TryFrom<u8> for MarshalType {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MarshalType::Lz4NearestDelta2,
            2 => MarshalType::DeltaConst,
            3 => MarshalType::Const,
            4 => MarshalType::Lz4NearestDelta,
            5 => MarshalType::NearestDelta2,
            6 => MarshalType::NearestDelta,
            7 => MarshalType::Xor,
            8 => MarshalType::Lz4Xor,
            _ => {
                return Err(StorageError::Corruption(format!(
                    "unknown marshal type: {}",
                    value
                )))
            }
        })
    }
}

impl MarshalType {
    /// True when the column holds raw `f64` bit patterns
    pub fn is_float(self) -> bool {
        matches!(self, MarshalType::Xor | MarshalType::Lz4Xor)
    }

    fn compressed(self) -> Self {
        match self {
            MarshalType::NearestDelta2 => MarshalType::Lz4NearestDelta2,
            MarshalType::NearestDelta => MarshalType::Lz4NearestDelta,
            MarshalType::Xor => MarshalType::Lz4Xor,
            other => other,
        }
    }
}

/// Make sure `precision_bits` is within `1..=64`
pub fn check_precision_bits(precision_bits: u8) -> StorageResult<()> {
    if (1..=64).contains(&precision_bits) {
        Ok(())
    } else {
        Err(StorageError::InvalidPrecisionBits(precision_bits))
    }
}

/// Encoded column with the header fields needed to decode it
#[derive(Debug, Clone)]
pub struct EncodedColumn {
    pub data: Vec<u8>,
    pub marshal_type: MarshalType,
    pub first_value: i64,
}

/// Encode timestamps losslessly. `timestamps` must not be empty.
pub fn marshal_timestamps(timestamps: &[i64]) -> EncodedColumn {
    marshal_int64_array(timestamps)
}

/// Decode a timestamps column
pub fn unmarshal_timestamps(
    src: &[u8],
    marshal_type: MarshalType,
    first_value: i64,
    count: usize,
) -> StorageResult<Vec<i64>> {
    if marshal_type.is_float() {
        return Err(StorageError::Corruption(format!(
            "marshal type {:?} is not valid for timestamps",
            marshal_type
        )));
    }
    unmarshal_int64_array(src, marshal_type, first_value, count)
}

/// Round values to `precision_bits` and encode them. `values` must not be empty.
pub fn marshal_values(values: &[f64], precision_bits: u8) -> EncodedColumn {
    let rounded: Vec<f64> = values
        .iter()
        .map(|&v| round_to_precision(v, precision_bits))
        .collect();

    if let Some(ints) = as_exact_ints(&rounded) {
        return marshal_int64_array(&ints);
    }

    let mut payload = Vec::with_capacity(rounded.len() * 2);
    float::marshal_xor(&mut payload, &rounded);
    let (data, marshal_type) = maybe_compress(payload, MarshalType::Xor);
    EncodedColumn {
        data,
        marshal_type,
        first_value: rounded[0].to_bits() as i64,
    }
}

/// Decode a values column
pub fn unmarshal_values(
    src: &[u8],
    marshal_type: MarshalType,
    first_value: i64,
    count: usize,
) -> StorageResult<Vec<f64>> {
    match marshal_type {
        MarshalType::Xor => float::unmarshal_xor(src, first_value as u64, count),
        MarshalType::Lz4Xor => {
            let raw = decompress(src)?;
            float::unmarshal_xor(&raw, first_value as u64, count)
        }
        _ => Ok(unmarshal_int64_array(src, marshal_type, first_value, count)?
            .into_iter()
            .map(|v| v as f64)
            .collect()),
    }
}

fn as_exact_ints(values: &[f64]) -> Option<Vec<i64>> {
    values
        .iter()
        .map(|&v| {
            if v.fract() == 0.0 && v.abs() <= MAX_EXACT_INT && !(v == 0.0 && v.is_sign_negative()) {
                Some(v as i64)
            } else {
                None
            }
        })
        .collect()
}

fn marshal_int64_array(a: &[i64]) -> EncodedColumn {
    let first_value = a[0];
    if int::is_const(a) {
        return EncodedColumn {
            data: Vec::new(),
            marshal_type: MarshalType::Const,
            first_value,
        };
    }
    if int::is_delta_const(a) {
        let mut data = Vec::with_capacity(10);
        put_varint(&mut data, a[1].wrapping_sub(a[0]));
        return EncodedColumn {
            data,
            marshal_type: MarshalType::DeltaConst,
            first_value,
        };
    }

    let mut payload = Vec::with_capacity(a.len() * 2);
    let marshal_type = if int::is_gauge(a) {
        int::marshal_delta(&mut payload, a);
        MarshalType::NearestDelta
    } else {
        int::marshal_delta2(&mut payload, a);
        MarshalType::NearestDelta2
    };
    let (data, marshal_type) = maybe_compress(payload, marshal_type);
    EncodedColumn {
        data,
        marshal_type,
        first_value,
    }
}

fn unmarshal_int64_array(
    src: &[u8],
    marshal_type: MarshalType,
    first_value: i64,
    count: usize,
) -> StorageResult<Vec<i64>> {
    match marshal_type {
        MarshalType::Const => {
            if !src.is_empty() {
                return Err(StorageError::Corruption(format!(
                    "const column must be empty, got {} bytes",
                    src.len()
                )));
            }
            Ok(vec![first_value; count])
        }
        MarshalType::DeltaConst => {
            let (delta, rest) = get_varint(src)?;
            if !rest.is_empty() {
                return Err(StorageError::Corruption(
                    "unexpected trailing bytes in delta const column".into(),
                ));
            }
            let mut out = Vec::with_capacity(count);
            let mut v = first_value;
            for _ in 0..count {
                out.push(v);
                v = v.wrapping_add(delta);
            }
            Ok(out)
        }
        MarshalType::NearestDelta => int::unmarshal_delta(src, first_value, count),
        MarshalType::NearestDelta2 => int::unmarshal_delta2(src, first_value, count),
        MarshalType::Lz4NearestDelta => int::unmarshal_delta(&decompress(src)?, first_value, count),
        MarshalType::Lz4NearestDelta2 => {
            int::unmarshal_delta2(&decompress(src)?, first_value, count)
        }
        MarshalType::Xor | MarshalType::Lz4Xor => Err(StorageError::Corruption(format!(
            "marshal type {:?} is not an integer column",
            marshal_type
        ))),
    }
}

fn maybe_compress(payload: Vec<u8>, marshal_type: MarshalType) -> (Vec<u8>, MarshalType) {
    if payload.len() < MIN_COMPRESSIBLE_SIZE {
        return (payload, marshal_type);
    }
    let compressed = lz4_flex::compress_prepend_size(&payload);
    if (compressed.len() as f64) < 0.9 * payload.len() as f64 {
        (compressed, marshal_type.compressed())
    } else {
        (payload, marshal_type)
    }
}

fn decompress(src: &[u8]) -> StorageResult<Vec<u8>> {
    lz4_flex::decompress_size_prepended(src)
        .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_values(values: &[f64], pb: u8) -> Vec<f64> {
        let col = marshal_values(values, pb);
        unmarshal_values(&col.data, col.marshal_type, col.first_value, values.len()).unwrap()
    }

    #[test]
    fn test_timestamps_are_lossless() {
        let cases: Vec<Vec<i64>> = vec![
            vec![1000],
            vec![1000, 2000, 3000, 4000],
            (0..5000).map(|i| 1_700_000_000_000 + i * 15_000 + (i % 7)).collect(),
            vec![-5, 0, 7, 1_000_000_000_000],
        ];
        for ts in cases {
            let col = marshal_timestamps(&ts);
            let got =
                unmarshal_timestamps(&col.data, col.marshal_type, col.first_value, ts.len())
                    .unwrap();
            assert_eq!(got, ts);
        }
    }

    #[test]
    fn test_marshal_type_selection() {
        assert_eq!(marshal_timestamps(&[5, 5, 5]).marshal_type, MarshalType::Const);
        assert_eq!(
            marshal_timestamps(&[10, 20, 30]).marshal_type,
            MarshalType::DeltaConst
        );
        assert_eq!(marshal_values(&[0.5, 1.25, 0.75], 64).marshal_type, MarshalType::Xor);
        let counter: Vec<f64> = (0..1000).map(|i| (i * i) as f64).collect();
        assert_eq!(
            marshal_values(&counter, 64).marshal_type,
            MarshalType::Lz4NearestDelta2
        );
    }

    #[test]
    fn test_values_exact_at_full_precision() {
        let values: Vec<f64> = (0..3000)
            .map(|i| (i as f64 * 0.37).sin() * 1e6 + 0.123)
            .collect();
        let got = round_trip_values(&values, 64);
        for (a, b) in got.iter().zip(&values) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_values_within_bound_at_low_precision() {
        let values: Vec<f64> = (1..2000).map(|i| 1000.0 / i as f64).collect();
        for pb in [4u8, 12, 24, 40] {
            let bound = relative_error_bound(pb);
            let got = round_trip_values(&values, pb);
            for (a, b) in got.iter().zip(&values) {
                assert!(((a - b) / b).abs() <= bound);
            }
        }
    }

    #[test]
    fn test_negative_zero_and_nan_survive() {
        let values = vec![-0.0, f64::NAN, 1.0, f64::NEG_INFINITY];
        let got = round_trip_values(&values, 64);
        assert!(got[0] == 0.0 && got[0].is_sign_negative());
        assert!(got[1].is_nan());
        assert_eq!(got[2], 1.0);
        assert_eq!(got[3], f64::NEG_INFINITY);
    }

    #[test]
    fn test_precision_bits_range() {
        assert!(check_precision_bits(0).is_err());
        assert!(check_precision_bits(1).is_ok());
        assert!(check_precision_bits(64).is_ok());
        assert!(check_precision_bits(65).is_err());
    }

    #[test]
    fn test_corrupt_marshal_type() {
        assert!(MarshalType::try_from(0).is_err());
        assert!(unmarshal_timestamps(&[], MarshalType::Xor, 0, 1).is_err());
    }
}
