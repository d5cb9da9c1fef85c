//! Float values: precision rounding and XOR encoding
//!
//! `round_to_precision` keeps `precision_bits` significant bits of the
//! mantissa (round half up on the bit pattern). The relative error of a
//! rounded value is at most `2^-precision_bits`; 53 bits and above are
//! lossless.
//!
//! Values that are not integral after rounding are stored as the XOR of
//! consecutive bit patterns: a trailing-zero byte followed by the shifted
//! XOR as a varint. Rounding zeroes low mantissa bits, so fewer precision
//! bits give shorter varints.

use super::int::{get_varuint, put_varuint};
use crate::storage::error::{StorageError, StorageResult};

const MANTISSA_BITS: u32 = 52;

/// Round `v` to `precision_bits` significant bits
pub fn round_to_precision(v: f64, precision_bits: u8) -> f64 {
    if precision_bits >= 53 || !v.is_finite() || v == 0.0 {
        return v;
    }
    let keep = u32::from(precision_bits.max(1)) - 1;
    let drop = MANTISSA_BITS - keep;
    let bits = v.to_bits();
    let half = 1u64 << (drop - 1);
    let mask = !((1u64 << drop) - 1);
    let rounded = f64::from_bits((bits + half) & mask);
    if rounded.is_finite() {
        rounded
    } else {
        f64::from_bits(bits & mask)
    }
}

/// Upper bound of the relative rounding error for `precision_bits`
pub fn relative_error_bound(precision_bits: u8) -> f64 {
    if precision_bits >= 53 {
        0.0
    } else {
        2f64.powi(-i32::from(precision_bits))
    }
}

pub(crate) fn marshal_xor(dst: &mut Vec<u8>, values: &[f64]) {
    let mut prev = match values.first() {
        Some(v) => v.to_bits(),
        None => return,
    };
    for v in &values[1..] {
        let bits = v.to_bits();
        let xor = bits ^ prev;
        if xor == 0 {
            dst.push(64);
        } else {
            let tz = xor.trailing_zeros();
            dst.push(tz as u8);
            put_varuint(dst, xor >> tz);
        }
        prev = bits;
    }
}

pub(crate) fn unmarshal_xor(mut src: &[u8], first_bits: u64, count: usize) -> StorageResult<Vec<f64>> {
    let mut out = Vec::with_capacity(count);
    if count == 0 {
        return Ok(out);
    }
    let mut prev = first_bits;
    out.push(f64::from_bits(prev));
    for _ in 1..count {
        let (&tz, rest) = src
            .split_first()
            .ok_or_else(|| StorageError::Corruption("unexpected end of xor column".into()))?;
        src = rest;
        if tz == 64 {
            out.push(f64::from_bits(prev));
            continue;
        }
        if tz > 63 {
            return Err(StorageError::Corruption(format!(
                "invalid trailing zero count {} in xor column",
                tz
            )));
        }
        let (shifted, rest) = get_varuint(src)?;
        src = rest;
        prev ^= shifted << tz;
        out.push(f64::from_bits(prev));
    }
    if !src.is_empty() {
        return Err(StorageError::Corruption(format!(
            "{} unexpected trailing bytes in xor column",
            src.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lossless_at_high_precision() {
        for v in [0.1, -3.75e300, f64::MIN_POSITIVE, 123456.789] {
            assert_eq!(round_to_precision(v, 64).to_bits(), v.to_bits());
            assert_eq!(round_to_precision(v, 53).to_bits(), v.to_bits());
        }
    }

    #[test]
    fn test_error_bound_is_monotonic() {
        let samples = [0.1, 1.0 / 3.0, 9_999.999, -0.000_123_4, 1e17 + 3.0];
        let mut prev_bound = f64::MAX;
        for pb in 1..=64u8 {
            let bound = relative_error_bound(pb);
            for &v in &samples {
                let r = round_to_precision(v, pb);
                let err = ((r - v) / v).abs();
                assert!(err <= bound, "pb={} v={} r={} err={}", pb, v, r, err);
            }
            assert!(bound <= prev_bound);
            prev_bound = bound;
        }
    }

    #[test]
    fn test_one_bit_is_power_of_two() {
        assert_eq!(round_to_precision(3.0, 1), 4.0);
        assert_eq!(round_to_precision(2.9, 1), 2.0);
    }

    #[test]
    fn test_special_values_untouched() {
        assert!(round_to_precision(f64::NAN, 4).is_nan());
        assert_eq!(round_to_precision(f64::INFINITY, 4), f64::INFINITY);
        assert_eq!(round_to_precision(f64::MAX, 2), f64::from_bits(f64::MAX.to_bits() & !((1u64 << 51) - 1)));
    }

    #[test]
    fn test_xor_round_trip() {
        let values = vec![1.5, 1.5, 2.25, f64::NAN, -0.0, 1e-300];
        let mut buf = Vec::new();
        marshal_xor(&mut buf, &values);
        let got = unmarshal_xor(&buf, values[0].to_bits(), values.len()).unwrap();
        let got_bits: Vec<u64> = got.iter().map(|v| v.to_bits()).collect();
        let want_bits: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
        assert_eq!(got_bits, want_bits);
    }
}
