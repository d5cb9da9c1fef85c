//! Integer primitives and int64 column codecs
//!
//! Variable-length integers use LEB128 with zig-zag for signed values.
//! Columns are encoded as one of:
//! - const: every item equals the first value (no payload)
//! - delta const: constant step, payload is the step
//! - delta: zig-zag varint of each difference (gauges)
//! - delta2: zig-zag varint of each difference of differences (counters)
//!
//! All arithmetic wraps, so any `i64` sequence round-trips exactly.

use crate::storage::error::{StorageError, StorageResult};

/// Append an unsigned LEB128 varint to `dst`
pub fn put_varuint(dst: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        dst.push((v as u8) | 0x80);
        v >>= 7;
    }
    dst.push(v as u8);
}

/// Append a zig-zag encoded signed varint to `dst`
pub fn put_varint(dst: &mut Vec<u8>, v: i64) {
    put_varuint(dst, zigzag(v));
}

/// Read an unsigned varint, returning the value and the remaining bytes
pub fn get_varuint(src: &[u8]) -> StorageResult<(u64, &[u8])> {
    let mut result = 0u64;
    let mut shift = 0u32;
    for (i, &b) in src.iter().enumerate() {
        if shift >= 64 {
            return Err(StorageError::Corruption("varint overflows u64".into()));
        }
        result |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok((result, &src[i + 1..]));
        }
        shift += 7;
    }
    Err(StorageError::Corruption("unexpected end of varint".into()))
}

/// Read a zig-zag encoded signed varint
pub fn get_varint(src: &[u8]) -> StorageResult<(i64, &[u8])> {
    let (u, rest) = get_varuint(src)?;
    Ok((unzigzag(u), rest))
}

#[inline]
pub fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
pub fn unzigzag(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

/// Append a length-prefixed byte string
pub fn put_bytes(dst: &mut Vec<u8>, b: &[u8]) {
    put_varuint(dst, b.len() as u64);
    dst.extend_from_slice(b);
}

/// Read a length-prefixed byte string
pub fn get_bytes(src: &[u8]) -> StorageResult<(&[u8], &[u8])> {
    let (len, rest) = get_varuint(src)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(StorageError::Corruption(format!(
            "byte string of length {} exceeds remaining {} bytes",
            len,
            rest.len()
        )));
    }
    Ok((&rest[..len], &rest[len..]))
}

pub(crate) fn is_const(a: &[i64]) -> bool {
    a.iter().all(|&v| v == a[0])
}

pub(crate) fn is_delta_const(a: &[i64]) -> bool {
    if a.len() < 2 {
        return false;
    }
    let d = a[1].wrapping_sub(a[0]);
    a.windows(2).all(|w| w[1].wrapping_sub(w[0]) == d)
}

/// Gauges are better served by delta encoding, counters by delta2.
///
/// A series is a counter when it never goes negative and only drops
/// a couple of times (resets) to well below its previous value.
pub(crate) fn is_gauge(a: &[i64]) -> bool {
    if a.len() < 2 {
        return false;
    }
    if a[0] < 0 {
        return true;
    }
    let mut resets = 0;
    for w in a.windows(2) {
        let (prev, v) = (w[0], w[1]);
        if v < prev {
            if v < 0 || v > (prev >> 3) {
                return true;
            }
            resets += 1;
        }
    }
    resets > 2
}

pub(crate) fn marshal_delta(dst: &mut Vec<u8>, a: &[i64]) {
    for w in a.windows(2) {
        put_varint(dst, w[1].wrapping_sub(w[0]));
    }
}

pub(crate) fn unmarshal_delta(
    mut src: &[u8],
    first: i64,
    count: usize,
) -> StorageResult<Vec<i64>> {
    let mut out = Vec::with_capacity(count);
    if count == 0 {
        return Ok(out);
    }
    let mut v = first;
    out.push(v);
    for _ in 1..count {
        let (d, rest) = get_varint(src)?;
        src = rest;
        v = v.wrapping_add(d);
        out.push(v);
    }
    ensure_consumed(src)?;
    Ok(out)
}

pub(crate) fn marshal_delta2(dst: &mut Vec<u8>, a: &[i64]) {
    if a.len() < 2 {
        return;
    }
    let first_delta = a[1].wrapping_sub(a[0]);
    put_varint(dst, first_delta);
    let mut prev_delta = first_delta;
    for w in a[1..].windows(2) {
        let d = w[1].wrapping_sub(w[0]);
        put_varint(dst, d.wrapping_sub(prev_delta));
        prev_delta = d;
    }
}

pub(crate) fn unmarshal_delta2(
    mut src: &[u8],
    first: i64,
    count: usize,
) -> StorageResult<Vec<i64>> {
    let mut out = Vec::with_capacity(count);
    if count == 0 {
        return Ok(out);
    }
    out.push(first);
    if count == 1 {
        ensure_consumed(src)?;
        return Ok(out);
    }
    let (mut delta, rest) = get_varint(src)?;
    src = rest;
    let mut v = first.wrapping_add(delta);
    out.push(v);
    for _ in 2..count {
        let (dd, rest) = get_varint(src)?;
        src = rest;
        delta = delta.wrapping_add(dd);
        v = v.wrapping_add(delta);
        out.push(v);
    }
    ensure_consumed(src)?;
    Ok(out)
}

fn ensure_consumed(src: &[u8]) -> StorageResult<()> {
    if src.is_empty() {
        Ok(())
    } else {
        Err(StorageError::Corruption(format!(
            "{} unexpected trailing bytes in column",
            src.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_edges() {
        for v in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN, 1 << 40] {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            let (got, rest) = get_varint(&buf).unwrap();
            assert_eq!(got, v);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn test_truncated_varint() {
        let mut buf = Vec::new();
        put_varuint(&mut buf, u64::MAX);
        buf.pop();
        assert!(get_varuint(&buf).is_err());
    }

    #[test]
    fn test_delta2_with_overflowing_steps() {
        let a = vec![i64::MIN, i64::MAX, 0, -5, i64::MAX];
        let mut buf = Vec::new();
        marshal_delta2(&mut buf, &a);
        assert_eq!(unmarshal_delta2(&buf, a[0], a.len()).unwrap(), a);
    }

    #[test]
    fn test_gauge_detection() {
        assert!(!is_gauge(&[1, 2, 3, 10, 20]));
        assert!(is_gauge(&[10, 9, 8, 7]));
        // A single reset to a small value looks like a counter restart
        assert!(!is_gauge(&[100, 200, 5, 10]));
        assert!(is_gauge(&[-1, 2, 3]));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = Vec::new();
        marshal_delta(&mut buf, &[1, 2, 3]);
        buf.push(0);
        assert!(unmarshal_delta(&buf, 1, 3).is_err());
    }
}
