use nacre_common::Timestamp;

use crate::error::StoreError;

/// Worst-case size of one encoded data point: a 10-byte timestamp
/// varint, the value control byte and 8 value bytes.
pub const MAX_POINT_SIZE: usize = 19;

/// Append-only codec for a leaf's `(timestamp, value)` stream.
///
/// Timestamps are stored as LEB128 deltas against the previous point.
/// Values are XORed with the previous value; the surviving bits are
/// stored as `(trailing_zero_bytes << 4) | significant_bytes` followed
/// by the significant bytes, low byte first.
#[derive(Debug)]
pub struct DataBlockWriter {
    buf: Vec<u8>,
    capacity: usize,
    prev_ts: Timestamp,
    prev_bits: u64,
    count: u32,
}

impl DataBlockWriter {
    pub fn new(capacity: usize) -> Self {
        DataBlockWriter {
            buf: Vec::with_capacity(capacity),
            capacity,
            prev_ts: 0,
            prev_bits: 0,
            count: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    /// Append one point. Timestamps must be non-decreasing; ordering is
    /// enforced by the tree, not here.
    pub fn append(&mut self, ts: Timestamp, value: f64) -> Result<(), StoreError> {
        if self.buf.len() + MAX_POINT_SIZE > self.capacity {
            return Err(StoreError::Overflow);
        }
        debug_assert!(ts >= self.prev_ts);
        encode_varint(&mut self.buf, ts - self.prev_ts);
        let bits = value.to_bits();
        encode_xor(&mut self.buf, bits ^ self.prev_bits);
        self.prev_ts = ts;
        self.prev_bits = bits;
        self.count += 1;
        Ok(())
    }
}

/// Streaming decoder matching [`DataBlockWriter`].
#[derive(Debug)]
pub struct DataBlockReader<'a> {
    buf: &'a [u8],
    pos: usize,
    prev_ts: Timestamp,
    prev_bits: u64,
    remaining: u32,
}

impl<'a> DataBlockReader<'a> {
    pub fn new(buf: &'a [u8], count: u32) -> Self {
        DataBlockReader {
            buf,
            pos: 0,
            prev_ts: 0,
            prev_bits: 0,
            remaining: count,
        }
    }

    pub fn next_point(&mut self) -> Result<Option<(Timestamp, f64)>, StoreError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let delta = decode_varint(self.buf, &mut self.pos)?;
        let xor = decode_xor(self.buf, &mut self.pos)?;
        self.prev_ts = self
            .prev_ts
            .checked_add(delta)
            .ok_or_else(|| StoreError::BadData("timestamp delta overflow".into()))?;
        self.prev_bits ^= xor;
        self.remaining -= 1;
        Ok(Some((self.prev_ts, f64::from_bits(self.prev_bits))))
    }

    /// Decode the whole stream into parallel vectors.
    pub fn read_all(mut self) -> Result<(Vec<Timestamp>, Vec<f64>), StoreError> {
        let mut ts = Vec::with_capacity(self.remaining as usize);
        let mut xs = Vec::with_capacity(self.remaining as usize);
        while let Some((t, x)) = self.next_point()? {
            ts.push(t);
            xs.push(x);
        }
        Ok((ts, xs))
    }
}

fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn decode_varint(buf: &[u8], pos: &mut usize) -> Result<u64, StoreError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| StoreError::BadData("truncated varint".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(StoreError::BadData("oversized varint".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn encode_xor(buf: &mut Vec<u8>, xor: u64) {
    if xor == 0 {
        buf.push(0);
        return;
    }
    let trailing = (xor.trailing_zeros() / 8) as u8;
    let shifted = xor >> (trailing * 8);
    let nbytes = (8 - shifted.leading_zeros() / 8) as u8;
    buf.push((trailing << 4) | nbytes);
    buf.extend_from_slice(&shifted.to_le_bytes()[..nbytes as usize]);
}

fn decode_xor(buf: &[u8], pos: &mut usize) -> Result<u64, StoreError> {
    let control = *buf
        .get(*pos)
        .ok_or_else(|| StoreError::BadData("truncated value".into()))?;
    *pos += 1;
    let trailing = control >> 4;
    let nbytes = (control & 0x0f) as usize;
    if nbytes == 0 {
        return Ok(0);
    }
    if nbytes > 8 || trailing > 7 {
        return Err(StoreError::BadData("bad value control byte".into()));
    }
    let slice = buf
        .get(*pos..*pos + nbytes)
        .ok_or_else(|| StoreError::BadData("truncated value bytes".into()))?;
    *pos += nbytes;
    let mut le = [0u8; 8];
    le[..nbytes].copy_from_slice(slice);
    Ok(u64::from_le_bytes(le) << (trailing * 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_monotonic_series() {
        let mut writer = DataBlockWriter::new(4096);
        let points: Vec<(u64, f64)> = (0..200u64).map(|i| (1000 + i * 3, i as f64 * 0.1)).collect();
        for (ts, x) in &points {
            writer.append(*ts, *x).expect("append");
        }
        assert_eq!(writer.count(), 200);
        let reader = DataBlockReader::new(writer.payload(), writer.count());
        let (ts, xs) = reader.read_all().expect("decode");
        assert_eq!(ts, points.iter().map(|p| p.0).collect::<Vec<_>>());
        assert_eq!(xs, points.iter().map(|p| p.1).collect::<Vec<_>>());
    }

    #[test]
    fn round_trip_irregular_values() {
        let mut writer = DataBlockWriter::new(4096);
        let points = [
            (1u64, 0.0),
            (1, -0.0),
            (5, f64::MAX),
            (5, f64::MIN_POSITIVE),
            (1_000_000_007, 42.125),
            (u64::MAX / 2, -1e300),
        ];
        for (ts, x) in points {
            writer.append(ts, x).expect("append");
        }
        let reader = DataBlockReader::new(writer.payload(), writer.count());
        let (ts, xs) = reader.read_all().expect("decode");
        for (ix, (t, x)) in points.iter().enumerate() {
            assert_eq!(ts[ix], *t);
            assert_eq!(xs[ix].to_bits(), x.to_bits());
        }
    }

    #[test]
    fn writer_overflows_when_full() {
        let mut writer = DataBlockWriter::new(64);
        let mut appended = 0u64;
        loop {
            match writer.append(appended, appended as f64) {
                Ok(()) => appended += 1,
                Err(StoreError::Overflow) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(appended > 0);
        assert_eq!(writer.count() as u64, appended);
        // Still decodable after overflow.
        let reader = DataBlockReader::new(writer.payload(), writer.count());
        let (ts, _) = reader.read_all().expect("decode");
        assert_eq!(ts.len() as u64, appended);
    }

    #[test]
    fn repeated_values_encode_to_single_bytes() {
        let mut writer = DataBlockWriter::new(4096);
        for i in 0..100u64 {
            writer.append(i, 2.5).expect("append");
        }
        // delta=1 (or 0) varint + zero-xor control byte per point after
        // the first one.
        assert!(writer.size() < 100 * 4);
    }
}
