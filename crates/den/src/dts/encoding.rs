//! Column encodings for chunk pages.
//!
//! `Plain` writes fixed-width little-endian columns. `Gorilla` packs
//! timestamps with delta-of-delta encoding and double values with XOR
//! windows:
//!
//! - delta-of-delta `0`: `'0'` (1 bit); `[-63, 64]`: `'10'` + 7 bits;
//!   `[-255, 256]`: `'110'` + 9 bits; `[-2047, 2048]`: `'1110'` + 12 bits;
//!   else `'1111'` + 32 bits.
//! - value XOR `0`: `'0'`; previous window: `'10'` + meaningful bits; new
//!   window: `'11'` + 5 bits leading + 6 bits length + meaningful bits.

use crate::dts::{rw, DataType, Encoding, Timestamp, TsValue};
use crate::error::{DenError, Result};
use bitvec::prelude::*;

type Bits = BitVec<u8, Msb0>;

fn push_bits(output: &mut Bits, value: u64, width: u32) {
    for i in (0..width).rev() {
        output.push((value >> i) & 1 == 1);
    }
}

fn read_bits(data: &BitSlice<u8, Msb0>, pos: &mut usize, width: u32) -> Result<u64> {
    if *pos + width as usize > data.len() {
        return Err(DenError::ReachEndOfData);
    }
    let mut value = 0u64;
    for _ in 0..width {
        value = (value << 1) | data[*pos] as u64;
        *pos += 1;
    }
    Ok(value)
}

/// Encodes a timestamp column.
pub fn encode_times(times: &[Timestamp], encoding: Encoding) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Plain => {
            let mut out = Vec::with_capacity(times.len() * 8);
            for ts in times {
                out.extend_from_slice(&ts.to_le_bytes());
            }
            Ok(out)
        }
        Encoding::Gorilla => {
            let mut bits = Bits::new();
            let mut encoder = DeltaOfDeltaEncoder::new();
            for ts in times {
                encoder.encode(*ts, &mut bits);
            }
            Ok(bits.into_vec())
        }
    }
}

/// Decodes a timestamp column of `count` entries.
pub fn decode_times(bytes: &[u8], count: usize, encoding: Encoding) -> Result<Vec<Timestamp>> {
    match encoding {
        Encoding::Plain => {
            let mut reader = bytes;
            (0..count).map(|_| rw::read_i64(&mut reader)).collect()
        }
        Encoding::Gorilla => {
            let bits = Bits::from_vec(bytes.to_vec());
            let mut decoder = DeltaOfDeltaDecoder::new(&bits);
            (0..count).map(|_| decoder.decode_next()).collect()
        }
    }
}

/// Encodes a value column.
pub fn encode_values(values: &[TsValue], encoding: Encoding) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Plain => {
            let mut out = Vec::new();
            for value in values {
                value.write_plain(&mut out)?;
            }
            Ok(out)
        }
        Encoding::Gorilla => {
            let mut bits = Bits::new();
            let mut encoder = XorEncoder::new();
            for value in values {
                match value {
                    TsValue::Double(v) => encoder.encode(*v, &mut bits),
                    other => {
                        return Err(DenError::Encoding(format!(
                            "gorilla encoding requires Double, got {:?}",
                            other.data_type()
                        )))
                    }
                }
            }
            Ok(bits.into_vec())
        }
    }
}

/// Decodes a value column of `count` entries.
pub fn decode_values(
    bytes: &[u8],
    count: usize,
    data_type: DataType,
    encoding: Encoding,
) -> Result<Vec<TsValue>> {
    match encoding {
        Encoding::Plain => {
            let mut reader = bytes;
            (0..count)
                .map(|_| TsValue::read_plain(&mut reader, data_type))
                .collect()
        }
        Encoding::Gorilla => {
            if data_type != DataType::Double {
                return Err(DenError::Encoding(format!(
                    "gorilla decoding requires Double, got {data_type:?}"
                )));
            }
            let bits = Bits::from_vec(bytes.to_vec());
            let mut decoder = XorDecoder::new(&bits);
            (0..count)
                .map(|_| decoder.decode_next().map(TsValue::Double))
                .collect()
        }
    }
}

/// Delta-of-delta encoder for timestamps.
struct DeltaOfDeltaEncoder {
    first: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl DeltaOfDeltaEncoder {
    fn new() -> Self {
        Self {
            first: true,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    fn encode(&mut self, ts: i64, output: &mut Bits) {
        if self.first {
            self.first = false;
            self.prev_ts = ts;
            self.prev_delta = 0;
            push_bits(output, ts as u64, 64);
            return;
        }

        let delta = ts - self.prev_ts;
        let dod = delta - self.prev_delta;

        if dod == 0 {
            output.push(false);
        } else if (-63..=64).contains(&dod) {
            push_bits(output, 0b10, 2);
            push_bits(output, (dod + 63) as u64, 7);
        } else if (-255..=256).contains(&dod) {
            push_bits(output, 0b110, 3);
            push_bits(output, (dod + 255) as u64, 9);
        } else if (-2047..=2048).contains(&dod) {
            push_bits(output, 0b1110, 4);
            push_bits(output, (dod + 2047) as u64, 12);
        } else {
            push_bits(output, 0b1111, 4);
            push_bits(output, dod as i32 as u32 as u64, 32);
        }

        self.prev_delta = delta;
        self.prev_ts = ts;
    }
}

/// Delta-of-delta decoder for timestamps.
struct DeltaOfDeltaDecoder<'a> {
    data: &'a BitSlice<u8, Msb0>,
    pos: usize,
    first: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl<'a> DeltaOfDeltaDecoder<'a> {
    fn new(data: &'a Bits) -> Self {
        Self {
            data,
            pos: 0,
            first: true,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    fn decode_next(&mut self) -> Result<i64> {
        if self.first {
            self.first = false;
            let ts = read_bits(self.data, &mut self.pos, 64)? as i64;
            self.prev_ts = ts;
            self.prev_delta = 0;
            return Ok(ts);
        }

        let dod = if read_bits(self.data, &mut self.pos, 1)? == 0 {
            0
        } else if read_bits(self.data, &mut self.pos, 1)? == 0 {
            read_bits(self.data, &mut self.pos, 7)? as i64 - 63
        } else if read_bits(self.data, &mut self.pos, 1)? == 0 {
            read_bits(self.data, &mut self.pos, 9)? as i64 - 255
        } else if read_bits(self.data, &mut self.pos, 1)? == 0 {
            read_bits(self.data, &mut self.pos, 12)? as i64 - 2047
        } else {
            read_bits(self.data, &mut self.pos, 32)? as u32 as i32 as i64
        };

        let delta = self.prev_delta + dod;
        let ts = self.prev_ts + delta;
        self.prev_delta = delta;
        self.prev_ts = ts;
        Ok(ts)
    }
}

/// XOR window encoder for double values.
struct XorEncoder {
    first: bool,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl XorEncoder {
    fn new() -> Self {
        Self {
            first: true,
            prev_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn encode(&mut self, value: f64, output: &mut Bits) {
        let bits = value.to_bits();
        if self.first {
            self.first = false;
            self.prev_bits = bits;
            push_bits(output, bits, 64);
            return;
        }

        let xor = bits ^ self.prev_bits;
        if xor == 0 {
            output.push(false);
        } else {
            // leading is capped at 31 so it fits the 5-bit field
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();

            if leading >= self.prev_leading && trailing >= self.prev_trailing {
                push_bits(output, 0b10, 2);
                let meaningful = 64 - self.prev_leading - self.prev_trailing;
                push_bits(output, xor >> self.prev_trailing, meaningful);
            } else {
                push_bits(output, 0b11, 2);
                push_bits(output, leading as u64, 5);
                let meaningful = 64 - leading - trailing;
                push_bits(output, (meaningful - 1) as u64, 6);
                push_bits(output, xor >> trailing, meaningful);
                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }
        self.prev_bits = bits;
    }
}

/// XOR window decoder for double values.
struct XorDecoder<'a> {
    data: &'a BitSlice<u8, Msb0>,
    pos: usize,
    first: bool,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> XorDecoder<'a> {
    fn new(data: &'a Bits) -> Self {
        Self {
            data,
            pos: 0,
            first: true,
            prev_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn decode_next(&mut self) -> Result<f64> {
        if self.first {
            self.first = false;
            let bits = read_bits(self.data, &mut self.pos, 64)?;
            self.prev_bits = bits;
            return Ok(f64::from_bits(bits));
        }

        let xor = if read_bits(self.data, &mut self.pos, 1)? == 0 {
            0
        } else if read_bits(self.data, &mut self.pos, 1)? == 0 {
            let meaningful = 64 - self.prev_leading - self.prev_trailing;
            read_bits(self.data, &mut self.pos, meaningful)? << self.prev_trailing
        } else {
            let leading = read_bits(self.data, &mut self.pos, 5)? as u32;
            let meaningful = read_bits(self.data, &mut self.pos, 6)? as u32 + 1;
            let trailing = 64 - leading - meaningful;
            self.prev_leading = leading;
            self.prev_trailing = trailing;
            read_bits(self.data, &mut self.pos, meaningful)? << trailing
        };

        let bits = self.prev_bits ^ xor;
        self.prev_bits = bits;
        Ok(f64::from_bits(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_roundtrip() {
        let times = vec![1, 5, 1000, -3];
        let values = vec![
            TsValue::Int32(1),
            TsValue::Int32(2),
            TsValue::Int32(3),
            TsValue::Int32(4),
        ];

        let tb = encode_times(&times, Encoding::Plain).unwrap();
        let vb = encode_values(&values, Encoding::Plain).unwrap();
        assert_eq!(decode_times(&tb, 4, Encoding::Plain).unwrap(), times);
        assert_eq!(
            decode_values(&vb, 4, DataType::Int32, Encoding::Plain).unwrap(),
            values
        );
    }

    #[test]
    fn test_gorilla_roundtrip() {
        let times: Vec<i64> = (0..200).map(|i| 1_000_000 + i * 10 + (i % 7)).collect();
        let values: Vec<TsValue> = (0..200)
            .map(|i| TsValue::Double(20.0 + (i as f64) * 0.25))
            .collect();

        let tb = encode_times(&times, Encoding::Gorilla).unwrap();
        let vb = encode_values(&values, Encoding::Gorilla).unwrap();

        // delta-of-delta should be far smaller than 8 bytes per entry
        assert!(tb.len() < times.len() * 8);

        assert_eq!(decode_times(&tb, 200, Encoding::Gorilla).unwrap(), times);
        assert_eq!(
            decode_values(&vb, 200, DataType::Double, Encoding::Gorilla).unwrap(),
            values
        );
    }

    #[test]
    fn test_gorilla_irregular_deltas() {
        let times = vec![0, 1, 100_000, 100_001, -5_000_000, 7];
        let tb = encode_times(&times, Encoding::Gorilla).unwrap();
        assert_eq!(decode_times(&tb, 6, Encoding::Gorilla).unwrap(), times);
    }

    #[test]
    fn test_gorilla_rejects_non_double() {
        let err = encode_values(&[TsValue::Int32(1)], Encoding::Gorilla);
        assert!(err.is_err());
    }
}
