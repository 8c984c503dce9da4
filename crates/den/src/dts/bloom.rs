//! Bloom filter over `device.measurement` paths.
//!
//! Sized from an expected path count and a target false-positive rate,
//! hashed with xxh64 under seed-indexed hash functions:
//! `h_i(x) = xxh64(x, seed = i) % size_bits`.

use crate::dts::rw;
use crate::error::Result;
use std::io::{Read, Write};

/// Minimum bit capacity, so tiny files still get a usable filter.
const MIN_BITS: usize = 256;

/// Upper cap on hash function count.
const MAX_HASH_COUNT: u32 = 8;

/// Bloom filter for fast path-existence checks.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    hash_count: u32,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_paths` entries at the given
    /// false-positive rate.
    pub fn new(expected_paths: usize, error_rate: f64) -> Self {
        let error_rate = error_rate.clamp(1e-6, 0.5);
        let n = expected_paths.max(1) as f64;
        // m = -n ln p / (ln 2)^2, k = (m / n) ln 2
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * error_rate.ln() / (ln2 * ln2)).ceil() as usize;
        let num_bits = m.max(MIN_BITS);
        let hash_count = (((num_bits as f64 / n) * ln2).round() as u32).clamp(1, MAX_HASH_COUNT);
        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            num_bits: num_bits as u64,
            hash_count,
        }
    }

    /// Adds a path to the filter.
    pub fn insert(&mut self, path: &str) {
        for seed in 0..self.hash_count {
            let bit = xxhash_rust::xxh64::xxh64(path.as_bytes(), seed as u64) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    /// Returns false when the path is definitely absent.
    pub fn maybe_contains(&self, path: &str) -> bool {
        for seed in 0..self.hash_count {
            let bit = xxhash_rust::xxh64::xxh64(path.as_bytes(), seed as u64) % self.num_bits;
            if self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Writes the filter.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.num_bits.to_le_bytes())?;
        writer.write_all(&self.hash_count.to_le_bytes())?;
        writer.write_all(&(self.bits.len() as u32).to_le_bytes())?;
        for word in &self.bits {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a filter.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let num_bits = rw::read_u64(reader)?;
        let hash_count = rw::read_u32(reader)?;
        let num_words = rw::read_u32(reader)? as usize;
        let mut bits = Vec::with_capacity(num_words);
        for _ in 0..num_words {
            bits.push(rw::read_u64(reader)?);
        }
        Ok(Self {
            bits,
            num_bits,
            hash_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(100, 0.05);
        let paths: Vec<String> = (0..100).map(|i| format!("root.sg.d{}.s{}", i % 10, i)).collect();
        for path in &paths {
            filter.insert(path);
        }
        for path in &paths {
            assert!(filter.maybe_contains(path));
        }
    }

    #[test]
    fn test_absent_paths_mostly_rejected() {
        let mut filter = BloomFilter::new(200, 0.01);
        for i in 0..200 {
            filter.insert(&format!("root.sg.d0.s{i}"));
        }
        let false_positives = (0..1000)
            .filter(|i| filter.maybe_contains(&format!("root.other.d9.x{i}")))
            .count();
        // 1% target rate, allow generous slack
        assert!(false_positives < 100, "false positives: {false_positives}");
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut filter = BloomFilter::new(10, 0.05);
        filter.insert("root.sg.d0.s0");
        let mut buf = Vec::new();
        filter.write_to(&mut buf).unwrap();
        let decoded = BloomFilter::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, filter);
        assert!(decoded.maybe_contains("root.sg.d0.s0"));
    }
}
