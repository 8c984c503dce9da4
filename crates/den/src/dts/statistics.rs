//! Per-chunk and per-page statistics.

use crate::dts::{rw, Timestamp, TsValue};
use crate::error::Result;
use std::io::{Read, Write};

/// Statistics over one run of samples.
///
/// Every chunk and page carries one; chunk statistics are the merge of its
/// page statistics. The time bounds drive filter-based chunk skipping, the
/// numeric bounds exist for numeric columns only.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    /// Number of samples.
    pub count: u64,
    /// Smallest timestamp, `i64::MAX` while empty.
    pub start_time: Timestamp,
    /// Largest timestamp, `i64::MIN` while empty.
    pub end_time: Timestamp,
    /// Smallest numeric value, when the column is numeric.
    pub min_value: Option<f64>,
    /// Largest numeric value, when the column is numeric.
    pub max_value: Option<f64>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    /// Creates empty statistics.
    pub fn new() -> Self {
        Self {
            count: 0,
            start_time: i64::MAX,
            end_time: i64::MIN,
            min_value: None,
            max_value: None,
        }
    }

    /// Folds one sample into the statistics.
    pub fn update(&mut self, ts: Timestamp, value: &TsValue) {
        self.count += 1;
        self.start_time = self.start_time.min(ts);
        self.end_time = self.end_time.max(ts);
        if let Some(v) = value.as_f64() {
            self.min_value = Some(self.min_value.map_or(v, |m| m.min(v)));
            self.max_value = Some(self.max_value.map_or(v, |m| m.max(v)));
        }
    }

    /// Merges another statistics object into this one.
    pub fn merge(&mut self, other: &Statistics) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);
        match (self.min_value, other.min_value) {
            (Some(a), Some(b)) => self.min_value = Some(a.min(b)),
            (None, Some(b)) => self.min_value = Some(b),
            _ => {}
        }
        match (self.max_value, other.max_value) {
            (Some(a), Some(b)) => self.max_value = Some(a.max(b)),
            (None, Some(b)) => self.max_value = Some(b),
            _ => {}
        }
    }

    /// Writes the statistics.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.count.to_le_bytes())?;
        writer.write_all(&self.start_time.to_le_bytes())?;
        writer.write_all(&self.end_time.to_le_bytes())?;
        match (self.min_value, self.max_value) {
            (Some(min), Some(max)) => {
                writer.write_all(&[1u8])?;
                writer.write_all(&min.to_bits().to_le_bytes())?;
                writer.write_all(&max.to_bits().to_le_bytes())?;
            }
            _ => writer.write_all(&[0u8])?,
        }
        Ok(())
    }

    /// Reads statistics.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let count = rw::read_u64(reader)?;
        let start_time = rw::read_i64(reader)?;
        let end_time = rw::read_i64(reader)?;
        let (min_value, max_value) = if rw::read_u8(reader)? == 1 {
            (Some(rw::read_f64(reader)?), Some(rw::read_f64(reader)?))
        } else {
            (None, None)
        };
        Ok(Self {
            count,
            start_time,
            end_time,
            min_value,
            max_value,
        })
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        8 + 8 + 8 + 1 + if self.min_value.is_some() { 16 } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_merge() {
        let mut a = Statistics::new();
        a.update(10, &TsValue::Int32(5));
        a.update(20, &TsValue::Int32(-3));

        let mut b = Statistics::new();
        b.update(5, &TsValue::Int32(7));

        a.merge(&b);
        assert_eq!(a.count, 3);
        assert_eq!(a.start_time, 5);
        assert_eq!(a.end_time, 20);
        assert_eq!(a.min_value, Some(-3.0));
        assert_eq!(a.max_value, Some(7.0));
    }

    #[test]
    fn test_roundtrip_text_column() {
        let mut stats = Statistics::new();
        stats.update(1, &TsValue::Text("x".to_string()));
        stats.update(9, &TsValue::Text("y".to_string()));

        let mut buf = Vec::new();
        stats.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), stats.serialized_size());

        let decoded = Statistics::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, stats);
        assert_eq!(decoded.min_value, None);
    }
}
