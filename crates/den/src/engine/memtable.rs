//! In-memory buffer backing one unsealed file.

use crate::dts::{DataType, Timestamp, TsValue};
use crate::engine::MeasurementSchema;
use std::collections::BTreeMap;

/// One writable series inside a memtable.
#[derive(Debug, Clone)]
pub struct WritableSeries {
    /// Schema of the series.
    pub schema: MeasurementSchema,
    /// Samples sorted by timestamp; a duplicate timestamp overwrites, so
    /// the newest write wins.
    pub points: BTreeMap<Timestamp, TsValue>,
}

/// In-memory buffer of one unsealed file.
///
/// Carries the flush version assigned by the storage group's version
/// controller; the flushed chunks inherit it through the file's version
/// record.
#[derive(Debug)]
pub struct MemTable {
    version: u64,
    devices: BTreeMap<String, BTreeMap<String, WritableSeries>>,
    memory_bytes: usize,
}

impl MemTable {
    /// Creates an empty memtable with its flush version.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            devices: BTreeMap::new(),
            memory_bytes: 0,
        }
    }

    /// The flush version of this memtable.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether the memtable holds no samples.
    pub fn is_empty(&self) -> bool {
        self.devices.values().all(|m| m.values().all(|s| s.points.is_empty()))
    }

    /// Estimated heap size in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory_bytes
    }

    /// Writes one sample.
    pub fn write(&mut self, device: &str, ts: Timestamp, schema: &MeasurementSchema, value: TsValue) {
        let series = self
            .devices
            .entry(device.to_string())
            .or_default()
            .entry(schema.measurement.clone())
            .or_insert_with(|| WritableSeries {
                schema: schema.clone(),
                points: BTreeMap::new(),
            });
        self.memory_bytes += 8 + value.estimated_size();
        series.points.insert(ts, value);
    }

    /// Drops all samples of the series at or below the bound.
    pub fn delete(&mut self, device: &str, measurement: &str, upper_bound: Timestamp) {
        if let Some(series) = self
            .devices
            .get_mut(device)
            .and_then(|m| m.get_mut(measurement))
        {
            if upper_bound == i64::MAX {
                series.points.clear();
            } else {
                series.points = series.points.split_off(&(upper_bound + 1));
            }
        }
    }

    /// Devices with data, sorted.
    pub fn devices(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Series of one device, sorted by measurement.
    pub fn series_of(&self, device: &str) -> Vec<(&str, &WritableSeries)> {
        self.devices
            .get(device)
            .map(|m| m.iter().map(|(k, v)| (k.as_str(), v)).collect())
            .unwrap_or_default()
    }

    /// Largest timestamp written for the device.
    pub fn max_time(&self, device: &str) -> Option<Timestamp> {
        self.devices.get(device).and_then(|m| {
            m.values()
                .filter_map(|s| s.points.keys().next_back())
                .max()
                .copied()
        })
    }

    /// Smallest timestamp written for the device.
    pub fn min_time(&self, device: &str) -> Option<Timestamp> {
        self.devices.get(device).and_then(|m| {
            m.values()
                .filter_map(|s| s.points.keys().next())
                .min()
                .copied()
        })
    }

    /// Read-only snapshot of one series, or `None` when absent or empty.
    pub fn snapshot(&self, device: &str, measurement: &str) -> Option<ReadOnlyMemChunk> {
        let series = self.devices.get(device)?.get(measurement)?;
        if series.points.is_empty() {
            return None;
        }
        Some(ReadOnlyMemChunk {
            data_type: series.schema.data_type,
            version: self.version,
            samples: series
                .points
                .iter()
                .map(|(ts, value)| (*ts, value.clone()))
                .collect(),
        })
    }
}

/// Immutable view of one series of a memtable, handed to queries.
#[derive(Debug, Clone)]
pub struct ReadOnlyMemChunk {
    /// Column data type.
    pub data_type: DataType,
    /// Version of the owning memtable, used for newer-wins merging.
    pub version: u64,
    /// Samples sorted by timestamp.
    pub samples: Vec<(Timestamp, TsValue)>,
}

impl ReadOnlyMemChunk {
    /// Drops samples hidden by the tombstones.
    pub fn apply_deletions(&mut self, deletions: &[crate::engine::Deletion]) {
        if deletions.is_empty() {
            return;
        }
        self.samples
            .retain(|(ts, _)| !deletions.iter().any(|d| d.hides(*ts, self.version)));
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time range of the snapshot.
    pub fn time_range(&self) -> Option<crate::dts::TimeRange> {
        match (self.samples.first(), self.samples.last()) {
            (Some((start, _)), Some((end, _))) => Some(crate::dts::TimeRange::new(*start, *end)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Deletion;

    fn schema(measurement: &str) -> MeasurementSchema {
        MeasurementSchema::new(measurement, DataType::Int64)
    }

    fn write(memtable: &mut MemTable, device: &str, ts: i64, value: i64) {
        memtable.write(device, ts, &schema("s0"), TsValue::Int64(value));
    }

    #[test]
    fn test_write_and_snapshot_sorted() {
        let mut memtable = MemTable::new(1);
        write(&mut memtable, "d0", 30, 3);
        write(&mut memtable, "d0", 10, 1);
        write(&mut memtable, "d0", 20, 2);

        let snapshot = memtable.snapshot("d0", "s0").unwrap();
        let times: Vec<i64> = snapshot.samples.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(times, vec![10, 20, 30]);
        assert_eq!(snapshot.version, 1);
    }

    #[test]
    fn test_duplicate_timestamp_newest_wins() {
        let mut memtable = MemTable::new(1);
        write(&mut memtable, "d0", 10, 1);
        write(&mut memtable, "d0", 10, 2);
        let snapshot = memtable.snapshot("d0", "s0").unwrap();
        assert_eq!(snapshot.samples, vec![(10, TsValue::Int64(2))]);
    }

    #[test]
    fn test_delete_upper_bound_inclusive() {
        let mut memtable = MemTable::new(1);
        for ts in 11..=20 {
            write(&mut memtable, "d0", ts, ts);
        }
        memtable.delete("d0", "s0", 15);
        let snapshot = memtable.snapshot("d0", "s0").unwrap();
        let times: Vec<i64> = snapshot.samples.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(times, vec![16, 17, 18, 19, 20]);
    }

    #[test]
    fn test_max_min_time() {
        let mut memtable = MemTable::new(1);
        assert_eq!(memtable.max_time("d0"), None);
        write(&mut memtable, "d0", 5, 0);
        write(&mut memtable, "d0", 50, 0);
        memtable.write("d0", 70, &schema("s1"), TsValue::Int64(0));
        assert_eq!(memtable.max_time("d0"), Some(70));
        assert_eq!(memtable.min_time("d0"), Some(5));
    }

    #[test]
    fn test_snapshot_applies_tombstones_by_version() {
        let mut memtable = MemTable::new(5);
        for ts in 1..=10 {
            write(&mut memtable, "d0", ts, ts);
        }
        let mut snapshot = memtable.snapshot("d0", "s0").unwrap();
        // tombstone versioned below the memtable leaves it intact
        snapshot.apply_deletions(&[Deletion::new("d0", "s0", 4, 100)]);
        assert_eq!(snapshot.samples.len(), 10);
        snapshot.apply_deletions(&[Deletion::new("d0", "s0", 5, 7)]);
        let times: Vec<i64> = snapshot.samples.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(times, vec![8, 9, 10]);
    }
}
