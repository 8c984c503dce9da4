//! Per-file resource descriptor: the `.resource` side-car plus runtime
//! state (flags, modification file, write/query lock).

use crate::dts::rw;
use crate::engine::modification::{Deletion, ModificationFile, MODS_SUFFIX};
use crate::error::{DenError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

/// Suffix of the resource side-car.
pub const RESOURCE_SUFFIX: &str = ".resource";

/// Suffix of the temporary file the side-car is written through.
pub const TEMP_SUFFIX: &str = ".temp";

/// Suffix of the zero-byte flag present while a file is sealing.
pub const CLOSING_SUFFIX: &str = ".closing";

/// Builds a data file name from its version and merge count.
pub fn data_file_name(version: u64, merge_cnt: u32) -> String {
    format!("{version}-{merge_cnt}.{}", crate::dts::DTS_SUFFIX)
}

/// Parses `(version, merge_cnt)` out of a data file name.
pub fn parse_file_name(path: &Path) -> Result<(u64, u64)> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| DenError::Recover(format!("bad file name {}", path.display())))?;
    let mut parts = stem.split('-');
    let version = parts
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| DenError::Recover(format!("no version in file name {}", path.display())))?;
    let merge_cnt = parts.next().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    Ok((version, merge_cnt))
}

/// Device time bounds of one file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TimeIndex {
    /// Device -> smallest timestamp.
    pub start_times: BTreeMap<String, i64>,
    /// Device -> largest timestamp. Empty while an unsealed sequence
    /// file is still accepting writes.
    pub end_times: BTreeMap<String, i64>,
}

/// Descriptor of one data file.
///
/// Readers take the write/query lock in shared mode; flush end, close and
/// merge swap take it exclusively. The side-car on disk is immutable once
/// the file is sealed, except that the modification file grows and the
/// `merging`/`deleted` flags change.
#[derive(Debug)]
pub struct TsFileResource {
    path: PathBuf,
    time_index: RwLock<TimeIndex>,
    historical_versions: RwLock<BTreeSet<u64>>,
    closed: AtomicBool,
    deleted: AtomicBool,
    merging: AtomicBool,
    mod_file: Mutex<Option<ModificationFile>>,
    write_query_lock: Arc<RwLock<()>>,
}

impl TsFileResource {
    /// Creates the descriptor of an unsealed file.
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            time_index: RwLock::new(TimeIndex::default()),
            historical_versions: RwLock::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            merging: AtomicBool::new(false),
            mod_file: Mutex::new(None),
            write_query_lock: Arc::new(RwLock::new(())),
        }
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The shared write/query lock of this file.
    pub fn write_query_lock(&self) -> &Arc<RwLock<()>> {
        &self.write_query_lock
    }

    /// Lowers the device's start time, never raises it.
    pub fn update_start_time(&self, device: &str, time: i64) {
        let mut index = self.time_index.write();
        let entry = index.start_times.entry(device.to_string()).or_insert(i64::MAX);
        if time < *entry {
            *entry = time;
        }
    }

    /// Raises the device's end time, never lowers it.
    pub fn update_end_time(&self, device: &str, time: i64) {
        let mut index = self.time_index.write();
        let entry = index.end_times.entry(device.to_string()).or_insert(i64::MIN);
        if time > *entry {
            *entry = time;
        }
    }

    /// Overwrites the device's end time, used when sealing.
    pub fn force_update_end_time(&self, device: &str, time: i64) {
        self.time_index
            .write()
            .end_times
            .insert(device.to_string(), time);
    }

    /// Snapshot of the device time bounds.
    pub fn time_index(&self) -> TimeIndex {
        self.time_index.read().clone()
    }

    /// Replaces the device time bounds, used when a merge rewrites the
    /// file behind this descriptor.
    pub fn set_time_index(&self, index: TimeIndex) {
        *self.time_index.write() = index;
    }

    /// Start time of one device.
    pub fn start_time(&self, device: &str) -> Option<i64> {
        self.time_index.read().start_times.get(device).copied()
    }

    /// End time of one device.
    pub fn end_time(&self, device: &str) -> Option<i64> {
        self.time_index.read().end_times.get(device).copied()
    }

    /// Whether the file holds any data of the device.
    pub fn contains_device(&self, device: &str) -> bool {
        self.time_index.read().start_times.contains_key(device)
    }

    /// Devices present in the file.
    pub fn devices(&self) -> Vec<String> {
        self.time_index.read().start_times.keys().cloned().collect()
    }

    /// True iff any device's end time reaches the given bound.
    pub fn still_lives(&self, time_lower_bound: i64) -> bool {
        if time_lower_bound == i64::MAX {
            return true;
        }
        self.time_index
            .read()
            .end_times
            .values()
            .any(|end| *end >= time_lower_bound)
    }

    /// Whether the device's `[start, end]` range intersects the range.
    pub fn overlaps(&self, device: &str, range: &crate::dts::TimeRange) -> bool {
        let index = self.time_index.read();
        let Some(start) = index.start_times.get(device) else {
            return false;
        };
        // an unsealed sequence file has no end bound yet; treat it as open
        let end = index.end_times.get(device).copied().unwrap_or(i64::MAX);
        crate::dts::TimeRange::new(*start, end).overlaps(range)
    }

    /// Historical-version set: the merge lineage of this file.
    pub fn historical_versions(&self) -> BTreeSet<u64> {
        self.historical_versions.read().clone()
    }

    /// Largest historical version.
    pub fn max_version(&self) -> u64 {
        self.historical_versions
            .read()
            .iter()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    /// Replaces the historical-version set.
    pub fn set_historical_versions(&self, versions: BTreeSet<u64>) {
        *self.historical_versions.write() = versions;
    }

    /// Extends the historical-version set.
    pub fn add_historical_versions(&self, versions: impl IntoIterator<Item = u64>) {
        self.historical_versions.write().extend(versions);
    }

    /// Whether the file is sealed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the file sealed or unsealed.
    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Release);
    }

    /// Whether the file has been logically removed.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Marks the file removed.
    pub fn set_deleted(&self, deleted: bool) {
        self.deleted.store(deleted, Ordering::Release);
    }

    /// Whether the file participates in a running merge.
    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::Acquire)
    }

    /// Sets the merging flag.
    pub fn set_merging(&self, merging: bool) {
        self.merging.store(merging, Ordering::Release);
    }

    /// Runs a closure against the (lazily opened) modification file.
    pub fn with_mod_file<T>(&self, f: impl FnOnce(&mut ModificationFile) -> Result<T>) -> Result<T> {
        let mut guard = self.mod_file.lock();
        if guard.is_none() {
            *guard = Some(ModificationFile::of_data_file(&self.path)?);
        }
        f(guard.as_mut().expect("modification file just opened"))
    }

    /// Tombstones of one series, empty when no `.mods` file exists.
    pub fn deletions_for(&self, device: &str, measurement: &str) -> Vec<Deletion> {
        self.with_mod_file(|mods| Ok(mods.deletions_for(device, measurement)))
            .unwrap_or_default()
    }

    /// Size of the data file in bytes.
    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Path of the side-car.
    pub fn resource_path(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.path.display(), RESOURCE_SUFFIX))
    }

    fn closing_path(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.path.display(), CLOSING_SUFFIX))
    }

    /// Whether the side-car exists on disk.
    pub fn resource_file_exists(&self) -> bool {
        self.resource_path().exists()
    }

    /// Creates the `.closing` flag file.
    pub fn set_close_flag(&self) {
        if let Err(e) = File::create(self.closing_path()) {
            error!(path = %self.path.display(), "cannot create close flag: {e}");
        }
    }

    /// Removes the `.closing` flag file.
    pub fn clean_close_flag(&self) {
        let path = self.closing_path();
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                error!(path = %path.display(), "cannot clean close flag: {e}");
            }
        }
    }

    /// Whether the `.closing` flag is present.
    pub fn is_close_flag_set(&self) -> bool {
        self.closing_path().exists()
    }

    /// Persists the side-car through write-temp-then-rename.
    pub fn serialize(&self) -> Result<()> {
        let temp = PathBuf::from(format!(
            "{}{}{}",
            self.path.display(),
            RESOURCE_SUFFIX,
            TEMP_SUFFIX
        ));
        {
            let index = self.time_index.read();
            let versions = self.historical_versions.read();
            let mut writer = BufWriter::new(File::create(&temp)?);
            write_time_map(&mut writer, &index.start_times)?;
            write_time_map(&mut writer, &index.end_times)?;
            writer.write_all(&(versions.len() as u32).to_le_bytes())?;
            for version in versions.iter() {
                writer.write_all(&version.to_le_bytes())?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&temp, self.resource_path())?;
        Ok(())
    }

    /// Loads the side-car of a sealed file.
    ///
    /// A side-car without a trailing version set takes the version parsed
    /// from the data file's name as its singleton history.
    pub fn deserialize(path: &Path) -> Result<Self> {
        let resource = Self::new(path);
        let side_car = resource.resource_path();
        let mut reader = BufReader::new(File::open(&side_car)?);
        let start_times = read_time_map(&mut reader)?;
        let end_times = read_time_map(&mut reader)?;

        let mut versions = BTreeSet::new();
        match rw::read_u32(&mut reader) {
            Ok(count) => {
                for _ in 0..count {
                    versions.insert(rw::read_u64(&mut reader)?);
                }
            }
            Err(_) => {
                // old side-car: fall back to the file-name version
                versions.insert(parse_file_name(path)?.0);
            }
        }

        *resource.time_index.write() = TimeIndex {
            start_times,
            end_times,
        };
        *resource.historical_versions.write() = versions;
        resource.set_closed(true);
        Ok(resource)
    }

    /// Time partition of the file, from its time index or directory name.
    pub fn time_partition(&self, partition_interval_ms: i64) -> Result<i64> {
        let index = self.time_index.read();
        if let Some(start) = index.start_times.values().next() {
            return Ok(start.div_euclid(partition_interval_ms));
        }
        partition_from_path(&self.path)
    }

    /// Time partition with a cross-partition check over every device
    /// bound. Rejects externally loaded files spanning partitions.
    pub fn time_partition_with_check(&self, partition_interval_ms: i64) -> Result<i64> {
        let index = self.time_index.read();
        let mut partition = None;
        for time in index.start_times.values().chain(index.end_times.values()) {
            let p = time.div_euclid(partition_interval_ms);
            match partition {
                None => partition = Some(p),
                Some(existing) if existing != p => {
                    return Err(DenError::PartitionViolation {
                        path: self.path.clone(),
                    })
                }
                _ => {}
            }
        }
        partition.ok_or(DenError::PartitionViolation {
            path: self.path.clone(),
        })
    }

    /// Deletes the data file and both side-cars.
    pub fn remove(&self) -> Result<()> {
        self.set_deleted(true);
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let resource = self.resource_path();
        if resource.exists() {
            std::fs::remove_file(&resource)?;
        }
        let mods = PathBuf::from(format!("{}{}", self.path.display(), MODS_SUFFIX));
        if mods.exists() {
            std::fs::remove_file(&mods)?;
        }
        Ok(())
    }
}

impl PartialEq for TsFileResource {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

fn partition_from_path(path: &Path) -> Result<i64> {
    // <sg>/<partition>/<seq|unseq>/<file>
    path.parent()
        .and_then(|p| p.parent())
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse::<i64>().ok())
        .ok_or_else(|| DenError::Recover(format!("no partition in path {}", path.display())))
}

fn write_time_map<W: Write>(writer: &mut W, map: &BTreeMap<String, i64>) -> Result<()> {
    writer.write_all(&(map.len() as u32).to_le_bytes())?;
    for (device, time) in map {
        rw::write_string(writer, device)?;
        writer.write_all(&time.to_le_bytes())?;
    }
    Ok(())
}

fn read_time_map<R: Read>(reader: &mut R) -> Result<BTreeMap<String, i64>> {
    let count = rw::read_u32(reader)? as usize;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let device = rw::read_string(reader)?;
        let time = rw::read_i64(reader)?;
        map.insert(device, time);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        File::create(path).unwrap();
    }

    #[test]
    fn test_monotone_time_updates() {
        let dir = TempDir::new().unwrap();
        let resource = TsFileResource::new(&dir.path().join("3-0.dts"));

        resource.update_start_time("d0", 100);
        resource.update_start_time("d0", 200);
        assert_eq!(resource.start_time("d0"), Some(100));
        resource.update_start_time("d0", 50);
        assert_eq!(resource.start_time("d0"), Some(50));

        resource.update_end_time("d0", 100);
        resource.update_end_time("d0", 50);
        assert_eq!(resource.end_time("d0"), Some(100));
        resource.update_end_time("d0", 300);
        assert_eq!(resource.end_time("d0"), Some(300));
    }

    #[test]
    fn test_still_lives() {
        let dir = TempDir::new().unwrap();
        let resource = TsFileResource::new(&dir.path().join("3-0.dts"));
        resource.update_end_time("d0", 100);
        resource.update_end_time("d1", 500);
        assert!(resource.still_lives(500));
        assert!(resource.still_lives(i64::MIN));
        assert!(!resource.still_lives(501));
        assert!(resource.still_lives(i64::MAX));
    }

    #[test]
    fn test_serialize_deserialize_equal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("7-0.dts");
        touch(&path);

        let resource = TsFileResource::new(&path);
        resource.update_start_time("root.sg.d0", 1);
        resource.update_end_time("root.sg.d0", 99);
        resource.update_start_time("root.sg.d1", 10);
        resource.update_end_time("root.sg.d1", 20);
        resource.set_historical_versions([7].into_iter().collect());
        resource.serialize().unwrap();

        let loaded = TsFileResource::deserialize(&path).unwrap();
        assert_eq!(loaded.time_index(), resource.time_index());
        assert_eq!(loaded.historical_versions(), resource.historical_versions());
        assert!(loaded.is_closed());
        // no stray temp file
        assert!(!PathBuf::from(format!(
            "{}{}{}",
            path.display(),
            RESOURCE_SUFFIX,
            TEMP_SUFFIX
        ))
        .exists());
    }

    #[test]
    fn test_deserialize_without_version_set_uses_file_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("42-1.dts");
        touch(&path);

        // hand-write a side-car without the trailing version section
        let side_car = format!("{}{}", path.display(), RESOURCE_SUFFIX);
        let mut writer = BufWriter::new(File::create(side_car).unwrap());
        write_time_map(&mut writer, &BTreeMap::from([("d".to_string(), 5i64)])).unwrap();
        write_time_map(&mut writer, &BTreeMap::from([("d".to_string(), 9i64)])).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let loaded = TsFileResource::deserialize(&path).unwrap();
        assert_eq!(
            loaded.historical_versions(),
            [42u64].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_close_flag_lifecycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1-0.dts");
        let resource = TsFileResource::new(&path);
        assert!(!resource.is_close_flag_set());
        resource.set_close_flag();
        assert!(resource.is_close_flag_set());
        resource.clean_close_flag();
        assert!(!resource.is_close_flag_set());
    }

    #[test]
    fn test_time_partition_with_check_rejects_spanning_file() {
        let dir = TempDir::new().unwrap();
        let resource = TsFileResource::new(&dir.path().join("1-0.dts"));
        resource.update_start_time("d0", 10);
        resource.update_end_time("d0", 5000);
        assert!(matches!(
            resource.time_partition_with_check(1000),
            Err(DenError::PartitionViolation { .. })
        ));

        let resource = TsFileResource::new(&dir.path().join("2-0.dts"));
        resource.update_start_time("d0", 1000);
        resource.update_end_time("d0", 1999);
        assert_eq!(resource.time_partition_with_check(1000).unwrap(), 1);
    }

    proptest! {
        #[test]
        fn prop_side_car_roundtrip(
            devices in proptest::collection::btree_map("[a-z]{1,8}", 0i64..1000, 1..8),
            versions in proptest::collection::btree_set(0u64..100, 1..6),
        ) {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("9-0.dts");
            touch(&path);

            let resource = TsFileResource::new(&path);
            for (device, start) in &devices {
                resource.update_start_time(device, *start);
                resource.update_end_time(device, start + 10);
            }
            resource.set_historical_versions(versions);
            resource.serialize().unwrap();

            let loaded = TsFileResource::deserialize(&path).unwrap();
            prop_assert_eq!(loaded.time_index(), resource.time_index());
            prop_assert_eq!(loaded.historical_versions(), resource.historical_versions());
        }
    }
}
