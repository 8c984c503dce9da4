//! Tombstone records and the append-only `.mods` side-car.

use crate::dts::rw;
use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Suffix appended to a data file's name for its modification file.
pub const MODS_SUFFIX: &str = ".mods";

/// One tombstone: hides samples of a series at or below a timestamp.
///
/// A sample is logically deleted when `ts <= upper_bound` and the chunk
/// holding it has `version <= file_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    /// Device of the deleted series.
    pub device: String,
    /// Measurement of the deleted series.
    pub measurement: String,
    /// Chunks at or below this version are affected.
    pub file_version: u64,
    /// Samples at or below this timestamp are hidden.
    pub upper_bound: i64,
}

impl Deletion {
    /// Creates a deletion record.
    pub fn new(
        device: impl Into<String>,
        measurement: impl Into<String>,
        file_version: u64,
        upper_bound: i64,
    ) -> Self {
        Self {
            device: device.into(),
            measurement: measurement.into(),
            file_version,
            upper_bound,
        }
    }

    /// Whether the tombstone hides a sample of the given chunk version.
    pub fn hides(&self, ts: i64, chunk_version: u64) -> bool {
        ts <= self.upper_bound && chunk_version <= self.file_version
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        rw::write_string(writer, &self.device)?;
        rw::write_string(writer, &self.measurement)?;
        writer.write_all(&self.file_version.to_le_bytes())?;
        writer.write_all(&self.upper_bound.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let device = rw::read_string(reader)?;
        let measurement = rw::read_string(reader)?;
        let file_version = rw::read_u64(reader)?;
        let upper_bound = rw::read_i64(reader)?;
        Ok(Self {
            device,
            measurement,
            file_version,
            upper_bound,
        })
    }
}

/// Append-only modification file next to one data file.
///
/// Records are binary, appended and fsynced one by one; the in-memory
/// list mirrors the file.
#[derive(Debug)]
pub struct ModificationFile {
    path: PathBuf,
    deletions: Vec<Deletion>,
}

impl ModificationFile {
    /// Opens the modification file of a data file, loading existing
    /// records when the side-car is present.
    pub fn of_data_file(data_path: &Path) -> Result<Self> {
        let path = PathBuf::from(format!("{}{}", data_path.display(), MODS_SUFFIX));
        let mut deletions = Vec::new();
        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            loop {
                match Deletion::read_from(&mut reader) {
                    Ok(deletion) => deletions.push(deletion),
                    Err(_) => break,
                }
            }
        }
        Ok(Self { path, deletions })
    }

    /// Path of the `.mods` file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a tombstone and fsyncs it.
    pub fn append(&mut self, deletion: Deletion) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        deletion.write_to(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        self.deletions.push(deletion);
        Ok(())
    }

    /// All tombstones, in append order.
    pub fn deletions(&self) -> &[Deletion] {
        &self.deletions
    }

    /// Tombstones matching one series.
    pub fn deletions_for(&self, device: &str, measurement: &str) -> Vec<Deletion> {
        self.deletions
            .iter()
            .filter(|d| d.device == device && d.measurement == measurement)
            .cloned()
            .collect()
    }

    /// Whether any tombstone exists.
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
    }

    /// Deletes the side-car from disk.
    pub fn remove(&mut self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        self.deletions.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_reload() {
        let dir = TempDir::new().unwrap();
        let data_path = dir.path().join("0-0.dts");

        let mut mods = ModificationFile::of_data_file(&data_path).unwrap();
        assert!(mods.is_empty());
        mods.append(Deletion::new("root.sg.d0", "s0", 3, 150)).unwrap();
        mods.append(Deletion::new("root.sg.d0", "s1", 4, 99)).unwrap();

        let reloaded = ModificationFile::of_data_file(&data_path).unwrap();
        assert_eq!(reloaded.deletions().len(), 2);
        assert_eq!(reloaded.deletions_for("root.sg.d0", "s0").len(), 1);
        assert_eq!(reloaded.deletions_for("root.sg.d1", "s0").len(), 0);
    }

    #[test]
    fn test_hides_semantics() {
        let deletion = Deletion::new("d", "s", 5, 100);
        assert!(deletion.hides(100, 5));
        assert!(deletion.hides(1, 0));
        assert!(!deletion.hides(101, 5));
        assert!(!deletion.hides(100, 6));
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let data_path = dir.path().join("1-0.dts");
        let mut mods = ModificationFile::of_data_file(&data_path).unwrap();
        mods.append(Deletion::new("d", "s", 1, 10)).unwrap();
        assert!(mods.path().exists());
        mods.remove().unwrap();
        assert!(!mods.path().exists());
        assert!(mods.is_empty());
    }
}
