//! The merge log: a CRC-protected record stream that makes merges
//! crash-recoverable, and the analyzer that classifies a log's final
//! state on startup.
//!
//! Record layout: `type u8 | payload | crc32 u32`, where the checksum
//! covers the type byte and the payload. A torn or corrupt tail record is
//! dropped; everything before it counts.

use crate::dts::rw;
use crate::error::{DenError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name of the merge log inside a storage group's system directory.
pub const MERGE_LOG_NAME: &str = "merge.log";

const REC_SOURCE: u8 = 1;
const REC_MERGE_START: u8 = 2;
const REC_TS_END: u8 = 3;
const REC_POSITIONS: u8 = 4;
const REC_ALL_TS_MERGED: u8 = 5;
const REC_FILE_END: u8 = 6;
const REC_MERGE_END: u8 = 7;

/// Appender for the merge log; every record is fsynced.
#[derive(Debug)]
pub struct MergeLogger {
    path: PathBuf,
    file: BufWriter<File>,
}

impl MergeLogger {
    /// Creates or reopens the merge log for appending.
    pub fn open(sys_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(sys_dir)?;
        let path = sys_dir.join(MERGE_LOG_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, record_type: u8, payload: &[u8]) -> Result<()> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[record_type]);
        hasher.update(payload);
        self.file.write_all(&[record_type])?;
        self.file.write_all(payload)?;
        self.file.write_all(&hasher.finalize().to_le_bytes())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Logs the input file sets.
    pub fn log_source(&mut self, seq: &[PathBuf], unseq: &[PathBuf]) -> Result<()> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(seq.len() as u32).to_le_bytes());
        for path in seq {
            rw::write_string(&mut payload, &path.display().to_string())?;
        }
        payload.extend_from_slice(&(unseq.len() as u32).to_le_bytes());
        for path in unseq {
            rw::write_string(&mut payload, &path.display().to_string())?;
        }
        self.append(REC_SOURCE, &payload)
    }

    /// Logs the barrier after inputs are enumerated and locked.
    pub fn log_merge_start(&mut self) -> Result<()> {
        self.append(REC_MERGE_START, &[])
    }

    /// Logs completion of one series.
    pub fn log_ts_end(&mut self, device: &str, measurement: &str) -> Result<()> {
        let mut payload = Vec::new();
        rw::write_string(&mut payload, device)?;
        rw::write_string(&mut payload, measurement)?;
        self.append(REC_TS_END, &payload)
    }

    /// Logs the current safe position of every target file.
    pub fn log_positions(&mut self, positions: &BTreeMap<PathBuf, u64>) -> Result<()> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(positions.len() as u32).to_le_bytes());
        for (path, pos) in positions {
            rw::write_string(&mut payload, &path.display().to_string())?;
            payload.extend_from_slice(&pos.to_le_bytes());
        }
        self.append(REC_POSITIONS, &payload)
    }

    /// Logs that every series has been merged.
    pub fn log_all_ts_merged(&mut self) -> Result<()> {
        self.append(REC_ALL_TS_MERGED, &[])
    }

    /// Logs that one target file has been swapped into place.
    pub fn log_file_end(&mut self, path: &Path) -> Result<()> {
        let mut payload = Vec::new();
        rw::write_string(&mut payload, &path.display().to_string())?;
        self.append(REC_FILE_END, &payload)
    }

    /// Logs merge success.
    pub fn log_merge_end(&mut self) -> Result<()> {
        self.append(REC_MERGE_END, &[])
    }
}

/// Final state of a merge log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    /// Log missing or holding no complete record.
    None,
    /// Inputs logged, not every series merged.
    MergeStart,
    /// Every series merged, file swap interrupted.
    AllTsMerged,
    /// Merge finished; only cleanup remains.
    MergeEnd,
}

/// Everything the analyzer recovered from a merge log.
#[derive(Debug)]
pub struct MergeLogState {
    /// Final status.
    pub status: MergeStatus,
    /// Sequence input paths.
    pub seq_paths: Vec<PathBuf>,
    /// Unsequence input paths.
    pub unseq_paths: Vec<PathBuf>,
    /// Series whose merge was logged complete.
    pub merged_series: BTreeSet<(String, String)>,
    /// Last safe position per target file.
    pub file_positions: BTreeMap<PathBuf, u64>,
    /// Target files already swapped into place.
    pub finished_files: BTreeSet<PathBuf>,
}

/// Classifies a merge log's final state.
pub struct LogAnalyzer;

impl LogAnalyzer {
    /// Scans the log, tolerating a torn tail record.
    pub fn analyze(log_path: &Path) -> Result<MergeLogState> {
        let mut state = MergeLogState {
            status: MergeStatus::None,
            seq_paths: Vec::new(),
            unseq_paths: Vec::new(),
            merged_series: BTreeSet::new(),
            file_positions: BTreeMap::new(),
            finished_files: BTreeSet::new(),
        };
        if !log_path.exists() {
            return Ok(state);
        }
        let mut reader = BufReader::new(File::open(log_path)?);
        loop {
            match read_record(&mut reader) {
                Ok(Some((record_type, payload))) => {
                    if let Err(e) = apply_record(&mut state, record_type, &payload) {
                        warn!("merge log record unreadable, stopping scan: {e}");
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    info!("merge log ends in a torn record, dropped");
                    break;
                }
            }
        }
        Ok(state)
    }
}

fn read_record<R: Read>(reader: &mut R) -> Result<Option<(u8, Vec<u8>)>> {
    let mut type_buf = [0u8; 1];
    match reader.read(&mut type_buf)? {
        0 => return Ok(None),
        _ => {}
    }
    let record_type = type_buf[0];
    let payload = match record_type {
        REC_MERGE_START | REC_ALL_TS_MERGED | REC_MERGE_END => Vec::new(),
        REC_SOURCE => {
            let mut payload = Vec::new();
            read_path_list(reader, &mut payload)?;
            read_path_list(reader, &mut payload)?;
            payload
        }
        REC_TS_END => {
            let mut payload = Vec::new();
            copy_string(reader, &mut payload)?;
            copy_string(reader, &mut payload)?;
            payload
        }
        REC_POSITIONS => {
            let mut payload = Vec::new();
            let count = rw::read_u32(reader)?;
            payload.extend_from_slice(&count.to_le_bytes());
            for _ in 0..count {
                copy_string(reader, &mut payload)?;
                let pos = rw::read_u64(reader)?;
                payload.extend_from_slice(&pos.to_le_bytes());
            }
            payload
        }
        REC_FILE_END => {
            let mut payload = Vec::new();
            copy_string(reader, &mut payload)?;
            payload
        }
        other => {
            return Err(DenError::Recover(format!(
                "unknown merge log record type {other}"
            )))
        }
    };

    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[record_type]);
    hasher.update(&payload);
    if hasher.finalize() != u32::from_le_bytes(crc_buf) {
        return Err(DenError::Recover("merge log record checksum mismatch".to_string()));
    }
    Ok(Some((record_type, payload)))
}

fn read_path_list<R: Read>(reader: &mut R, payload: &mut Vec<u8>) -> Result<()> {
    let count = rw::read_u32(reader)?;
    payload.extend_from_slice(&count.to_le_bytes());
    for _ in 0..count {
        copy_string(reader, payload)?;
    }
    Ok(())
}

fn copy_string<R: Read>(reader: &mut R, payload: &mut Vec<u8>) -> Result<()> {
    let len = rw::read_u32(reader)?;
    payload.extend_from_slice(&len.to_le_bytes());
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    payload.extend_from_slice(&buf);
    Ok(())
}

fn apply_record(state: &mut MergeLogState, record_type: u8, payload: &[u8]) -> Result<()> {
    let mut cursor = payload;
    match record_type {
        REC_SOURCE => {
            let seq_count = rw::read_u32(&mut cursor)?;
            for _ in 0..seq_count {
                state.seq_paths.push(PathBuf::from(rw::read_string(&mut cursor)?));
            }
            let unseq_count = rw::read_u32(&mut cursor)?;
            for _ in 0..unseq_count {
                state
                    .unseq_paths
                    .push(PathBuf::from(rw::read_string(&mut cursor)?));
            }
        }
        REC_MERGE_START => state.status = MergeStatus::MergeStart,
        REC_TS_END => {
            let device = rw::read_string(&mut cursor)?;
            let measurement = rw::read_string(&mut cursor)?;
            state.merged_series.insert((device, measurement));
        }
        REC_POSITIONS => {
            let count = rw::read_u32(&mut cursor)?;
            for _ in 0..count {
                let path = PathBuf::from(rw::read_string(&mut cursor)?);
                let pos = rw::read_u64(&mut cursor)?;
                state.file_positions.insert(path, pos);
            }
        }
        REC_ALL_TS_MERGED => state.status = MergeStatus::AllTsMerged,
        REC_FILE_END => {
            state
                .finished_files
                .insert(PathBuf::from(rw::read_string(&mut cursor)?));
        }
        REC_MERGE_END => state.status = MergeStatus::MergeEnd,
        other => {
            return Err(DenError::Recover(format!(
                "unknown merge log record type {other}"
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_or_missing_log_is_none() {
        let dir = TempDir::new().unwrap();
        let state = LogAnalyzer::analyze(&dir.path().join(MERGE_LOG_NAME)).unwrap();
        assert_eq!(state.status, MergeStatus::None);
    }

    #[test]
    fn test_full_cycle_status_progression() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join(MERGE_LOG_NAME);
        let seq = vec![PathBuf::from("/d/1-0.dts")];
        let unseq = vec![PathBuf::from("/d/2-0.dts")];

        let mut logger = MergeLogger::open(dir.path()).unwrap();
        logger.log_source(&seq, &unseq).unwrap();
        assert_eq!(
            LogAnalyzer::analyze(&log_path).unwrap().status,
            MergeStatus::None
        );

        logger.log_merge_start().unwrap();
        logger.log_ts_end("root.sg.d0", "s0").unwrap();
        logger
            .log_positions(&BTreeMap::from([(PathBuf::from("/d/1-0.dts.merge"), 99u64)]))
            .unwrap();
        let state = LogAnalyzer::analyze(&log_path).unwrap();
        assert_eq!(state.status, MergeStatus::MergeStart);
        assert_eq!(state.seq_paths, seq);
        assert_eq!(state.unseq_paths, unseq);
        assert!(state
            .merged_series
            .contains(&("root.sg.d0".to_string(), "s0".to_string())));
        assert_eq!(
            state.file_positions.get(&PathBuf::from("/d/1-0.dts.merge")),
            Some(&99)
        );

        logger.log_all_ts_merged().unwrap();
        assert_eq!(
            LogAnalyzer::analyze(&log_path).unwrap().status,
            MergeStatus::AllTsMerged
        );

        logger.log_file_end(Path::new("/d/1-0.dts")).unwrap();
        logger.log_merge_end().unwrap();
        let state = LogAnalyzer::analyze(&log_path).unwrap();
        assert_eq!(state.status, MergeStatus::MergeEnd);
        assert!(state.finished_files.contains(&PathBuf::from("/d/1-0.dts")));
    }

    #[test]
    fn test_torn_tail_record_dropped() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join(MERGE_LOG_NAME);
        let mut logger = MergeLogger::open(dir.path()).unwrap();
        logger.log_source(&[], &[]).unwrap();
        logger.log_merge_start().unwrap();
        drop(logger);

        // corrupt the tail by appending half a record
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[REC_TS_END, 3, 0]).unwrap();

        let state = LogAnalyzer::analyze(&log_path).unwrap();
        assert_eq!(state.status, MergeStatus::MergeStart);
        assert!(state.merged_series.is_empty());
    }
}
