//! Monotonic file-version controller, one per storage group.
//!
//! The current value is checkpointed as an empty marker file named
//! `Version-{n}` in the storage group's system directory, renamed on each
//! checkpoint. Partitions share the counter; a version identifies a flush
//! or merge uniquely across the whole group, which keeps historical-
//! version sets comparable group-wide.

use crate::error::{DenError, Result};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

const VERSION_FILE_PREFIX: &str = "Version-";

/// Checkpoint interval in versions.
const SAVE_INTERVAL: u64 = 100;

/// Strictly increasing version source for memtables and merges.
#[derive(Debug)]
pub struct SimpleFileVersionController {
    sys_dir: PathBuf,
    state: Mutex<VersionState>,
}

#[derive(Debug)]
struct VersionState {
    curr: u64,
    checkpointed: u64,
}

impl SimpleFileVersionController {
    /// Opens or creates the controller under the given directory.
    ///
    /// After a restart the counter resumes one full checkpoint interval
    /// past the last persisted value, so versions handed out before the
    /// crash are never reused.
    pub fn open(sys_dir: &Path) -> Result<Self> {
        fs::create_dir_all(sys_dir)?;
        let mut persisted = None;
        for entry in fs::read_dir(sys_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(rest) = name.strip_prefix(VERSION_FILE_PREFIX) {
                let value: u64 = rest.parse().map_err(|_| {
                    DenError::VersionController(format!("unreadable version file {name}"))
                })?;
                persisted = Some(persisted.map_or(value, |p: u64| p.max(value)));
            }
        }

        let curr = match persisted {
            Some(value) => value + SAVE_INTERVAL,
            None => 0,
        };
        let controller = Self {
            sys_dir: sys_dir.to_path_buf(),
            state: Mutex::new(VersionState {
                curr,
                checkpointed: 0,
            }),
        };
        controller.checkpoint(curr)?;
        controller.state.lock().checkpointed = curr;
        Ok(controller)
    }

    /// Hands out the next version.
    pub fn next_version(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state.curr += 1;
        if state.curr >= state.checkpointed + SAVE_INTERVAL {
            self.checkpoint(state.curr)?;
            state.checkpointed = state.curr;
        }
        Ok(state.curr)
    }

    /// The latest handed-out version.
    pub fn curr_version(&self) -> u64 {
        self.state.lock().curr
    }

    fn checkpoint(&self, value: u64) -> Result<()> {
        let target = self.sys_dir.join(format!("{VERSION_FILE_PREFIX}{value}"));
        let mut old = None;
        for entry in fs::read_dir(&self.sys_dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .map(|n| n.starts_with(VERSION_FILE_PREFIX))
                .unwrap_or(false)
            {
                old = Some(entry.path());
            }
        }
        match old {
            Some(old_path) if old_path != target => fs::rename(old_path, target)?,
            None => {
                fs::File::create(target)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_monotonic() {
        let dir = TempDir::new().unwrap();
        let controller = SimpleFileVersionController::open(dir.path()).unwrap();
        let a = controller.next_version().unwrap();
        let b = controller.next_version().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_restart_never_reuses_versions() {
        let dir = TempDir::new().unwrap();
        let handed_out;
        {
            let controller = SimpleFileVersionController::open(dir.path()).unwrap();
            for _ in 0..7 {
                controller.next_version().unwrap();
            }
            handed_out = controller.curr_version();
        }
        let controller = SimpleFileVersionController::open(dir.path()).unwrap();
        assert!(controller.next_version().unwrap() > handed_out);
    }
}
