//! Crash recovery of in-progress merges.
//!
//! On startup the log analyzer classifies the merge log's final state;
//! recovery then resumes the merge, finishes only the file-move phase, or
//! aborts by dropping the targets and the log. Input files stay untouched
//! until the move phase, so aborting is always safe.

use crate::dts::writer::WriterConfig;
use crate::dts::DtsWriter;
use crate::engine::TsFileResource;
use crate::error::Result;
use crate::merge::log::{LogAnalyzer, MergeLogger, MergeStatus, MERGE_LOG_NAME};
use crate::merge::task::{MergeExecution, MergeOutcome, MergeTask, MERGE_SUFFIX};
use crate::merge::{MergeResource, MergeStrategy};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Recovers a merge left behind by a crash, if any.
///
/// With `continue_merge=false`, or when any logged input file no longer
/// exists, the in-progress merge is aborted: target temps are dropped and
/// the log removed, without swapping anything.
pub fn recover_merge(
    sys_dir: &Path,
    seq: &[Arc<TsFileResource>],
    unseq: &[Arc<TsFileResource>],
    continue_merge: bool,
    strategy: MergeStrategy,
    full_merge: bool,
    writer_config: WriterConfig,
) -> Result<Option<MergeOutcome>> {
    let log_path = sys_dir.join(MERGE_LOG_NAME);
    let state = LogAnalyzer::analyze(&log_path)?;

    match state.status {
        MergeStatus::None => {
            if log_path.exists() {
                std::fs::remove_file(&log_path)?;
            }
            return Ok(None);
        }
        MergeStatus::MergeEnd => {
            info!("previous merge already committed, cleaning up");
            remove_temps(state.file_positions.keys());
            std::fs::remove_file(&log_path)?;
            return Ok(None);
        }
        MergeStatus::MergeStart | MergeStatus::AllTsMerged => {}
    }

    let inputs = locate_inputs(&state.seq_paths, &state.unseq_paths, seq, unseq);
    let abort_reason = if !continue_merge {
        Some("continueMerge is off".to_string())
    } else {
        match &inputs {
            Some(_) => None,
            None => Some("some input files no longer exist".to_string()),
        }
    };
    if let Some(reason) = abort_reason {
        warn!("aborting in-progress merge: {reason}");
        let derived: Vec<PathBuf> = state
            .seq_paths
            .iter()
            .map(|p| PathBuf::from(format!("{}{}", p.display(), MERGE_SUFFIX)))
            .collect();
        remove_temps(state.file_positions.keys().chain(derived.iter()));
        std::fs::remove_file(&log_path)?;
        for resource in seq.iter().chain(unseq.iter()) {
            resource.set_merging(false);
        }
        return Ok(None);
    }
    let resource = inputs.expect("inputs located");

    let task = MergeTask {
        resource,
        sys_dir: sys_dir.to_path_buf(),
        strategy,
        full_merge,
        writer_config,
    };
    let logger = MergeLogger::open(sys_dir)?;
    let mut execution = MergeExecution::resume(task, logger)?;

    // truncate targets to their logged safe positions, then restore
    // writers over them; targets already swapped in need no writer
    let mut writers = BTreeMap::new();
    for (temp_path, final_path) in execution.target_paths() {
        if state.finished_files.contains(&final_path) {
            continue;
        }
        if let Some(logged) = state.file_positions.get(&temp_path) {
            if temp_path.exists() {
                let file = OpenOptions::new().write(true).open(&temp_path)?;
                if file.metadata()?.len() > *logged {
                    file.set_len(*logged)?;
                }
            }
        }
        let writer = if temp_path.exists() {
            DtsWriter::restore(&temp_path, writer_config)?
        } else {
            DtsWriter::create(&temp_path, writer_config)?
        };
        writers.insert(temp_path, writer);
    }
    recover_chunk_counts(&execution, &writers, &state.merged_series)?;
    execution.set_writers(writers);

    match state.status {
        MergeStatus::MergeStart => {
            // a logged series only counts when its chunks survived the
            // truncation in at least one target
            let skip: BTreeSet<(String, String)> = state
                .merged_series
                .iter()
                .filter(|(device, measurement)| {
                    execution.series_visible_in_targets(device, measurement)
                })
                .cloned()
                .collect();
            info!(
                merged = skip.len(),
                logged = state.merged_series.len(),
                "resuming merge from the first unmerged series"
            );
            execution.merge_all_series(&skip)?;
            Ok(Some(execution.finish(&state.finished_files)?))
        }
        MergeStatus::AllTsMerged => {
            info!(
                finished = state.finished_files.len(),
                "resuming interrupted file-move phase"
            );
            Ok(Some(execution.finish(&state.finished_files)?))
        }
        _ => unreachable!("handled above"),
    }
}

fn remove_temps<'a>(paths: impl Iterator<Item = &'a PathBuf>) {
    for path in paths {
        if path.extension().map(|e| e == &MERGE_SUFFIX[1..]).unwrap_or(false) && path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), "cannot remove merge temp: {e}");
            }
        }
    }
}

fn locate_inputs(
    seq_paths: &[PathBuf],
    unseq_paths: &[PathBuf],
    seq: &[Arc<TsFileResource>],
    unseq: &[Arc<TsFileResource>],
) -> Option<MergeResource> {
    let find = |paths: &[PathBuf], pool: &[Arc<TsFileResource>]| -> Option<Vec<Arc<TsFileResource>>> {
        paths
            .iter()
            .map(|path| pool.iter().find(|r| r.path() == path).cloned())
            .collect()
    };
    Some(MergeResource {
        seq_files: find(seq_paths, seq)?,
        unseq_files: find(unseq_paths, unseq)?,
    })
}

/// Rebuilds merged-vs-unmerged chunk counters by aligning each sequence
/// source's chunk metadata against its target's already-visible metadata.
fn recover_chunk_counts(
    execution: &MergeExecution,
    writers: &BTreeMap<PathBuf, DtsWriter>,
    merged_series: &BTreeSet<(String, String)>,
) -> Result<()> {
    let mut merged = 0usize;
    let mut unmerged = 0usize;
    for (seq_resource, temp_path) in execution.inplace_targets() {
        let Some(writer) = writers.get(&temp_path) else {
            continue;
        };
        for (device, measurement) in merged_series {
            let source_chunks = execution.source_chunk_metadata(&seq_resource, device, measurement)?;
            let target_chunks = writer.visible_chunk_metadata(device, measurement);
            let mut source_idx = 0;
            let mut target_idx = 0;
            while source_idx < source_chunks.len() && target_idx < target_chunks.len() {
                let source = &source_chunks[source_idx];
                let target = &target_chunks[target_idx];
                if source.start_time() < target.start_time() {
                    unmerged += 1;
                    source_idx += 1;
                } else if source.start_time() <= target.end_time() {
                    merged += 1;
                    source_idx += 1;
                } else {
                    target_idx += 1;
                }
            }
            unmerged += source_chunks.len() - source_idx;
        }
    }
    info!(merged, unmerged, "recovered chunk counters");
    Ok(())
}
