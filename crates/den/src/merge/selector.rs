//! Merge file selection under a memory budget.
//!
//! All selectors share one protocol: filter candidates by TTL, then
//! greedily pick an overlapping (seq subset, unseq subset) whose
//! estimated in-merge memory cost fits the budget, first with the cheap
//! loose bound, and when nothing fits, once more with the tight bound
//! computed from actual chunk sizes. The strategies differ only in their
//! objective: the max-file selectors order candidates by version to take
//! as many files as possible; the size-based independence selector orders
//! by file size to minimize write amplification.

use crate::dts::DtsReader;
use crate::engine::TsFileResource;
use crate::error::Result;
use crate::merge::{MergeResource, MergeStrategy};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Safety factor over raw byte estimates for per-chunk buffers and
/// decode overhead.
const MERGE_OVERHEAD_FACTOR: usize = 2;

/// Selects merge inputs for one storage group.
pub fn select_files(
    strategy: MergeStrategy,
    seq: &[Arc<TsFileResource>],
    unseq: &[Arc<TsFileResource>],
    memory_budget: usize,
    time_lower_bound: i64,
    partition_interval_ms: i64,
) -> Result<MergeResource> {
    let seq: Vec<Arc<TsFileResource>> = seq
        .iter()
        .filter(|r| eligible(r, time_lower_bound))
        .cloned()
        .collect();
    let mut unseq: Vec<Arc<TsFileResource>> = unseq
        .iter()
        .filter(|r| eligible(r, time_lower_bound))
        .cloned()
        .collect();

    if unseq.is_empty() {
        return Ok(MergeResource::default());
    }
    info!(
        seq = seq.len(),
        unseq = unseq.len(),
        "selecting merge candidates"
    );

    // files never cross partitions, so a merge never does either; pick
    // the partition with the most unsequence candidates
    let partition = busiest_partition(&unseq, partition_interval_ms)?;
    let seq: Vec<_> = seq
        .iter()
        .filter(|r| r.time_partition(partition_interval_ms).ok() == Some(partition))
        .cloned()
        .collect();
    unseq.retain(|r| r.time_partition(partition_interval_ms).ok() == Some(partition));

    let mut seq = seq;
    seq.sort_by_key(file_order);
    match strategy {
        MergeStrategy::Inplace | MergeStrategy::Squeeze => {
            unseq.sort_by_key(file_order);
        }
        MergeStrategy::IndependenceSize => {
            unseq.sort_by_key(|r| r.file_size());
        }
    }

    let mut selected = greedy_select(strategy, &seq, &unseq, memory_budget, false)?;
    if selected.unseq_files.is_empty() {
        selected = greedy_select(strategy, &seq, &unseq, memory_budget, true)?;
    }
    if selected.unseq_files.is_empty() {
        info!("no merge candidates fit the memory budget");
    } else {
        info!(
            seq = selected.seq_files.len(),
            unseq = selected.unseq_files.len(),
            "selected merge candidates"
        );
    }
    Ok(selected)
}

fn file_order(resource: &Arc<TsFileResource>) -> (u64, u64) {
    crate::engine::resource::parse_file_name(resource.path()).unwrap_or((0, 0))
}

fn eligible(resource: &TsFileResource, time_lower_bound: i64) -> bool {
    resource.is_closed()
        && !resource.is_deleted()
        && !resource.is_merging()
        && resource.still_lives(time_lower_bound)
}

fn busiest_partition(
    unseq: &[Arc<TsFileResource>],
    partition_interval_ms: i64,
) -> Result<i64> {
    let mut counts = std::collections::BTreeMap::new();
    for resource in unseq {
        *counts
            .entry(resource.time_partition(partition_interval_ms)?)
            .or_insert(0usize) += 1;
    }
    Ok(counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(partition, _)| partition)
        .expect("unseq candidates are non-empty"))
}

fn greedy_select(
    strategy: MergeStrategy,
    seq: &[Arc<TsFileResource>],
    unseq: &[Arc<TsFileResource>],
    memory_budget: usize,
    tight: bool,
) -> Result<MergeResource> {
    let mut selected_seq: Vec<Arc<TsFileResource>> = Vec::new();
    let mut selected_unseq: Vec<Arc<TsFileResource>> = Vec::new();
    let mut lineage: BTreeSet<u64> = BTreeSet::new();
    let mut total_cost = 0usize;

    for candidate in unseq {
        let history = candidate.historical_versions();
        if history.iter().any(|v| lineage.contains(v)) {
            // intersecting lineages must not merge again
            continue;
        }

        let new_seq: Vec<Arc<TsFileResource>> = overlapping_seq(candidate, seq)
            .into_iter()
            .map(|i| seq[i].clone())
            .filter(|s| !selected_seq.iter().any(|sel| sel.path() == s.path()))
            .collect();
        if new_seq
            .iter()
            .any(|s| s.historical_versions().iter().any(|v| lineage.contains(v)))
        {
            continue;
        }

        let mut cost = unseq_cost(candidate, tight)?;
        for s in &new_seq {
            cost += seq_cost(s, tight)?;
        }
        if total_cost.saturating_add(cost) > memory_budget {
            continue;
        }

        total_cost += cost;
        lineage.extend(history);
        for s in &new_seq {
            lineage.extend(s.historical_versions());
        }
        selected_seq.extend(new_seq);
        selected_unseq.push(candidate.clone());
    }

    // the new-file strategies maximize the files squeezed into one
    // output, so they keep taking sequence files while the budget lasts
    if !selected_unseq.is_empty()
        && matches!(
            strategy,
            MergeStrategy::Squeeze | MergeStrategy::IndependenceSize
        )
    {
        for s in seq {
            if selected_seq.iter().any(|sel| sel.path() == s.path()) {
                continue;
            }
            if s.historical_versions().iter().any(|v| lineage.contains(v)) {
                continue;
            }
            let cost = seq_cost(s, tight)?;
            if total_cost.saturating_add(cost) > memory_budget {
                continue;
            }
            total_cost += cost;
            lineage.extend(s.historical_versions());
            selected_seq.push(s.clone());
        }
    }

    selected_seq.sort_by_key(file_order);
    Ok(MergeResource {
        seq_files: selected_seq,
        unseq_files: selected_unseq,
    })
}

/// Sequence files whose timeline slot intersects the candidate's data.
///
/// For a device, sequence file `i` (in version order) owns the slot
/// `(end_{i-1}, end_i]`; the last file's slot is open above, because
/// out-of-order data beyond every sealed range still merges into it.
fn overlapping_seq(unseq: &TsFileResource, seq: &[Arc<TsFileResource>]) -> BTreeSet<usize> {
    let mut hits = BTreeSet::new();
    let index = unseq.time_index();
    for (device, start) in &index.start_times {
        let end = index.end_times.get(device).copied().unwrap_or(*start);
        let with_device: Vec<(usize, i64)> = seq
            .iter()
            .enumerate()
            .filter(|(_, s)| s.contains_device(device))
            .map(|(i, s)| (i, s.end_time(device).unwrap_or(i64::MAX)))
            .collect();
        let mut prev_end = i64::MIN;
        for (i, file_end) in &with_device {
            if *start <= *file_end && end > prev_end {
                hits.insert(*i);
            }
            prev_end = *file_end;
        }
        if let Some((last, last_end)) = with_device.last() {
            if end > *last_end {
                hits.insert(*last);
            }
        }
    }
    hits
}

/// Loose bound: the whole unsequence file may be buffered during merge.
/// Tight bound: actual chunk bytes, read from the file's metadata.
fn unseq_cost(resource: &TsFileResource, tight: bool) -> Result<usize> {
    if !tight {
        return Ok(resource.file_size() as usize * MERGE_OVERHEAD_FACTOR);
    }
    Ok(total_chunk_bytes(resource)? * MERGE_OVERHEAD_FACTOR)
}

/// Loose bound: one device's share of the file is buffered at a time.
/// Tight bound: the largest per-device chunk payload.
fn seq_cost(resource: &TsFileResource, tight: bool) -> Result<usize> {
    if !tight {
        let devices = resource.devices().len().max(1);
        return Ok(resource.file_size() as usize / devices * MERGE_OVERHEAD_FACTOR);
    }
    Ok(max_device_chunk_bytes(resource)? * MERGE_OVERHEAD_FACTOR)
}

fn total_chunk_bytes(resource: &TsFileResource) -> Result<usize> {
    let reader = DtsReader::open(resource.path())?;
    let mut total = 0usize;
    for device in reader.all_devices()? {
        for chunks in reader.chunk_metadata_in_device(&device)?.values() {
            total += chunks.iter().map(|c| c.data_size as usize).sum::<usize>();
        }
    }
    Ok(total)
}

fn max_device_chunk_bytes(resource: &TsFileResource) -> Result<usize> {
    let reader = DtsReader::open(resource.path())?;
    let mut max = 0usize;
    for device in reader.all_devices()? {
        let bytes: usize = reader
            .chunk_metadata_in_device(&device)?
            .values()
            .flat_map(|chunks| chunks.iter())
            .map(|c| c.data_size as usize)
            .sum();
        max = max.max(bytes);
    }
    Ok(max)
}
