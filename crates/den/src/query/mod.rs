//! Query plan assembly and the newer-wins series reader.
//!
//! A query snapshot holds two ordered resource lists, sequence and
//! unsequence, each view carrying the path, any unsealed memtable
//! snapshots and the already-visible chunk metadata. The per-resource
//! read lock is held for the lifetime of the view. Readers merge all
//! sources through a monotonic iterator with newer-wins semantics on
//! timestamp ties, apply tombstones and skip chunks whose statistics fall
//! outside the filter.

use crate::cache::ChunkMetadataCache;
use crate::dts::reader::read_chunk_from;
use crate::dts::{ChunkMetadata, TimeRange, Timestamp, TsValue};
use crate::engine::memtable::ReadOnlyMemChunk;
use crate::engine::modification::Deletion;
use crate::engine::TsFileResource;
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::RawRwLock;
use std::sync::Arc;

/// Guard type holding one resource's read lock.
pub type ResourceReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;

/// One file's contribution to a query snapshot.
pub struct ResourceView {
    /// The file's descriptor.
    pub resource: Arc<TsFileResource>,
    /// Memtable snapshots of an unsealed file (flushing first).
    pub mem_chunks: Vec<ReadOnlyMemChunk>,
    /// Chunk metadata visible in an unsealed file. Sealed files resolve
    /// their metadata through the cache at scan time instead.
    pub unsealed_chunk_metadata: Vec<ChunkMetadata>,
    /// Read lock held until the view is dropped.
    _guard: ResourceReadGuard,
}

impl ResourceView {
    /// Creates a view, taking the resource's read lock.
    pub fn new(
        resource: Arc<TsFileResource>,
        mem_chunks: Vec<ReadOnlyMemChunk>,
        unsealed_chunk_metadata: Vec<ChunkMetadata>,
    ) -> Self {
        let guard = resource.write_query_lock().clone().read_arc();
        Self {
            resource,
            mem_chunks,
            unsealed_chunk_metadata,
            _guard: guard,
        }
    }
}

/// Snapshot of everything a series scan needs.
pub struct QueryDataSource {
    /// Queried device.
    pub device: String,
    /// Queried measurement.
    pub measurement: String,
    /// Optional time filter.
    pub time_filter: Option<TimeRange>,
    /// Sequence resources in time order.
    pub seq: Vec<ResourceView>,
    /// Unsequence resources, any order.
    pub unseq: Vec<ResourceView>,
}

/// One decoded, version-tagged sample run feeding the merge.
pub struct SeriesSource {
    /// Version deciding ties, larger wins.
    pub version: u64,
    /// Samples sorted by timestamp.
    pub samples: Vec<(Timestamp, TsValue)>,
}

/// K-way merging iterator over version-tagged sorted runs.
///
/// Produces strictly increasing timestamps; on a tie across runs the
/// sample from the highest-version run wins and the others are skipped.
pub struct SortedSeriesIterator {
    cursors: Vec<(SeriesSource, usize)>,
}

impl SortedSeriesIterator {
    /// Creates the iterator from its source runs.
    pub fn new(sources: Vec<SeriesSource>) -> Self {
        Self {
            cursors: sources.into_iter().map(|s| (s, 0)).collect(),
        }
    }
}

impl Iterator for SortedSeriesIterator {
    type Item = (Timestamp, TsValue);

    fn next(&mut self) -> Option<Self::Item> {
        let min_ts = self
            .cursors
            .iter()
            .filter_map(|(source, idx)| source.samples.get(*idx).map(|(ts, _)| *ts))
            .min()?;

        let mut best: Option<(u64, TsValue)> = None;
        for (source, idx) in self.cursors.iter_mut() {
            if let Some((ts, value)) = source.samples.get(*idx) {
                if *ts == min_ts {
                    match &best {
                        Some((version, _)) if *version >= source.version => {}
                        _ => best = Some((source.version, value.clone())),
                    }
                    *idx += 1;
                }
            }
        }
        best.map(|(_, value)| (min_ts, value))
    }
}

/// Drops samples hidden by tombstones or outside the filter.
fn filter_samples(
    samples: &mut Vec<(Timestamp, TsValue)>,
    version: u64,
    deletions: &[Deletion],
    time_filter: Option<&TimeRange>,
) {
    samples.retain(|(ts, _)| {
        if let Some(filter) = time_filter {
            if !filter.contains(*ts) {
                return false;
            }
        }
        !deletions.iter().any(|d| d.hides(*ts, version))
    });
}

fn chunk_passes(chunk: &ChunkMetadata, time_filter: Option<&TimeRange>) -> bool {
    match time_filter {
        Some(filter) => TimeRange::new(chunk.start_time(), chunk.end_time()).overlaps(filter),
        None => true,
    }
}

fn sources_of_view(
    view: &ResourceView,
    device: &str,
    measurement: &str,
    time_filter: Option<&TimeRange>,
    cache: &ChunkMetadataCache,
) -> crate::error::Result<Vec<SeriesSource>> {
    let mut sources = Vec::new();
    let deletions = view.resource.deletions_for(device, measurement);

    let sealed_chunks;
    let chunks: &[ChunkMetadata] = if view.resource.is_closed() {
        sealed_chunks = cache.get(&view.resource, device, measurement)?;
        &sealed_chunks
    } else {
        &view.unsealed_chunk_metadata
    };

    for chunk in chunks {
        if !chunk_passes(chunk, time_filter) {
            continue;
        }
        // statistics may already prove the whole chunk deleted
        if deletions
            .iter()
            .any(|d| d.hides(chunk.end_time(), chunk.version))
        {
            continue;
        }
        let mut samples = read_chunk_from(view.resource.path(), chunk)?;
        filter_samples(&mut samples, chunk.version, &deletions, time_filter);
        if !samples.is_empty() {
            sources.push(SeriesSource {
                version: chunk.version,
                samples,
            });
        }
    }

    for mem_chunk in &view.mem_chunks {
        if let Some(range) = mem_chunk.time_range() {
            if let Some(filter) = time_filter {
                if !range.overlaps(filter) {
                    continue;
                }
            }
        }
        let mut samples = mem_chunk.samples.clone();
        filter_samples(&mut samples, mem_chunk.version, &[], time_filter);
        if !samples.is_empty() {
            sources.push(SeriesSource {
                version: mem_chunk.version,
                samples,
            });
        }
    }
    Ok(sources)
}

/// Scans a query snapshot into sorted `(timestamp, value)` pairs.
pub fn read_series(
    source: &QueryDataSource,
    cache: &ChunkMetadataCache,
) -> crate::error::Result<Vec<(Timestamp, TsValue)>> {
    let mut runs = Vec::new();
    for view in source.seq.iter().chain(source.unseq.iter()) {
        if view.resource.is_deleted() {
            continue;
        }
        runs.extend(sources_of_view(
            view,
            &source.device,
            &source.measurement,
            source.time_filter.as_ref(),
            cache,
        )?);
    }
    Ok(SortedSeriesIterator::new(runs).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(version: u64, samples: Vec<(i64, i64)>) -> SeriesSource {
        SeriesSource {
            version,
            samples: samples
                .into_iter()
                .map(|(ts, v)| (ts, TsValue::Int64(v)))
                .collect(),
        }
    }

    fn collect(iter: SortedSeriesIterator) -> Vec<(i64, i64)> {
        iter.map(|(ts, value)| match value {
            TsValue::Int64(v) => (ts, v),
            other => panic!("unexpected value {other:?}"),
        })
        .collect()
    }

    #[test]
    fn test_merge_disjoint_runs() {
        let iter = SortedSeriesIterator::new(vec![
            source(1, vec![(1, 10), (3, 30)]),
            source(2, vec![(2, 20), (4, 40)]),
        ]);
        assert_eq!(collect(iter), vec![(1, 10), (2, 20), (3, 30), (4, 40)]);
    }

    #[test]
    fn test_newer_wins_on_tie() {
        let iter = SortedSeriesIterator::new(vec![
            source(1, vec![(5, 1), (6, 1)]),
            source(9, vec![(5, 2)]),
        ]);
        assert_eq!(collect(iter), vec![(5, 2), (6, 1)]);
    }

    #[test]
    fn test_empty_sources() {
        let iter = SortedSeriesIterator::new(vec![source(1, vec![]), source(2, vec![])]);
        assert!(collect(iter).is_empty());
    }
}
