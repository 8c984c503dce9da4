//! Merge execution: streams every shared series of the input files
//! through the newer-wins iterator into target writers, logging progress
//! so a crash at any step is recoverable.
//!
//! INPLACE rewrites each selected sequence file through a `.merge`
//! sibling swapped over the original, conserving file names and version
//! fingerprints. SQUEEZE (and the size-based independence strategy)
//! writes one new sequence file and decommissions every input.

use crate::dts::writer::WriterConfig;
use crate::dts::{CompressionType, DataType, DtsReader, DtsWriter, Encoding, Timestamp, TsValue};
use crate::engine::resource::{data_file_name, parse_file_name, TimeIndex, TsFileResource};
use crate::error::{DenError, Result};
use crate::merge::log::MergeLogger;
use crate::merge::{MergeResource, MergeStrategy};
use crate::query::{SeriesSource, SortedSeriesIterator};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Suffix of in-progress merge target files.
pub const MERGE_SUFFIX: &str = ".merge";

/// A scheduled merge over selected input files.
pub struct MergeTask {
    /// Selected input files.
    pub resource: MergeResource,
    /// Directory holding the merge log.
    pub sys_dir: PathBuf,
    /// Strategy deciding target layout.
    pub strategy: MergeStrategy,
    /// Whether unmerged chunks are rewritten too.
    pub full_merge: bool,
    /// Layout parameters for target writers.
    pub writer_config: WriterConfig,
}

impl MergeTask {
    /// Runs the merge to completion.
    pub fn execute(self) -> Result<MergeOutcome> {
        let mut execution = MergeExecution::start(self)?;
        execution.merge_all_series(&BTreeSet::new())?;
        execution.finish(&BTreeSet::new())
    }
}

/// List surgery the storage group applies after a merge.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Newly created sequence files (SQUEEZE output).
    pub new_seq: Vec<Arc<TsFileResource>>,
    /// Sequence files rewritten in place; their cached metadata is stale.
    pub rewritten_seq: Vec<Arc<TsFileResource>>,
    /// Sequence inputs that were decommissioned.
    pub removed_seq: Vec<Arc<TsFileResource>>,
    /// Unsequence inputs that were decommissioned.
    pub removed_unseq: Vec<Arc<TsFileResource>>,
}

struct Target {
    temp_path: PathBuf,
    final_path: PathBuf,
    /// Present for INPLACE targets; SQUEEZE targets get a fresh resource
    /// at swap time.
    seq_resource: Option<Arc<TsFileResource>>,
}

pub(crate) struct MergeExecution {
    resource: MergeResource,
    strategy: MergeStrategy,
    #[allow(dead_code)]
    full_merge: bool,
    writer_config: WriterConfig,
    log_path: PathBuf,
    logger: MergeLogger,
    targets: Vec<Target>,
    writers: BTreeMap<PathBuf, DtsWriter>,
    readers: BTreeMap<PathBuf, DtsReader>,
    max_input_version: u64,
}

impl MergeExecution {
    /// Starts a fresh merge: logs the sources, locks the inputs, logs the
    /// start barrier and creates the target writers.
    pub(crate) fn start(task: MergeTask) -> Result<Self> {
        let mut logger = MergeLogger::open(&task.sys_dir)?;
        let seq_paths: Vec<PathBuf> = task
            .resource
            .seq_files
            .iter()
            .map(|r| r.path().to_path_buf())
            .collect();
        let unseq_paths: Vec<PathBuf> = task
            .resource
            .unseq_files
            .iter()
            .map(|r| r.path().to_path_buf())
            .collect();
        logger.log_source(&seq_paths, &unseq_paths)?;

        for resource in task
            .resource
            .seq_files
            .iter()
            .chain(task.resource.unseq_files.iter())
        {
            resource.set_merging(true);
        }
        logger.log_merge_start()?;

        let log_path = logger.path().to_path_buf();
        let mut execution = Self::prepare(task, logger, log_path)?;
        let mut writers = BTreeMap::new();
        for target in &execution.targets {
            writers.insert(
                target.temp_path.clone(),
                DtsWriter::create(&target.temp_path, execution.writer_config)?,
            );
        }
        execution.writers = writers;
        Ok(execution)
    }

    /// Rebuilds an execution for recovery; target writers are attached
    /// afterwards with [`set_writers`](Self::set_writers).
    pub(crate) fn resume(task: MergeTask, logger: MergeLogger) -> Result<Self> {
        let log_path = logger.path().to_path_buf();
        for resource in task
            .resource
            .seq_files
            .iter()
            .chain(task.resource.unseq_files.iter())
        {
            resource.set_merging(true);
        }
        Self::prepare(task, logger, log_path)
    }

    /// Attaches restored target writers.
    pub(crate) fn set_writers(&mut self, writers: BTreeMap<PathBuf, DtsWriter>) {
        self.writers = writers;
    }

    /// Whether any target already holds chunks of the series.
    pub(crate) fn series_visible_in_targets(&self, device: &str, measurement: &str) -> bool {
        self.writers
            .values()
            .any(|w| !w.visible_chunk_metadata(device, measurement).is_empty())
    }

    /// INPLACE targets as (source resource, temp path) pairs.
    pub(crate) fn inplace_targets(&self) -> Vec<(Arc<TsFileResource>, PathBuf)> {
        self.targets
            .iter()
            .filter_map(|t| {
                t.seq_resource
                    .clone()
                    .map(|resource| (resource, t.temp_path.clone()))
            })
            .collect()
    }

    /// Chunk metadata of one series in one input file.
    pub(crate) fn source_chunk_metadata(
        &self,
        resource: &TsFileResource,
        device: &str,
        measurement: &str,
    ) -> Result<Vec<crate::dts::ChunkMetadata>> {
        let reader = self
            .readers
            .get(resource.path())
            .ok_or_else(|| DenError::Merge(format!("no reader for {}", resource.path().display())))?;
        reader.chunk_metadata_list(device, measurement)
    }

    fn prepare(task: MergeTask, logger: MergeLogger, log_path: PathBuf) -> Result<Self> {
        let targets = plan_targets(&task.resource, task.strategy)?;
        let mut readers = BTreeMap::new();
        for resource in task
            .resource
            .seq_files
            .iter()
            .chain(task.resource.unseq_files.iter())
        {
            readers.insert(
                resource.path().to_path_buf(),
                DtsReader::open(resource.path())?,
            );
        }
        let max_input_version = task
            .resource
            .seq_files
            .iter()
            .chain(task.resource.unseq_files.iter())
            .map(|r| r.max_version())
            .max()
            .unwrap_or(0);
        Ok(Self {
            resource: task.resource,
            strategy: task.strategy,
            full_merge: task.full_merge,
            writer_config: task.writer_config,
            log_path,
            logger,
            targets,
            writers: BTreeMap::new(),
            readers,
            max_input_version,
        })
    }

    /// Deterministic (temp, final) target paths, used by recovery to
    /// find the temps of a crashed merge.
    pub(crate) fn target_paths(&self) -> Vec<(PathBuf, PathBuf)> {
        self.targets
            .iter()
            .map(|t| (t.temp_path.clone(), t.final_path.clone()))
            .collect()
    }

    /// Merges every shared series, skipping the already-merged set.
    pub(crate) fn merge_all_series(&mut self, skip: &BTreeSet<(String, String)>) -> Result<()> {
        let mut devices: BTreeSet<String> = BTreeSet::new();
        for resource in self
            .resource
            .seq_files
            .iter()
            .chain(self.resource.unseq_files.iter())
        {
            devices.extend(resource.devices());
        }

        for device in devices {
            let mut measurements: BTreeMap<String, DataType> = BTreeMap::new();
            for reader in self.readers.values() {
                for (measurement, chunks) in reader.chunk_metadata_in_device(&device)? {
                    if let Some(chunk) = chunks.first() {
                        measurements.entry(measurement).or_insert(chunk.data_type);
                    }
                }
            }
            for (measurement, data_type) in measurements {
                if skip.contains(&(device.clone(), measurement.clone())) {
                    continue;
                }
                self.merge_one_series(&device, &measurement, data_type)?;
                self.logger.log_ts_end(&device, &measurement)?;
                let positions: BTreeMap<PathBuf, u64> = self
                    .writers
                    .iter()
                    .map(|(path, writer)| (path.clone(), writer.position()))
                    .collect();
                self.logger.log_positions(&positions)?;
            }
        }
        Ok(())
    }

    fn chunk_sources(
        &self,
        resource: &TsFileResource,
        device: &str,
        measurement: &str,
    ) -> Result<Vec<SeriesSource>> {
        let reader = self
            .readers
            .get(resource.path())
            .ok_or_else(|| DenError::Merge(format!("no reader for {}", resource.path().display())))?;
        let deletions = resource.deletions_for(device, measurement);
        let mut sources = Vec::new();
        for chunk in reader.chunk_metadata_list(device, measurement)? {
            let mut samples = reader.read_chunk_samples(&chunk)?;
            samples.retain(|(ts, _)| !deletions.iter().any(|d| d.hides(*ts, chunk.version)));
            if !samples.is_empty() {
                sources.push(SeriesSource {
                    version: chunk.version,
                    samples,
                });
            }
        }
        Ok(sources)
    }

    fn merge_one_series(&mut self, device: &str, measurement: &str, data_type: DataType) -> Result<()> {
        let mut unseq_sources: Vec<SeriesSource> = Vec::new();
        for resource in &self.resource.unseq_files.clone() {
            unseq_sources.extend(self.chunk_sources(resource, device, measurement)?);
        }

        // single new-file target: everything merges into one stream
        if self.targets.len() == 1 && self.targets[0].seq_resource.is_none() {
            let mut sources = unseq_sources;
            for resource in &self.resource.seq_files.clone() {
                sources.extend(self.chunk_sources(resource, device, measurement)?);
            }
            let merged: Vec<(Timestamp, TsValue)> = SortedSeriesIterator::new(sources).collect();
            let temp = self.targets[0].temp_path.clone();
            return self.write_series(&temp, device, measurement, data_type, &merged);
        }

        // INPLACE: route merged points into each sequence file's window
        let mut prev_end = i64::MIN;
        let last = self.targets.len() - 1;
        for i in 0..self.targets.len() {
            let seq_resource = self.targets[i]
                .seq_resource
                .clone()
                .expect("inplace target has a resource");
            let window_end = if i == last {
                i64::MAX
            } else {
                seq_resource.end_time(device).unwrap_or(prev_end)
            };

            let mut sources = self.chunk_sources(&seq_resource, device, measurement)?;
            for unseq in &unseq_sources {
                let slice: Vec<(Timestamp, TsValue)> = unseq
                    .samples
                    .iter()
                    .filter(|(ts, _)| *ts > prev_end && *ts <= window_end)
                    .cloned()
                    .collect();
                if !slice.is_empty() {
                    sources.push(SeriesSource {
                        version: unseq.version,
                        samples: slice,
                    });
                }
            }
            let merged: Vec<(Timestamp, TsValue)> = SortedSeriesIterator::new(sources).collect();
            let temp = self.targets[i].temp_path.clone();
            self.write_series(&temp, device, measurement, data_type, &merged)?;
            prev_end = window_end;
        }
        Ok(())
    }

    fn write_series(
        &mut self,
        temp_path: &Path,
        device: &str,
        measurement: &str,
        data_type: DataType,
        samples: &[(Timestamp, TsValue)],
    ) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let writer = self
            .writers
            .get_mut(temp_path)
            .ok_or_else(|| DenError::Merge(format!("no writer for {}", temp_path.display())))?;
        // one chunk group per series keeps the log's safe positions on
        // group boundaries
        writer.start_chunk_group(device);
        writer.write_chunk(
            measurement,
            data_type,
            Encoding::Plain,
            CompressionType::Lz4,
            samples,
        )?;
        writer.end_chunk_group()?;
        writer.sync()?;
        Ok(())
    }

    /// Move phase: seals targets, swaps them in under exclusive locks in
    /// file-name order, removes consumed inputs and commits the log.
    pub(crate) fn finish(mut self, finished: &BTreeSet<PathBuf>) -> Result<MergeOutcome> {
        self.logger.log_all_ts_merged()?;

        for writer in self.writers.values_mut() {
            if !writer.is_sealed() {
                writer.write_version(self.max_input_version)?;
                writer.seal()?;
            }
        }

        let unseq_versions: BTreeSet<u64> = self
            .resource
            .unseq_files
            .iter()
            .flat_map(|r| r.historical_versions())
            .collect();
        let all_versions: BTreeSet<u64> = self
            .resource
            .seq_files
            .iter()
            .chain(self.resource.unseq_files.iter())
            .flat_map(|r| r.historical_versions())
            .collect();

        let mut outcome = MergeOutcome::default();
        let mut order: Vec<usize> = (0..self.targets.len()).collect();
        order.sort_by_key(|i| self.targets[*i].final_path.clone());

        for i in order {
            let target = &self.targets[i];
            if finished.contains(&target.final_path) {
                continue;
            }
            let writer = self
                .writers
                .get(&target.temp_path)
                .ok_or_else(|| DenError::Merge(format!("no writer for {}", target.temp_path.display())))?;
            let time_index = time_index_of_writer(writer);

            match &target.seq_resource {
                Some(resource) => {
                    let _guard = resource.write_query_lock().write();
                    std::fs::rename(&target.temp_path, &target.final_path)?;
                    resource.set_time_index(time_index);
                    resource.add_historical_versions(unseq_versions.iter().copied());
                    resource.serialize()?;
                    outcome.rewritten_seq.push(resource.clone());
                }
                None => {
                    std::fs::rename(&target.temp_path, &target.final_path)?;
                    let resource = Arc::new(TsFileResource::new(&target.final_path));
                    resource.set_time_index(time_index);
                    resource.set_historical_versions(all_versions.clone());
                    resource.set_closed(true);
                    resource.serialize()?;
                    outcome.new_seq.push(resource);
                }
            }
            self.logger.log_file_end(&target.final_path)?;
        }

        for resource in &self.resource.unseq_files {
            let _guard = resource.write_query_lock().write();
            resource.remove()?;
            outcome.removed_unseq.push(resource.clone());
        }
        // a new-file strategy consumes its sequence inputs too
        if self.targets.iter().any(|t| t.seq_resource.is_none()) {
            for resource in &self.resource.seq_files {
                let _guard = resource.write_query_lock().write();
                resource.remove()?;
                outcome.removed_seq.push(resource.clone());
            }
        }

        self.logger.log_merge_end()?;
        drop(self.logger);
        if self.log_path.exists() {
            std::fs::remove_file(&self.log_path)?;
        }

        for resource in self
            .resource
            .seq_files
            .iter()
            .chain(self.resource.unseq_files.iter())
        {
            resource.set_merging(false);
        }
        info!(
            strategy = ?self.strategy,
            new = outcome.new_seq.len(),
            removed_unseq = outcome.removed_unseq.len(),
            "merge committed"
        );
        Ok(outcome)
    }
}

/// Derives the deterministic target list of a merge.
fn plan_targets(resource: &MergeResource, strategy: MergeStrategy) -> Result<Vec<Target>> {
    let new_file_target = |resource: &MergeResource| -> Result<Target> {
        let reference = resource
            .seq_files
            .first()
            .or_else(|| resource.unseq_files.first())
            .ok_or_else(|| DenError::Merge("empty merge resource".to_string()))?;
        let dir = reference
            .path()
            .parent()
            .ok_or_else(|| DenError::Merge("input file has no parent".to_string()))?;
        let mut max_version = 0;
        let mut max_merge_cnt = 0;
        for input in resource.seq_files.iter().chain(resource.unseq_files.iter()) {
            let (version, merge_cnt) = parse_file_name(input.path())?;
            max_version = max_version.max(version);
            max_merge_cnt = max_merge_cnt.max(merge_cnt);
        }
        let final_path = dir.join(data_file_name(max_version, (max_merge_cnt + 1) as u32));
        Ok(Target {
            temp_path: PathBuf::from(format!("{}{}", final_path.display(), MERGE_SUFFIX)),
            final_path,
            seq_resource: None,
        })
    };

    match strategy {
        MergeStrategy::Inplace if !resource.seq_files.is_empty() => Ok(resource
            .seq_files
            .iter()
            .map(|seq| Target {
                temp_path: PathBuf::from(format!("{}{}", seq.path().display(), MERGE_SUFFIX)),
                final_path: seq.path().to_path_buf(),
                seq_resource: Some(seq.clone()),
            })
            .collect()),
        MergeStrategy::Inplace => {
            warn!("inplace merge without sequence inputs, writing a new file");
            Ok(vec![new_file_target(resource)?])
        }
        MergeStrategy::Squeeze | MergeStrategy::IndependenceSize => {
            Ok(vec![new_file_target(resource)?])
        }
    }
}

fn time_index_of_writer(writer: &DtsWriter) -> TimeIndex {
    let mut index = TimeIndex::default();
    for group in writer.chunk_groups() {
        for chunk in &group.chunks {
            let start = index
                .start_times
                .entry(group.device.clone())
                .or_insert(i64::MAX);
            *start = (*start).min(chunk.start_time());
            let end = index
                .end_times
                .entry(group.device.clone())
                .or_insert(i64::MIN);
            *end = (*end).max(chunk.end_time());
        }
    }
    index
}
