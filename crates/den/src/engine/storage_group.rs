//! Storage-group processor: routes writes into partitioned sequence and
//! unsequence files, drives flush and merge, applies deletes and
//! assembles query snapshots.
//!
//! Directory layout: `<data_dir>/<group>/<partition>/<seq|unseq>/<file>`,
//! with the merge log and version checkpoints directly under the group
//! directory.

use crate::cache::ChunkMetadataCache;
use crate::config::StorageGroupConfig;
use crate::dts::writer::WriterConfig;
use crate::dts::{DtsWriter, TimeRange, DTS_SUFFIX};
use crate::engine::modification::Deletion;
use crate::engine::processor::TsFileProcessor;
use crate::engine::resource::{parse_file_name, data_file_name, TimeIndex, TsFileResource};
use crate::engine::version::SimpleFileVersionController;
use crate::engine::{FlushManager, InsertPlan, TabletPlan};
use crate::error::{DenError, Result};
use crate::merge::{recover_merge, MergeManager, MergeOutcome, MergeTask};
use crate::query::{QueryDataSource, ResourceView};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const SEQ_DIR: &str = "seq";
const UNSEQ_DIR: &str = "unseq";

struct SgInner {
    seq_files: Vec<Arc<TsFileResource>>,
    unseq_files: Vec<Arc<TsFileResource>>,
    working_seq: HashMap<i64, Arc<TsFileProcessor>>,
    working_unseq: HashMap<i64, Arc<TsFileProcessor>>,
    closing: Vec<(Arc<TsFileProcessor>, Receiver<Result<()>>)>,
    /// partition -> device -> largest timestamp ever inserted.
    latest_time: HashMap<i64, HashMap<String, i64>>,
    /// Set after a flush failed repeatedly; rejects further writes.
    flush_failed: bool,
}

/// Core orchestrator of one storage group.
pub struct StorageGroupProcessor {
    name: String,
    config: StorageGroupConfig,
    sg_dir: PathBuf,
    version_controller: Arc<SimpleFileVersionController>,
    flush_manager: Arc<FlushManager>,
    merge_manager: Arc<MergeManager>,
    cache: Arc<ChunkMetadataCache>,
    inner: Arc<RwLock<SgInner>>,
}

impl StorageGroupProcessor {
    /// Opens the storage group under `data_dir`, running startup recovery
    /// (torn-file repair, then merge recovery) before admitting writes.
    pub fn open(
        data_dir: &Path,
        name: &str,
        config: StorageGroupConfig,
        flush_manager: Arc<FlushManager>,
        merge_manager: Arc<MergeManager>,
        cache: Arc<ChunkMetadataCache>,
    ) -> Result<Self> {
        let sg_dir = data_dir.join(name);
        fs::create_dir_all(&sg_dir)?;
        let version_controller = Arc::new(SimpleFileVersionController::open(&sg_dir)?);

        let processor = Self {
            name: name.to_string(),
            config,
            sg_dir,
            version_controller,
            flush_manager,
            merge_manager,
            cache,
            inner: Arc::new(RwLock::new(SgInner {
                seq_files: Vec::new(),
                unseq_files: Vec::new(),
                working_seq: HashMap::new(),
                working_unseq: HashMap::new(),
                closing: Vec::new(),
                latest_time: HashMap::new(),
                flush_failed: false,
            })),
        };
        processor.recover()?;
        Ok(processor)
    }

    /// Name of the storage group.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_degree_of_index_node: self.config.max_degree_of_index_node,
            bloom_filter_error_rate: self.config.bloom_filter_error_rate,
        }
    }

    // ---------------------------------------------------------------
    // recovery

    fn recover(&self) -> Result<()> {
        let mut seq_files = Vec::new();
        let mut unseq_files = Vec::new();

        for entry in fs::read_dir(&self.sg_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let partition_dir = entry.path();
            if partition_dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<i64>().ok())
                .is_none()
            {
                continue;
            }
            self.recover_dir(&partition_dir.join(SEQ_DIR), &mut seq_files)?;
            self.recover_dir(&partition_dir.join(UNSEQ_DIR), &mut unseq_files)?;
        }

        sort_resources(&mut seq_files);
        sort_resources(&mut unseq_files);

        let outcome = recover_merge(
            &self.sg_dir,
            &seq_files,
            &unseq_files,
            true,
            self.config.merge_strategy,
            self.config.force_full_merge,
            self.writer_config(),
        )?;

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.seq_files = seq_files;
        inner.unseq_files = unseq_files;
        if let Some(outcome) = outcome {
            apply_merge_outcome(inner, &outcome, &self.cache);
        }

        // rebuild latest-time maps from the sealed populations
        for resource in inner.seq_files.iter().chain(inner.unseq_files.iter()) {
            let partition = resource.time_partition(self.config.partition_interval_ms)?;
            let index = resource.time_index();
            let per_device = inner.latest_time.entry(partition).or_default();
            for (device, end) in index.end_times {
                let entry = per_device.entry(device).or_insert(i64::MIN);
                if end > *entry {
                    *entry = end;
                }
            }
        }
        info!(
            group = %self.name,
            seq = inner.seq_files.len(),
            unseq = inner.unseq_files.len(),
            "storage group recovered"
        );
        Ok(())
    }

    fn recover_dir(&self, dir: &Path, out: &mut Vec<Arc<TsFileResource>>) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e != DTS_SUFFIX).unwrap_or(true) {
                continue;
            }
            let probe = TsFileResource::new(&path);
            let resource = if probe.is_close_flag_set() || !probe.resource_file_exists() {
                match self.recover_torn_file(&path)? {
                    Some(resource) => resource,
                    None => continue,
                }
            } else {
                Arc::new(TsFileResource::deserialize(&path)?)
            };
            out.push(resource);
        }
        Ok(())
    }

    /// Repairs a file interrupted mid-flush: truncates it to its largest
    /// safe prefix, seals it and rebuilds the side-car. An empty torn
    /// file is deleted instead.
    fn recover_torn_file(&self, path: &Path) -> Result<Option<Arc<TsFileResource>>> {
        warn!(path = %path.display(), "recovering torn file");
        let mut writer = DtsWriter::restore(path, self.writer_config())?;
        let resource = Arc::new(TsFileResource::new(path));
        if writer.chunk_groups().is_empty() {
            resource.clean_close_flag();
            resource.remove()?;
            return Ok(None);
        }
        if !writer.is_sealed() {
            writer.seal()?;
        }

        let mut index = TimeIndex::default();
        for group in writer.chunk_groups() {
            for chunk in &group.chunks {
                let start = index.start_times.entry(group.device.clone()).or_insert(i64::MAX);
                *start = (*start).min(chunk.start_time());
                let end = index.end_times.entry(group.device.clone()).or_insert(i64::MIN);
                *end = (*end).max(chunk.end_time());
            }
        }
        resource.set_time_index(index);
        let version = writer
            .max_version()
            .map(Ok)
            .unwrap_or_else(|| parse_file_name(path).map(|(v, _)| v))?;
        resource.set_historical_versions([version].into_iter().collect());
        resource.serialize()?;
        resource.set_closed(true);
        resource.clean_close_flag();
        Ok(Some(resource))
    }

    // ---------------------------------------------------------------
    // writes

    /// Inserts one row, classifying it as sequence or unsequence against
    /// the device's largest previously inserted timestamp in the row's
    /// partition.
    pub fn insert(&self, plan: &InsertPlan) -> Result<()> {
        plan.check_schema()?;
        let mut inner = self.inner.write();
        if inner.flush_failed {
            return Err(DenError::WriteProcess(format!(
                "storage group {} rejects writes after a flush failure",
                self.name
            )));
        }
        self.prune_closing(&mut inner);

        let partition = self.config.time_partition(plan.timestamp);
        let latest = inner
            .latest_time
            .get(&partition)
            .and_then(|m| m.get(&plan.device))
            .copied();
        let seq = latest.map(|l| plan.timestamp >= l).unwrap_or(true);

        let processor = self.working_processor(&mut inner, partition, seq)?;
        processor.insert(plan)?;

        let entry = inner
            .latest_time
            .entry(partition)
            .or_default()
            .entry(plan.device.clone())
            .or_insert(i64::MIN);
        if plan.timestamp > *entry {
            *entry = plan.timestamp;
        }

        if processor.memtable_size() >= self.config.memtable_size_threshold {
            self.async_close_slot(&mut inner, partition, seq);
        }
        if !seq {
            self.enforce_unseq_ceiling(&mut inner, partition);
        }
        Ok(())
    }

    /// Inserts a tablet, splitting its rows on every boundary where the
    /// (partition, sequence) classification changes; each contiguous run
    /// goes to one file processor. Returns per-row results.
    pub fn insert_tablet(&self, plan: &TabletPlan) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(plan.timestamps.len());
        let mut run_start = 0usize;
        let mut run_label: Option<(i64, bool)> = None;

        for (row, ts) in plan.timestamps.iter().enumerate() {
            let partition = self.config.time_partition(*ts);
            let seq = {
                let inner = self.inner.read();
                inner
                    .latest_time
                    .get(&partition)
                    .and_then(|m| m.get(&plan.device))
                    .map(|latest| *ts >= *latest)
                    .unwrap_or(true)
            };
            let label = (partition, seq);
            match run_label {
                Some(current) if current == label => {}
                Some((partition, seq)) => {
                    self.insert_run(plan, run_start, row, partition, seq, &mut results);
                    run_start = row;
                    run_label = Some(label);
                }
                None => run_label = Some(label),
            }
        }
        if let Some((partition, seq)) = run_label {
            self.insert_run(
                plan,
                run_start,
                plan.timestamps.len(),
                partition,
                seq,
                &mut results,
            );
        }
        results
    }

    /// Hands one contiguous run of tablet rows to a single processor.
    fn insert_run(
        &self,
        plan: &TabletPlan,
        from: usize,
        to: usize,
        partition: i64,
        seq: bool,
        results: &mut Vec<Result<()>>,
    ) {
        let mut inner = self.inner.write();
        if inner.flush_failed {
            for _ in from..to {
                results.push(Err(DenError::WriteProcess(format!(
                    "storage group {} rejects writes after a flush failure",
                    self.name
                ))));
            }
            return;
        }
        self.prune_closing(&mut inner);

        let processor = match self.working_processor(&mut inner, partition, seq) {
            Ok(processor) => processor,
            Err(e) => {
                error!(group = %self.name, "cannot open working file: {e}");
                for _ in from..to {
                    results.push(Err(DenError::WriteProcess(format!(
                        "cannot open working file for partition {partition}"
                    ))));
                }
                return;
            }
        };

        for row in from..to {
            let row_plan = plan.row(row);
            let result = processor.insert(&row_plan);
            if result.is_ok() {
                let entry = inner
                    .latest_time
                    .entry(partition)
                    .or_default()
                    .entry(plan.device.clone())
                    .or_insert(i64::MIN);
                if row_plan.timestamp > *entry {
                    *entry = row_plan.timestamp;
                }
            }
            results.push(result);
        }

        if processor.memtable_size() >= self.config.memtable_size_threshold {
            self.async_close_slot(&mut inner, partition, seq);
        }
        if !seq {
            self.enforce_unseq_ceiling(&mut inner, partition);
        }
    }

    fn working_processor(
        &self,
        inner: &mut SgInner,
        partition: i64,
        seq: bool,
    ) -> Result<Arc<TsFileProcessor>> {
        let map = if seq {
            &mut inner.working_seq
        } else {
            &mut inner.working_unseq
        };
        if let Some(processor) = map.get(&partition) {
            return Ok(processor.clone());
        }

        let version = self.version_controller.next_version()?;
        let dir = self
            .sg_dir
            .join(partition.to_string())
            .join(if seq { SEQ_DIR } else { UNSEQ_DIR });
        fs::create_dir_all(&dir)?;
        let path = dir.join(data_file_name(version, 0));
        let processor = Arc::new(TsFileProcessor::create(
            &path,
            seq,
            partition,
            version,
            self.writer_config(),
        )?);

        if seq {
            inner.seq_files.push(processor.resource().clone());
            sort_resources(&mut inner.seq_files);
        } else {
            inner.unseq_files.push(processor.resource().clone());
            sort_resources(&mut inner.unseq_files);
        }
        let map = if seq {
            &mut inner.working_seq
        } else {
            &mut inner.working_unseq
        };
        map.insert(partition, processor.clone());
        Ok(processor)
    }

    // ---------------------------------------------------------------
    // close lifecycle

    fn async_close_slot(&self, inner: &mut SgInner, partition: i64, seq: bool) {
        let map = if seq {
            &mut inner.working_seq
        } else {
            &mut inner.working_unseq
        };
        let Some(processor) = map.remove(&partition) else {
            return;
        };
        if processor.is_empty() {
            // nothing was written; drop the file instead of sealing it
            remove_empty_processor(inner, &processor);
            return;
        }
        let receiver = processor.async_close(&self.flush_manager);
        inner.closing.push((processor, receiver));
    }

    fn enforce_unseq_ceiling(&self, inner: &mut SgInner, partition: i64) {
        let unsealed = inner
            .unseq_files
            .iter()
            .filter(|r| !r.is_closed() && !r.is_deleted())
            .filter(|r| {
                r.time_partition(self.config.partition_interval_ms).ok() == Some(partition)
            })
            .count();
        if unsealed > self.config.unseq_files_per_partition_max {
            warn!(
                group = %self.name,
                partition,
                unsealed,
                "unsequence ceiling hit, force closing"
            );
            self.async_close_slot(inner, partition, false);
        }
    }

    fn prune_closing(&self, inner: &mut SgInner) {
        let mut failed = false;
        inner.closing.retain(|(processor, receiver)| {
            match receiver.try_recv() {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    error!(path = %processor.path().display(), "flush failed: {e}");
                    failed = true;
                    false
                }
                Err(_) => true,
            }
        });
        if failed {
            inner.flush_failed = true;
        }
    }

    /// Requests an asynchronous close of every working file.
    pub fn async_close_all_working(&self) {
        let mut inner = self.inner.write();
        let partitions: Vec<(i64, bool)> = inner
            .working_seq
            .keys()
            .map(|p| (*p, true))
            .chain(inner.working_unseq.keys().map(|p| (*p, false)))
            .collect();
        for (partition, seq) in partitions {
            self.async_close_slot(&mut inner, partition, seq);
        }
    }

    /// Closes every working file and blocks until all seals finish.
    pub fn sync_close_all_working(&self) -> Result<()> {
        self.async_close_all_working();
        let waiting = {
            let mut inner = self.inner.write();
            std::mem::take(&mut inner.closing)
        };
        let mut first_error = None;
        for (processor, receiver) in waiting {
            match receiver.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(path = %processor.path().display(), "flush failed: {e}");
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(DenError::WriteProcess(format!(
                        "flush worker dropped while sealing {}",
                        processor.path().display()
                    )));
                }
            }
        }
        match first_error {
            Some(e) => {
                self.inner.write().flush_failed = true;
                Err(e)
            }
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------
    // delete

    /// Appends a tombstone to every overlapping file and marks the delete
    /// in every live memtable.
    pub fn delete(&self, device: &str, measurement: &str, upper_bound: i64) -> Result<()> {
        let inner = self.inner.write();
        let version = self.version_controller.curr_version();
        let deletion = Deletion::new(device, measurement, version, upper_bound);

        for resource in inner.seq_files.iter().chain(inner.unseq_files.iter()) {
            if resource.is_deleted() || !resource.contains_device(device) {
                continue;
            }
            if resource.start_time(device).map(|s| s > upper_bound).unwrap_or(true) {
                continue;
            }
            resource.with_mod_file(|mods| mods.append(deletion.clone()))?;
        }

        for processor in inner
            .working_seq
            .values()
            .chain(inner.working_unseq.values())
            .chain(inner.closing.iter().map(|(p, _)| p))
        {
            processor.delete_in_mem(&deletion);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // query

    /// Builds a query snapshot: ordered sequence and unsequence resource
    /// views with unsealed memtable snapshots attached. Each view holds
    /// its file's read lock until dropped.
    pub fn query(
        &self,
        device: &str,
        measurement: &str,
        time_filter: Option<TimeRange>,
    ) -> Result<QueryDataSource> {
        let inner = self.inner.read();
        let seq = self.collect_views(&inner, &inner.seq_files, device, measurement, &time_filter);
        let unseq =
            self.collect_views(&inner, &inner.unseq_files, device, measurement, &time_filter);
        Ok(QueryDataSource {
            device: device.to_string(),
            measurement: measurement.to_string(),
            time_filter,
            seq,
            unseq,
        })
    }

    fn collect_views(
        &self,
        inner: &SgInner,
        resources: &[Arc<TsFileResource>],
        device: &str,
        measurement: &str,
        time_filter: &Option<TimeRange>,
    ) -> Vec<ResourceView> {
        let mut views = Vec::new();
        for resource in resources {
            if resource.is_deleted() || !resource.contains_device(device) {
                continue;
            }
            if let Some(filter) = time_filter {
                if !resource.overlaps(device, filter) {
                    continue;
                }
            }
            let (mem_chunks, unsealed_chunks) = if resource.is_closed() {
                (Vec::new(), Vec::new())
            } else {
                match find_processor(inner, resource.path()) {
                    Some(processor) => processor.query(device, measurement),
                    None => (Vec::new(), Vec::new()),
                }
            };
            views.push(ResourceView::new(
                resource.clone(),
                mem_chunks,
                unsealed_chunks,
            ));
        }
        views
    }

    /// Sealed sequence resources, for inspection and tests.
    pub fn seq_file_resources(&self) -> Vec<Arc<TsFileResource>> {
        self.inner
            .read()
            .seq_files
            .iter()
            .filter(|r| !r.is_deleted())
            .cloned()
            .collect()
    }

    /// Sealed unsequence resources, for inspection and tests.
    pub fn unseq_file_resources(&self) -> Vec<Arc<TsFileResource>> {
        self.inner
            .read()
            .unseq_files
            .iter()
            .filter(|r| !r.is_deleted())
            .cloned()
            .collect()
    }

    /// The metadata cache this group reads through.
    pub fn cache(&self) -> &Arc<ChunkMetadataCache> {
        &self.cache
    }

    /// Path of the merge log.
    pub fn merge_log_path(&self) -> PathBuf {
        self.sg_dir.join(crate::merge::MERGE_LOG_NAME)
    }

    // ---------------------------------------------------------------
    // merge

    /// Selects merge candidates under the configured budget and submits a
    /// merge task. The returned channel fires when the merge ends.
    pub fn merge(&self, full_merge: bool) -> Receiver<Result<()>> {
        let (tx, rx) = bounded(1);
        let (seq, unseq) = {
            let inner = self.inner.read();
            (inner.seq_files.clone(), inner.unseq_files.clone())
        };

        let selection = self.config.merge_strategy.select_files(
            &seq,
            &unseq,
            self.config.merge_memory_budget,
            self.config.time_lower_bound,
            self.config.partition_interval_ms,
        );
        let resource = match selection {
            Ok(resource) if resource.unseq_files.is_empty() => {
                let _ = tx.send(Ok(()));
                return rx;
            }
            Ok(resource) => resource,
            Err(e) => {
                let _ = tx.send(Err(e));
                return rx;
            }
        };

        // mark the inputs before the task is queued, so a second merge
        // request cannot select them again
        for input in resource.seq_files.iter().chain(resource.unseq_files.iter()) {
            input.set_merging(true);
        }

        let task = MergeTask {
            resource,
            sys_dir: self.sg_dir.clone(),
            strategy: self.config.merge_strategy,
            full_merge,
            writer_config: self.writer_config(),
        };
        let inner_arc = self.inner.clone();
        let cache = self.cache.clone();
        self.merge_manager.submit(move || {
            let result = task.execute().map(|outcome| {
                let mut inner = inner_arc.write();
                apply_merge_outcome(&mut inner, &outcome, &cache);
            });
            let _ = tx.send(result);
        });
        rx
    }
}

fn sort_resources(resources: &mut [Arc<TsFileResource>]) {
    resources.sort_by_key(|r| {
        let (version, merge_cnt) = parse_file_name(r.path()).unwrap_or((0, 0));
        (version, merge_cnt)
    });
}

fn find_processor<'a>(inner: &'a SgInner, path: &Path) -> Option<&'a Arc<TsFileProcessor>> {
    inner
        .working_seq
        .values()
        .chain(inner.working_unseq.values())
        .chain(inner.closing.iter().map(|(p, _)| p))
        .find(|p| p.path() == path)
}

fn remove_empty_processor(inner: &mut SgInner, processor: &Arc<TsFileProcessor>) {
    let path = processor.path().to_path_buf();
    if let Err(e) = processor.resource().remove() {
        warn!(path = %path.display(), "cannot remove empty file: {e}");
    }
    inner.seq_files.retain(|r| r.path() != path);
    inner.unseq_files.retain(|r| r.path() != path);
}

fn apply_merge_outcome(inner: &mut SgInner, outcome: &MergeOutcome, cache: &ChunkMetadataCache) {
    for removed in outcome
        .removed_unseq
        .iter()
        .chain(outcome.removed_seq.iter())
    {
        cache.remove(removed);
        inner.seq_files.retain(|r| r.path() != removed.path());
        inner.unseq_files.retain(|r| r.path() != removed.path());
    }
    for rewritten in &outcome.rewritten_seq {
        cache.remove(rewritten);
    }
    for new_resource in &outcome.new_seq {
        inner.seq_files.push(new_resource.clone());
    }
    sort_resources(&mut inner.seq_files);
}
