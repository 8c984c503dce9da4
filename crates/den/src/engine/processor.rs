//! Processor of one unsealed file: owns the working memtable, at most one
//! flushing memtable, and the file's writer until seal.

use crate::dts::writer::WriterConfig;
use crate::dts::{ChunkMetadata, DtsWriter};
use crate::engine::memtable::{MemTable, ReadOnlyMemChunk};
use crate::engine::modification::Deletion;
use crate::engine::resource::TsFileResource;
use crate::engine::{FlushManager, InsertPlan};
use crate::error::{DenError, Result};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};

/// Attempts before a flush failure is escalated.
const FLUSH_RETRIES: usize = 3;

struct ProcState {
    working: Option<MemTable>,
    flushing: Option<Arc<MemTable>>,
    /// Tombstones that raced in while the flushing memtable was on its way
    /// to disk; applied to its query snapshots until the flush ends.
    flushing_deletions: Vec<Deletion>,
    writer: Option<DtsWriter>,
    closing: bool,
}

/// Owner of one unsealed data file.
pub struct TsFileProcessor {
    path: PathBuf,
    seq: bool,
    partition: i64,
    resource: Arc<TsFileResource>,
    state: Mutex<ProcState>,
}

impl TsFileProcessor {
    /// Creates the file, its writer, its resource and an empty working
    /// memtable carrying `memtable_version`.
    pub fn create(
        path: &Path,
        seq: bool,
        partition: i64,
        memtable_version: u64,
        writer_config: WriterConfig,
    ) -> Result<Self> {
        let writer = DtsWriter::create(path, writer_config)?;
        let resource = Arc::new(TsFileResource::new(path));
        Ok(Self {
            path: path.to_path_buf(),
            seq,
            partition,
            resource,
            state: Mutex::new(ProcState {
                working: Some(MemTable::new(memtable_version)),
                flushing: None,
                flushing_deletions: Vec::new(),
                writer: Some(writer),
                closing: false,
            }),
        })
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this file belongs to the sequence population.
    pub fn is_seq(&self) -> bool {
        self.seq
    }

    /// Time partition of the file.
    pub fn partition(&self) -> i64 {
        self.partition
    }

    /// The file's resource descriptor.
    pub fn resource(&self) -> &Arc<TsFileResource> {
        &self.resource
    }

    /// Byte size of the working memtable.
    pub fn memtable_size(&self) -> usize {
        self.state
            .lock()
            .working
            .as_ref()
            .map(|m| m.memory_size())
            .unwrap_or(0)
    }

    /// Whether nothing has been written to the file or its memtables.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.working.as_ref().map(|m| m.is_empty()).unwrap_or(true)
            && state.flushing.is_none()
            && state
                .writer
                .as_ref()
                .map(|w| w.chunk_groups().is_empty())
                .unwrap_or(true)
    }

    /// Appends one row to the working memtable.
    ///
    /// A sequence file refuses timestamps below the device's current
    /// maximum; an equal timestamp overwrites, newest wins.
    pub fn insert(&self, plan: &InsertPlan) -> Result<()> {
        plan.check_schema()?;
        let mut state = self.state.lock();
        if state.closing {
            return Err(DenError::WriteProcess(format!(
                "file {} is closing",
                self.path.display()
            )));
        }
        if self.seq {
            if let Some(end) = self.resource.end_time(&plan.device) {
                if plan.timestamp < end {
                    return Err(DenError::WriteProcess(format!(
                        "timestamp {} violates sequence ordering of {} (device max {end})",
                        plan.timestamp, plan.device
                    )));
                }
            }
        }
        let working = state
            .working
            .as_mut()
            .expect("working memtable present while not closing");
        for (schema, value) in &plan.values {
            working.write(&plan.device, plan.timestamp, schema, value.clone());
        }
        self.resource.update_start_time(&plan.device, plan.timestamp);
        self.resource.update_end_time(&plan.device, plan.timestamp);
        Ok(())
    }

    /// Applies a delete to the in-memory side of this file.
    ///
    /// The working memtable drops the samples outright; a flushing
    /// memtable records the tombstone for the duration of the flush, after
    /// which the `.mods` record covers its chunks.
    pub fn delete_in_mem(&self, deletion: &Deletion) {
        let mut state = self.state.lock();
        if let Some(working) = state.working.as_mut() {
            working.delete(&deletion.device, &deletion.measurement, deletion.upper_bound);
        }
        if state.flushing.is_some() {
            state.flushing_deletions.push(deletion.clone());
        }
    }

    /// Query view of the unsealed file: read-only memtable snapshots plus
    /// the chunk metadata already visible in the file.
    pub fn query(&self, device: &str, measurement: &str) -> (Vec<ReadOnlyMemChunk>, Vec<ChunkMetadata>) {
        let state = self.state.lock();
        let chunks = state
            .writer
            .as_ref()
            .map(|w| w.visible_chunk_metadata(device, measurement))
            .unwrap_or_default();
        let mut mem_chunks = Vec::new();
        if let Some(flushing) = &state.flushing {
            if let Some(mut chunk) = flushing.snapshot(device, measurement) {
                let relevant: Vec<Deletion> = state
                    .flushing_deletions
                    .iter()
                    .filter(|d| d.device == device && d.measurement == measurement)
                    .cloned()
                    .collect();
                chunk.apply_deletions(&relevant);
                if !chunk.is_empty() {
                    mem_chunks.push(chunk);
                }
            }
        }
        if let Some(working) = &state.working {
            if let Some(chunk) = working.snapshot(device, measurement) {
                mem_chunks.push(chunk);
            }
        }
        (mem_chunks, chunks)
    }

    /// Schedules flush-then-seal and returns the completion channel.
    ///
    /// The working memtable swaps into the flushing slot immediately; the
    /// worker writes its chunk groups, appends the version record, seals
    /// the file, persists the side-car and marks the resource closed.
    pub fn async_close(self: &Arc<Self>, flush_manager: &FlushManager) -> Receiver<Result<()>> {
        let (tx, rx) = bounded(1);
        {
            let mut state = self.state.lock();
            if state.closing {
                warn!(path = %self.path.display(), "close requested twice");
            }
            state.closing = true;
            if let Some(working) = state.working.take() {
                if !working.is_empty() {
                    state.flushing = Some(Arc::new(working));
                }
            }
        }
        self.resource.set_close_flag();
        let processor = self.clone();
        flush_manager.submit(move || {
            let mut result = Ok(());
            for attempt in 1..=FLUSH_RETRIES {
                result = processor.flush_and_seal();
                match &result {
                    Ok(()) => break,
                    Err(e) => {
                        error!(
                            path = %processor.path.display(),
                            attempt,
                            "flush failed: {e}"
                        );
                    }
                }
            }
            let _ = tx.send(result);
        });
        rx
    }

    fn flush_and_seal(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| DenError::WriteProcess("file already sealed".to_string()))?;

        // a retry after a failure during sealing skips straight to the
        // side-car steps; one after a failure mid-write rolls the file
        // back to the pre-attempt boundary first
        if !writer.is_sealed() {
            let checkpoint = writer.checkpoint();
            if let Err(e) = Self::write_flushing_and_seal(writer, state.flushing.as_deref()) {
                if let Err(rollback) = writer.rollback_to(checkpoint) {
                    error!(path = %self.path.display(), "rollback failed: {rollback}");
                }
                return Err(e);
            }
        }

        let version = writer
            .max_version()
            .unwrap_or_else(|| self.resource.max_version());
        self.resource
            .add_historical_versions(std::iter::once(version));
        self.resource.serialize()?;

        state.writer = None;
        state.flushing = None;
        state.flushing_deletions.clear();
        drop(guard);

        self.resource.set_closed(true);
        self.resource.clean_close_flag();
        Ok(())
    }

    fn write_flushing_and_seal(writer: &mut DtsWriter, flushing: Option<&MemTable>) -> Result<()> {
        if let Some(memtable) = flushing {
            // devices in sorted order to aid readers
            for device in memtable.devices() {
                writer.start_chunk_group(&device);
                for (measurement, series) in memtable.series_of(&device) {
                    let samples: Vec<_> = series
                        .points
                        .iter()
                        .map(|(ts, value)| (*ts, value.clone()))
                        .collect();
                    writer.write_chunk(
                        measurement,
                        series.schema.data_type,
                        series.schema.encoding,
                        series.schema.compression,
                        &samples,
                    )?;
                }
                writer.end_chunk_group()?;
            }
            writer.write_version(memtable.version())?;
            writer.sync()?;
        }
        writer.seal()
    }
}
