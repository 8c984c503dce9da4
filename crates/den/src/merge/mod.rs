//! Merge engine: file selection, chunk-level merge, the merge log and
//! crash recovery of in-progress merges.

pub mod log;
pub mod recover;
pub mod selector;
pub mod task;

pub use log::{LogAnalyzer, MergeLogState, MergeLogger, MergeStatus, MERGE_LOG_NAME};
pub use recover::recover_merge;
pub use task::{MergeOutcome, MergeTask, MERGE_SUFFIX};

use crate::engine::TsFileResource;
use crate::error::Result;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

/// How merged output replaces its inputs.
///
/// The three strategies share only the selector budget protocol, so they
/// are a plain tagged variant rather than a trait hierarchy: each arm
/// supplies its file selection, execution and recovery behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Rewrite affected sequence files in place, conserving file names
    /// and version fingerprints.
    #[default]
    Inplace,
    /// Write one new sequence file and decommission the inputs.
    Squeeze,
    /// Squeeze variant whose selector minimizes write amplification by
    /// preferring small files.
    IndependenceSize,
}

impl MergeStrategy {
    /// Selects merge inputs under the memory budget.
    pub fn select_files(
        &self,
        seq: &[Arc<TsFileResource>],
        unseq: &[Arc<TsFileResource>],
        memory_budget: usize,
        time_lower_bound: i64,
        partition_interval_ms: i64,
    ) -> Result<MergeResource> {
        selector::select_files(
            *self,
            seq,
            unseq,
            memory_budget,
            time_lower_bound,
            partition_interval_ms,
        )
    }
}

/// The files owned by one merge task.
#[derive(Debug, Default, Clone)]
pub struct MergeResource {
    /// Selected sequence inputs, in file-name order.
    pub seq_files: Vec<Arc<TsFileResource>>,
    /// Selected unsequence inputs.
    pub unseq_files: Vec<Arc<TsFileResource>>,
}

impl MergeResource {
    /// Whether nothing was selected.
    pub fn is_empty(&self) -> bool {
        self.unseq_files.is_empty() && self.seq_files.is_empty()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serialized submission front of the merge worker pool.
///
/// The mutex is held only while enqueueing; running tasks are
/// independent.
#[derive(Debug)]
pub struct MergeManager {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
}

impl MergeManager {
    /// Starts the pool.
    pub fn start(workers: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..workers.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("den-merge-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawn merge worker")
            })
            .collect();
        Self {
            tx: Mutex::new(Some(tx)),
            workers,
        }
    }

    /// Submits a merge job.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Stops the pool, draining queued tasks first.
    pub fn stop(&mut self) {
        self.tx.lock().take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for MergeManager {
    fn drop(&mut self) {
        self.stop();
    }
}
