//! Flush worker pool: a task-plus-channel pipeline.
//!
//! Writers hand a flush job to the pool and receive a completion channel;
//! a sync close blocks on that channel, an async close does not. Workers
//! are plain threads draining a crossbeam channel, started and stopped
//! with the owning storage engine.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread::JoinHandle;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool of flush worker threads.
#[derive(Debug)]
pub struct FlushManager {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl FlushManager {
    /// Starts the pool with the given number of workers.
    pub fn start(workers: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..workers.max(1))
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("den-flush-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                        debug!("flush worker exits");
                    })
                    .expect("spawn flush worker")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Submits a flush job.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            // receiver outlives the sender unless the pool is stopping
            let _ = tx.send(Box::new(job));
        }
    }

    /// Stops the pool, draining queued jobs first.
    pub fn stop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for FlushManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_before_stop_returns() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = FlushManager::start(2);
        for _ in 0..16 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_completion_channel() {
        let pool = FlushManager::start(1);
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.submit(move || {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), 42);
    }
}
