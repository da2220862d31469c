use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{Error, Result};

pub type WorkerId = usize;

/// Where workers take their jobs from.
pub(crate) trait JobSource: Send + Sync + 'static {
    type Job;

    /// Block until a job is available. `None` tells the worker to exit.
    fn next_job(&self, worker: WorkerId) -> Option<Self::Job>;

    fn execute(&self, worker: WorkerId, job: Self::Job);
}

struct Worker {
    thread: JoinHandle<()>,
}

impl Worker {
    fn new<S: JobSource>(thread_name_prefix: &str, id: WorkerId, source: Arc<S>) -> Result<Worker> {
        let thread = std::thread::Builder::new()
            .name(format!("{} {}", thread_name_prefix, id))
            .spawn(move || {
                while let Some(job) = source.next_job(id) {
                    source.execute(id, job);
                }
            })
            .map_err(Error::ThreadSpawn)?;
        Ok(Worker { thread })
    }
}

/// A fixed set of worker threads living as long as the pool.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub(crate) fn new<S: JobSource>(name: &str, num_workers: usize, source: Arc<S>) -> Result<Self> {
        let workers = (0..num_workers)
            .map(|id| Worker::new(name, id, source.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(WorkerPool { workers })
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Wait for all workers to exit. The job source must already report `None` to every worker.
    pub(crate) fn join(&mut self) {
        for (id, w) in self.workers.drain(..).enumerate() {
            if w.thread.join().is_err() {
                tracing::warn!("Worker {} panicked", id);
            }
        }
    }
}
