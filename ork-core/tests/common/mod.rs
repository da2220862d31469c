#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use ork_core::Job;

pub fn setup() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Clone)]
pub struct Entry {
    pub name: String,
    pub thread: ThreadId,
    pub thread_name: Option<String>,
}

/// Shared execution log of the jobs created from it.
#[derive(Clone, Default)]
pub struct Log {
    entries: Arc<Mutex<Vec<Entry>>>,
    begins: Arc<AtomicUsize>,
    gpu_active: Arc<AtomicBool>,
    gpu_overlaps: Arc<AtomicUsize>,
}

impl Log {
    pub fn job(&self, name: &str) -> Logged {
        Logged {
            name: name.to_owned(),
            log: self.clone(),
            changes: true,
            work: Duration::ZERO,
        }
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.entries().iter().filter(|e| e.name == name).count()
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn gpu_overlaps(&self) -> usize {
        self.gpu_overlaps.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
        self.begins.store(0, Ordering::SeqCst);
    }
}

/// Appends its name and thread to the log when run.
pub struct Logged {
    name: String,
    log: Log,
    changes: bool,
    work: Duration,
}

impl Logged {
    pub fn unchanged(mut self) -> Self {
        self.changes = false;
        self
    }

    pub fn working(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    /// Marks the execution as exclusive GPU work: overlapping executions are counted.
    pub fn gpu(self) -> GpuLogged {
        GpuLogged(self)
    }

    fn record(&self) {
        if !self.work.is_zero() {
            std::thread::sleep(self.work);
        }
        self.log.entries.lock().unwrap().push(Entry {
            name: self.name.clone(),
            thread: std::thread::current().id(),
            thread_name: std::thread::current().name().map(str::to_owned),
        });
    }
}

impl Job for Logged {
    fn run(&mut self) -> bool {
        self.record();
        self.changes
    }
}

pub struct GpuLogged(Logged);

impl Job for GpuLogged {
    fn run(&mut self) -> bool {
        let log = &self.0.log;
        if log.gpu_active.swap(true, Ordering::SeqCst) {
            log.gpu_overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.0.record();
        log.gpu_active.store(false, Ordering::SeqCst);
        self.0.changes
    }

    fn begin(&mut self) {
        self.0.log.begins.fetch_add(1, Ordering::SeqCst);
    }
}
