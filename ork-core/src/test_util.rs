use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::task::{Job, Reason, Task, TaskId, TaskListener};
use crate::util::lock;

/// Records every state flip it is notified about.
#[derive(Default)]
pub struct RecordingListener {
    states: Mutex<Vec<(TaskId, bool)>>,
    dates: Mutex<Vec<(TaskId, u64)>>,
}

impl RecordingListener {
    pub fn states(&self) -> Vec<(TaskId, bool)> {
        lock(&self.states).clone()
    }

    pub fn dates(&self) -> Vec<(TaskId, u64)> {
        lock(&self.dates).clone()
    }
}

impl TaskListener for RecordingListener {
    fn task_state_changed(&self, task: &Task, done: bool, _reason: Reason) {
        lock(&self.states).push((task.id(), done));
    }

    fn completion_date_changed(&self, task: &Task, date: u64) {
        lock(&self.dates).push((task.id(), date));
    }
}

#[derive(Clone, Default)]
pub struct Counter {
    runs: Arc<AtomicUsize>,
    inits: Arc<AtomicUsize>,
}

impl Counter {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }
}

/// Counts how often it is run and initialized.
pub struct CountingJob {
    counter: Counter,
    result: bool,
}

impl CountingJob {
    pub fn new() -> (Self, Counter) {
        Self::with_result(true)
    }

    /// A job whose runs report `result` as "result changed".
    pub fn with_result(result: bool) -> (Self, Counter) {
        let counter = Counter::default();
        (
            CountingJob {
                counter: counter.clone(),
                result,
            },
            counter,
        )
    }
}

impl Job for CountingJob {
    fn run(&mut self) -> bool {
        self.counter.runs.fetch_add(1, Ordering::SeqCst);
        self.result
    }

    fn init(&mut self) {
        self.counter.inits.fetch_add(1, Ordering::SeqCst);
    }
}

/// A job claiming to be `n` times as expensive as a typical task of its kind.
pub struct Weighted(pub u32);

impl Job for Weighted {
    fn complexity(&self) -> u32 {
        self.0
    }
}
