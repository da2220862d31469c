use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::{Reason, TaskRef};

/// Executes tasks while respecting their dependencies and deadlines.
pub trait Scheduler {
    /// True if this scheduler can execute tasks of the given flavor ahead of their deadline.
    fn supports_prefetch(&self, gpu_tasks: bool) -> bool;

    /// Submit a task (usually a task graph) for execution. Tasks whose deadline is not the current
    /// frame may be executed later, or declined if the prefetch queue is full.
    fn schedule(&self, task: &TaskRef) -> Result<()>;

    /// Mark a task as not done. If `reason` is [`Reason::DataNeeded`] the task and its
    /// dependencies must additionally be done by frame `deadline`.
    fn reschedule(&self, task: &TaskRef, reason: Reason, deadline: u32);

    /// Schedule `task` and execute tasks until all current-frame tasks are done. Runs GPU tasks
    /// on the calling thread.
    fn run(&self, task: &TaskRef) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Minimum number of prefetch tasks executed per frame once the immediate tasks are done.
    pub prefetch_rate: usize,
    pub prefetch_queue_size: usize,
    /// Target frame rate. 0 means uncapped.
    pub frame_rate: f32,
    /// Number of worker threads. Defaults to one less than the number of cpus.
    pub num_threads: Option<usize>,
    /// If set, worker threads only take tasks with a deadline in a future frame.
    pub strict_prefetch: bool,
    pub monitored_kinds: Vec<String>,
    pub monitor_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prefetch_rate: 0,
            prefetch_queue_size: 1_000_000,
            frame_rate: 0.0,
            num_threads: None,
            strict_prefetch: true,
            monitored_kinds: Vec::new(),
            monitor_file: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.frame_rate.is_finite() || self.frame_rate < 0.0 {
            return Err(Error::config(format!(
                "frame rate must be a non-negative number, got {}",
                self.frame_rate
            )));
        }
        if self.prefetch_queue_size == 0 {
            return Err(Error::config("prefetch queue size must be positive"));
        }
        Ok(())
    }

    pub fn prefetch_rate(mut self, rate: usize) -> Self {
        self.prefetch_rate = rate;
        self
    }

    pub fn prefetch_queue_size(mut self, size: usize) -> Self {
        self.prefetch_queue_size = size;
        self
    }

    pub fn frame_rate(mut self, rate: f32) -> Self {
        self.frame_rate = rate;
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n);
        self
    }

    pub fn strict_prefetch(mut self, strict: bool) -> Self {
        self.strict_prefetch = strict;
        self
    }

    pub fn monitor(mut self, kind: impl Into<String>) -> Self {
        self.monitored_kinds.push(kind.into());
        self
    }

    pub fn monitor_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.monitor_file = Some(path.into());
        self
    }

    pub fn worker_count(&self) -> usize {
        self.num_threads
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
    }

    pub fn frame_period(&self) -> Option<Duration> {
        (self.frame_rate > 0.0).then(|| Duration::from_secs_f64(1.0 / self.frame_rate as f64))
    }
}
