use std::sync::Mutex;
use std::time::Duration;

use crate::util::{lock, Map};

/// Number of samples a task kind needs before its duration estimate is trusted.
pub const MIN_SAMPLES: u64 = 64;

#[derive(Clone, Debug, Default)]
struct Bucket {
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
    n: u64,
    corrected: bool,
}

impl Bucket {
    fn add(&mut self, us: f64) {
        if self.n == 0 && !self.corrected {
            self.min = us;
            self.max = us;
        } else {
            self.min = self.min.min(us);
            self.max = self.max.max(us);
        }
        self.sum += us;
        self.sum_sq += us * us;
        self.n += 1;
    }

    fn trusted(&self) -> bool {
        self.corrected || self.n >= MIN_SAMPLES
    }

    // The first samples of a kind are usually outliers (cold caches, lazy initialization), so one
    // minimum and one maximum sample are dropped exactly once.
    fn correct(&mut self) {
        if !self.corrected {
            self.sum -= self.min + self.max;
            self.sum_sq -= self.min * self.min + self.max * self.max;
            self.n -= 2;
            self.corrected = true;
        }
    }

    fn estimate_us(&self) -> f64 {
        let n = self.n as f64;
        let mean = self.sum / n;
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        mean + 2.0 * variance.sqrt()
    }
}

/// Summary of the durations recorded for one task kind, normalized to complexity 1.
///
/// `samples` and `mean` exclude the two outliers dropped by the first trusted estimate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct KindStatistics {
    pub samples: u64,
    pub mean: Duration,
    /// Shortest sample ever recorded, dropped outlier included.
    pub min: Duration,
    /// Longest sample ever recorded, dropped outlier included.
    pub max: Duration,
}

/// Running execution-time statistics, one bucket per task kind.
///
/// The registry is shared between the scheduler's threads and guarded by its own lock, distinct
/// from the scheduler state lock.
#[derive(Default)]
pub struct TaskStatistics {
    buckets: Mutex<Map<String, Bucket>>,
}

impl TaskStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an actual execution time. The duration is divided by `complexity` so that all
    /// samples of a kind describe a complexity-1 task.
    pub fn record(&self, kind: &str, duration: Duration, complexity: u32) {
        let us = duration.as_secs_f64() * 1e6 / complexity.max(1) as f64;
        let mut buckets = lock(&self.buckets);
        match buckets.get_mut(kind) {
            Some(b) => b.add(us),
            None => {
                let mut b = Bucket::default();
                b.add(us);
                buckets.insert(kind.to_owned(), b);
            }
        }
    }

    /// Expected duration of a complexity-1 task of the given kind (mean plus two standard
    /// deviations), or `None` while fewer than [`MIN_SAMPLES`] samples have been recorded.
    pub fn estimate(&self, kind: &str) -> Option<Duration> {
        let mut buckets = lock(&self.buckets);
        let b = buckets.get_mut(kind)?;
        if !b.trusted() {
            return None;
        }
        b.correct();
        Some(Duration::from_secs_f64(b.estimate_us().max(0.0) * 1e-6))
    }

    pub fn summary(&self, kind: &str) -> Option<KindStatistics> {
        let buckets = lock(&self.buckets);
        let b = buckets.get(kind)?;
        if b.n == 0 {
            return None;
        }
        let us = |v: f64| Duration::from_secs_f64(v.max(0.0) * 1e-6);
        Some(KindStatistics {
            samples: b.n,
            mean: us(b.sum / b.n as f64),
            min: us(b.min),
            max: us(b.max),
        })
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds = lock(&self.buckets).keys().cloned().collect::<Vec<_>>();
        kinds.sort();
        kinds
    }
}
