pub mod error;
pub mod monitor;
pub mod runtime;
pub mod scheduler;
pub mod statistics;
pub mod task;
pub mod task_graph;
#[cfg(test)]
pub mod test_util;
pub mod threadpool;
pub mod util;

pub use error::{Error, Result};
pub use monitor::FrameRecord;
pub use runtime::{FrameStatistics, MultithreadScheduler};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use statistics::{KindStatistics, TaskStatistics};
pub use task::{ContextId, FnJob, Job, NoOp, Reason, Task, TaskId, TaskListener, TaskRef};
pub use task_graph::TaskGraph;
