use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use derive_more::{Display, From};

use crate::statistics::TaskStatistics;
use crate::task_graph::GraphData;
use crate::util::{lock, IdGenerator, Set};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, From, Display)]
pub struct TaskId(u64);

/// Identity of a GPU execution context. Tasks sharing a context can be executed back to back
/// without `end`/`begin` calls in between.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, From, Display)]
pub struct ContextId(u64);

static TASK_IDS: IdGenerator<TaskId> = IdGenerator::new();
static CONTEXT_IDS: IdGenerator<ContextId> = IdGenerator::new();

impl ContextId {
    pub fn next() -> Self {
        CONTEXT_IDS.next()
    }
}

/// Why a task is marked as not done.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Reason {
    /// The result of a predecessor changed, so this task must be executed again.
    DependencyChanged,
    /// The intrinsic inputs of the task changed.
    DataChanged,
    /// The result is needed again, but its inputs may not have changed.
    DataNeeded,
}

/// The work performed by a primitive task.
///
/// `begin` and `end` set up and tear down the execution context of GPU tasks. They must behave
/// the same for all tasks of one context, so that `begin, run, run, end` over several tasks of a
/// context is equivalent to `begin, run, end` per task.
pub trait Job: Send {
    /// Execute the work. Returns true iff the result differs from the one of the previous run.
    fn run(&mut self) -> bool {
        true
    }
    fn begin(&mut self) {}
    fn end(&mut self) {}
    /// Called once before the task is scheduled.
    fn init(&mut self) {}
    /// How many times more expensive this task is than a typical task of its kind.
    fn complexity(&self) -> u32 {
        1
    }
}

/// A job that does nothing (and reports a changed result).
pub struct NoOp;

impl Job for NoOp {}

pub struct FnJob<F>(pub F);

impl<F: FnMut() -> bool + Send> Job for FnJob<F> {
    fn run(&mut self) -> bool {
        (self.0)()
    }
}

/// Receives state changes of the tasks it is registered with. Notifications are delivered
/// synchronously from the thread that caused the change.
pub trait TaskListener: Send + Sync {
    fn task_state_changed(&self, task: &Task, done: bool, reason: Reason);
    fn completion_date_changed(&self, task: &Task, date: u64);
}

pub(crate) enum Body {
    Primitive(Mutex<Box<dyn Job>>),
    Graph(GraphData),
}

struct TaskState {
    deadline: u32,
    done: bool,
    completion_date: u64,
    predecessors_completion_date: u64,
    expected_duration: Option<Duration>,
}

pub struct Task {
    id: TaskId,
    kind: String,
    gpu: bool,
    context: Option<ContextId>,
    complexity: u32,
    state: Mutex<TaskState>,
    listeners: Mutex<Vec<Weak<dyn TaskListener>>>,
    body: Body,
    me: Weak<Task>,
}

pub type TaskRef = Arc<Task>;

pub const GRAPH_KIND: &str = "TaskGraph";

impl Task {
    fn build(
        kind: String,
        gpu: bool,
        context: Option<ContextId>,
        deadline: u32,
        complexity: u32,
        body: Body,
    ) -> TaskRef {
        Arc::new_cyclic(|me| Task {
            id: TASK_IDS.next(),
            kind,
            gpu,
            context,
            complexity: complexity.max(1),
            state: Mutex::new(TaskState {
                deadline,
                done: false,
                completion_date: 0,
                predecessors_completion_date: 1,
                expected_duration: None,
            }),
            listeners: Mutex::new(Vec::new()),
            body,
            me: me.clone(),
        })
    }

    /// Create a CPU task.
    pub fn new(kind: impl Into<String>, deadline: u32, job: impl Job + 'static) -> TaskRef {
        let complexity = job.complexity();
        Self::build(
            kind.into(),
            false,
            None,
            deadline,
            complexity,
            Body::Primitive(Mutex::new(Box::new(job))),
        )
    }

    /// Create a GPU task. GPU tasks are only ever executed by the thread driving the scheduler.
    pub fn new_gpu(
        kind: impl Into<String>,
        context: Option<ContextId>,
        deadline: u32,
        job: impl Job + 'static,
    ) -> TaskRef {
        let complexity = job.complexity();
        Self::build(
            kind.into(),
            true,
            context,
            deadline,
            complexity,
            Body::Primitive(Mutex::new(Box::new(job))),
        )
    }

    pub fn from_fn(
        kind: impl Into<String>,
        deadline: u32,
        f: impl FnMut() -> bool + Send + 'static,
    ) -> TaskRef {
        Self::new(kind, deadline, FnJob(f))
    }

    pub(crate) fn new_graph(deadline: u32) -> TaskRef {
        Self::build(
            GRAPH_KIND.to_owned(),
            false,
            None,
            deadline,
            1,
            Body::Graph(GraphData::default()),
        )
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_gpu_task(&self) -> bool {
        self.gpu
    }

    pub fn context(&self) -> Option<ContextId> {
        self.context
    }

    pub fn complexity(&self) -> u32 {
        self.complexity
    }

    pub fn is_graph(&self) -> bool {
        matches!(self.body, Body::Graph(_))
    }

    pub(crate) fn graph(&self) -> Option<&GraphData> {
        match &self.body {
            Body::Graph(g) => Some(g),
            Body::Primitive(_) => None,
        }
    }

    pub(crate) fn me(&self) -> Weak<Task> {
        self.me.clone()
    }

    pub fn deadline(&self) -> u32 {
        lock(&self.state).deadline
    }

    /// Lower the deadline. A deadline is never raised once set.
    pub fn set_deadline(&self, deadline: u32) {
        let mut state = lock(&self.state);
        state.deadline = state.deadline.min(deadline);
    }

    /// Let the task prepare itself before it is scheduled. Each task is initialized at most once
    /// per `initialized` set.
    pub fn init(&self, initialized: &mut Set<TaskId>) {
        if !initialized.insert(self.id) {
            return;
        }
        match &self.body {
            Body::Primitive(job) => lock(job).init(),
            Body::Graph(g) => {
                for t in g.tasks() {
                    t.init(initialized);
                }
            }
        }
    }

    /// Execute the task. Returns true iff its result changed.
    pub fn run(&self) -> bool {
        assert!(!self.is_done(), "Tried to run {:?}, which is already done", self);
        match &self.body {
            Body::Primitive(job) => lock(job).run(),
            Body::Graph(_) => true,
        }
    }

    pub fn begin(&self) {
        if let Body::Primitive(job) = &self.body {
            lock(job).begin();
        }
    }

    pub fn end(&self) {
        if let Body::Primitive(job) = &self.body {
            lock(job).end();
        }
    }

    pub fn is_done(&self) -> bool {
        lock(&self.state).done
    }

    /// Change the completion state of the task. Listeners are notified if the state flips.
    ///
    /// The completion date is updated when the task becomes done, or when it becomes not done for
    /// a reason other than [`Reason::DependencyChanged`]. A task graph that becomes not done also
    /// invalidates its sub-tasks: all of them if a dependency changed, otherwise its last tasks.
    pub fn set_is_done(&self, done: bool, date: u64, reason: Reason) {
        self.set_state(done, date, reason);
        if let Body::Graph(g) = &self.body {
            if !done {
                g.invalidate(reason);
            }
        }
    }

    pub(crate) fn set_state(&self, done: bool, date: u64, reason: Reason) {
        let flipped = {
            let mut state = lock(&self.state);
            if state.done == done {
                false
            } else {
                state.done = done;
                if done || reason != Reason::DependencyChanged {
                    state.completion_date = date;
                }
                true
            }
        };
        if flipped {
            for l in self.live_listeners() {
                l.task_state_changed(self, done, reason);
            }
        }
    }

    pub fn completion_date(&self) -> u64 {
        lock(&self.state).completion_date
    }

    pub(crate) fn raise_completion_date(&self, date: u64) {
        let mut state = lock(&self.state);
        state.completion_date = state.completion_date.max(date);
    }

    pub fn predecessors_completion_date(&self) -> u64 {
        lock(&self.state).predecessors_completion_date
    }

    /// Record the completion date of a predecessor. The stored value never decreases. Task graphs
    /// forward the date to their first tasks.
    pub fn set_predecessors_completion_date(&self, date: u64) {
        {
            let mut state = lock(&self.state);
            state.predecessors_completion_date = state.predecessors_completion_date.max(date);
        }
        if let Body::Graph(g) = &self.body {
            for t in g.first_tasks() {
                t.set_predecessors_completion_date(date);
            }
        }
    }

    /// True if the result of the task is at least as recent as everything it depends on, i.e. a
    /// re-run would not change anything.
    pub fn is_up_to_date(&self) -> bool {
        let state = lock(&self.state);
        state.completion_date >= state.predecessors_completion_date
    }

    /// The expected execution time of this task, derived from the statistics of its kind and
    /// scaled by its complexity. Zero while the kind has too few samples.
    pub fn expected_duration(&self, statistics: &TaskStatistics) -> Duration {
        if let Some(d) = lock(&self.state).expected_duration {
            return d;
        }
        match statistics.estimate(&self.kind) {
            Some(estimate) => {
                let d = estimate * self.complexity;
                lock(&self.state).expected_duration = Some(d);
                d
            }
            None => Duration::ZERO,
        }
    }

    pub fn set_actual_duration(&self, statistics: &TaskStatistics, duration: Duration) {
        statistics.record(&self.kind, duration, self.complexity);
    }

    pub fn add_listener(&self, listener: Weak<dyn TaskListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn remove_listener(&self, listener: &Weak<dyn TaskListener>) {
        let target = listener.as_ptr().cast::<()>();
        lock(&self.listeners).retain(|l| l.as_ptr().cast::<()>() != target);
    }

    pub(crate) fn remove_listener_at(&self, target: *const ()) {
        lock(&self.listeners).retain(|l| l.as_ptr().cast::<()>() != target && l.strong_count() > 0);
    }

    pub(crate) fn live_listeners(&self) -> Vec<Arc<dyn TaskListener>> {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(|l| l.upgrade()).collect()
    }
}

impl TaskListener for Task {
    fn task_state_changed(&self, task: &Task, done: bool, reason: Reason) {
        if let Body::Graph(g) = &self.body {
            g.task_state_changed(self, task, done, reason);
        }
    }

    fn completion_date_changed(&self, task: &Task, date: u64) {
        if let Body::Graph(g) = &self.body {
            g.completion_date_changed(self, task, date);
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Body::Graph(g) = &self.body {
            let me = self as *const Task as *const ();
            for t in g.tasks() {
                t.remove_listener_at(me);
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}
