use std::collections::BTreeMap;
use std::sync::{Mutex, Weak};

use derive_more::Deref;

use crate::task::{Reason, Task, TaskId, TaskListener, TaskRef};
use crate::util::{lock, Map, Set};

/// Sub-tasks and dependencies of a task graph.
///
/// `dependencies` maps a task to the tasks it must run after, `inverse_dependencies` maps a task
/// to the tasks that must run after it. `first` holds the tasks without predecessor in this
/// graph, `last` the tasks without successor.
#[derive(Default)]
struct GraphInner {
    tasks: BTreeMap<TaskId, TaskRef>,
    first: Set<TaskId>,
    last: Set<TaskId>,
    dependencies: Map<TaskId, Set<TaskId>>,
    inverse_dependencies: Map<TaskId, Set<TaskId>>,
}

impl GraphInner {
    fn resolve<'a>(&self, ids: impl IntoIterator<Item = &'a TaskId>) -> Vec<TaskRef> {
        let mut tasks = ids
            .into_iter()
            .map(|id| self.tasks[id].clone())
            .collect::<Vec<_>>();
        tasks.sort_by_key(|t| t.id());
        tasks
    }

    fn unlink(&mut self, src: TaskId, dst: TaskId) {
        if let Some(deps) = self.dependencies.get_mut(&src) {
            deps.remove(&dst);
            if deps.is_empty() {
                self.dependencies.remove(&src);
                self.first.insert(src);
            }
        }
        if let Some(inv) = self.inverse_dependencies.get_mut(&dst) {
            inv.remove(&src);
            if inv.is_empty() {
                self.inverse_dependencies.remove(&dst);
                self.last.insert(dst);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct GraphData {
    inner: Mutex<GraphInner>,
}

impl GraphData {
    pub(crate) fn tasks(&self) -> Vec<TaskRef> {
        lock(&self.inner).tasks.values().cloned().collect()
    }

    pub(crate) fn first_tasks(&self) -> Vec<TaskRef> {
        let inner = lock(&self.inner);
        inner.resolve(&inner.first)
    }

    pub(crate) fn last_tasks(&self) -> Vec<TaskRef> {
        let inner = lock(&self.inner);
        inner.resolve(&inner.last)
    }

    pub(crate) fn predecessors(&self, id: TaskId) -> Vec<TaskRef> {
        let inner = lock(&self.inner);
        match inner.dependencies.get(&id) {
            Some(deps) => inner.resolve(deps),
            None => Vec::new(),
        }
    }

    pub(crate) fn successors(&self, id: TaskId) -> Vec<TaskRef> {
        let inner = lock(&self.inner);
        match inner.inverse_dependencies.get(&id) {
            Some(inv) => inner.resolve(inv),
            None => Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.inner).tasks.is_empty()
    }

    pub(crate) fn invalidate(&self, reason: Reason) {
        let targets = if reason == Reason::DependencyChanged {
            self.tasks()
        } else {
            self.last_tasks()
        };
        for t in targets {
            t.set_is_done(false, 0, reason);
        }
    }

    pub(crate) fn task_state_changed(&self, graph: &Task, task: &Task, done: bool, reason: Reason) {
        if !done {
            if reason != Reason::DataNeeded {
                for s in self.successors(task.id()) {
                    s.set_is_done(false, 0, Reason::DependencyChanged);
                }
            }
            graph.set_state(false, 0, reason);
        } else {
            self.completion_date_changed(graph, task, task.completion_date());
            if self.tasks().iter().all(|t| t.is_done()) {
                graph.set_state(true, graph.completion_date(), reason);
            }
        }
    }

    pub(crate) fn completion_date_changed(&self, graph: &Task, task: &Task, date: u64) {
        graph.raise_completion_date(date);
        let successors = self.successors(task.id());
        if successors.is_empty() {
            for l in graph.live_listeners() {
                l.completion_date_changed(graph, date);
            }
        } else {
            for s in successors {
                s.set_predecessors_completion_date(date);
            }
        }
    }
}

/// A composite task: a set of sub-tasks with dependencies among them.
///
/// A graph does not own the identity of its sub-tasks: the same task may belong to several
/// graphs. A graph is done iff all its sub-tasks are done.
#[derive(Clone, Deref)]
pub struct TaskGraph(TaskRef);

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGraph {
    /// A graph whose sub-tasks are needed in the current frame.
    pub fn new() -> Self {
        Self::with_deadline(0)
    }

    pub fn with_deadline(deadline: u32) -> Self {
        TaskGraph(Task::new_graph(deadline))
    }

    pub fn from_task(task: &TaskRef) -> Option<Self> {
        task.is_graph().then(|| TaskGraph(task.clone()))
    }

    pub fn task(&self) -> &TaskRef {
        &self.0
    }

    pub fn into_task(self) -> TaskRef {
        self.0
    }

    fn data(&self) -> &GraphData {
        // Only constructed from graph tasks.
        self.0.graph().unwrap()
    }

    fn listener(&self) -> Weak<dyn TaskListener> {
        self.0.me()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.data().inner).tasks.len()
    }

    pub fn contains(&self, t: &Task) -> bool {
        lock(&self.data().inner).tasks.contains_key(&t.id())
    }

    pub fn tasks(&self) -> Vec<TaskRef> {
        self.data().tasks()
    }

    pub fn first_tasks(&self) -> Vec<TaskRef> {
        self.data().first_tasks()
    }

    pub fn last_tasks(&self) -> Vec<TaskRef> {
        self.data().last_tasks()
    }

    /// The tasks `t` must run after.
    pub fn dependencies(&self, t: &Task) -> Vec<TaskRef> {
        self.data().predecessors(t.id())
    }

    /// The tasks that must run after `t`.
    pub fn inverse_dependencies(&self, t: &Task) -> Vec<TaskRef> {
        self.data().successors(t.id())
    }

    /// Add a task (possibly a graph itself). It is a first and a last task until dependencies
    /// are added.
    pub fn add_task(&self, t: &TaskRef) {
        if let Some(g) = t.graph() {
            assert!(!g.is_empty(), "Tried to add empty task graph {:?}", t);
        }
        assert!(t.id() != self.0.id(), "Tried to add task graph to itself");
        let inserted = {
            let mut inner = lock(&self.data().inner);
            if inner.tasks.insert(t.id(), t.clone()).is_none() {
                inner.first.insert(t.id());
                inner.last.insert(t.id());
                true
            } else {
                false
            }
        };
        if inserted {
            t.add_listener(self.listener());
        }
    }

    /// Remove a task. The task must not have any dependencies in this graph.
    pub fn remove_task(&self, t: &TaskRef) {
        let removed = {
            let mut inner = lock(&self.data().inner);
            assert!(
                !inner.dependencies.contains_key(&t.id())
                    && !inner.inverse_dependencies.contains_key(&t.id()),
                "Tried to remove {:?}, which still has dependencies",
                t
            );
            inner.first.remove(&t.id());
            inner.last.remove(&t.id());
            inner.tasks.remove(&t.id()).is_some()
        };
        if removed {
            t.remove_listener(&self.listener());
        }
    }

    /// Add a dependency: `src` must run after `dst`.
    pub fn add_dependency(&self, src: &TaskRef, dst: &TaskRef) {
        let mut inner = lock(&self.data().inner);
        assert!(
            inner.tasks.contains_key(&src.id()) && inner.tasks.contains_key(&dst.id()),
            "Tried to add dependency {:?} -> {:?} between tasks not in the graph",
            src,
            dst
        );
        inner.first.remove(&src.id());
        inner.last.remove(&dst.id());
        inner
            .dependencies
            .entry(src.id())
            .or_default()
            .insert(dst.id());
        inner
            .inverse_dependencies
            .entry(dst.id())
            .or_default()
            .insert(src.id());
    }

    pub fn remove_dependency(&self, src: &TaskRef, dst: &TaskRef) {
        lock(&self.data().inner).unlink(src.id(), dst.id());
    }

    /// Remove all dependencies of `src` and return the tasks it depended on.
    pub fn remove_and_get_dependencies(&self, src: &TaskRef) -> Vec<TaskRef> {
        let mut inner = lock(&self.data().inner);
        let Some(deps) = inner.dependencies.get(&src.id()).cloned() else {
            return Vec::new();
        };
        let removed = inner.resolve(&deps);
        for dst in deps {
            inner.unlink(src.id(), dst);
        }
        removed
    }

    /// Remove all dependencies: every task becomes a first and a last task.
    pub fn clear_dependencies(&self) {
        let mut inner = lock(&self.data().inner);
        inner.dependencies.clear();
        inner.inverse_dependencies.clear();
        let ids = inner.tasks.keys().copied().collect::<Vec<_>>();
        inner.first = ids.iter().copied().collect();
        inner.last = ids.into_iter().collect();
    }
}

impl From<TaskGraph> for TaskRef {
    fn from(g: TaskGraph) -> Self {
        g.0
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("task", &self.0)
            .field("tasks", &self.tasks())
            .finish()
    }
}
