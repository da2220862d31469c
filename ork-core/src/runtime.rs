use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::monitor::{FrameMonitor, FrameRecord};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::statistics::TaskStatistics;
use crate::task::{ContextId, Reason, Task, TaskId, TaskRef};
use crate::threadpool::{JobSource, WorkerId, WorkerPool};
use crate::util::{lock, Map, Set};

/// Slack subtracted from the frame period so that the frame does not end late.
const FRAME_MARGIN: Duration = Duration::from_micros(500);

/// Order of ready tasks: earliest deadline first, then grouped by execution context.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct ReadyKey {
    deadline: u32,
    context: Option<ContextId>,
    id: TaskId,
}

impl ReadyKey {
    fn of(t: &Task) -> Self {
        ReadyKey {
            deadline: t.deadline(),
            context: t.context(),
            id: t.id(),
        }
    }
}

/// What happened during one call of [`Scheduler::run`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameStatistics {
    /// Tasks whose `run` was called (by any thread).
    pub tasks_executed: usize,
    /// Tasks that were already up to date.
    pub tasks_skipped: usize,
    /// Tasks taken before their deadline frame.
    pub prefetched: usize,
    pub context_switches: usize,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Counters {
    executed: usize,
    skipped: usize,
    prefetched: usize,
}

/// Primitive tasks and dependency edges collected from a (possibly nested) task graph.
#[derive(Default)]
struct Flattening {
    visited: Set<TaskId>,
    tasks: Vec<TaskRef>,
    first: Map<TaskId, Vec<TaskRef>>,
    last: Map<TaskId, Vec<TaskRef>>,
    /// `(src, dst)`: src must run after dst.
    edges: Vec<(TaskRef, TaskRef)>,
}

impl Flattening {
    fn add_task(&mut self, t: &TaskRef) {
        if !self.visited.insert(t.id()) {
            return;
        }
        let Some(g) = t.graph() else {
            if !t.is_done() {
                self.tasks.push(t.clone());
            }
            return;
        };
        let sub_tasks = g.tasks();
        for s in &sub_tasks {
            self.add_task(s);
        }
        let first = g
            .first_tasks()
            .iter()
            .flat_map(|s| self.first_of(s))
            .collect();
        let last = g
            .last_tasks()
            .iter()
            .flat_map(|s| self.last_of(s))
            .collect();
        self.first.insert(t.id(), first);
        self.last.insert(t.id(), last);
        for s in sub_tasks.iter().filter(|s| !s.is_done()) {
            for p in g.predecessors(s.id()) {
                self.add_dependency(s, &p);
            }
        }
    }

    fn first_of(&self, t: &TaskRef) -> Vec<TaskRef> {
        match self.first.get(&t.id()) {
            Some(first) => first.clone(),
            None => vec![t.clone()],
        }
    }

    fn last_of(&self, t: &TaskRef) -> Vec<TaskRef> {
        match self.last.get(&t.id()) {
            Some(last) => last.clone(),
            None => vec![t.clone()],
        }
    }

    fn add_dependency(&mut self, src: &TaskRef, dst: &TaskRef) {
        for s in self.first_of(src) {
            for d in self.last_of(dst) {
                self.edges.push((s.clone(), d));
            }
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Visit {
    Active,
    Finished,
}

/// Scheduling state shared by the driving thread and the workers.
///
/// Every scheduled, not yet done primitive task is in `tasks` and in exactly one of `immediate`
/// (deadline 0) and `prefetch`. A task without unresolved predecessors that is not running is in
/// `ready` (and in `ready_cpu` if workers may take it).
struct State {
    stop: bool,
    strict_prefetch: bool,
    clock: u64,
    tasks: Map<TaskId, TaskRef>,
    ready: BTreeSet<ReadyKey>,
    ready_cpu: BTreeSet<ReadyKey>,
    ready_keys: Map<TaskId, ReadyKey>,
    immediate: Set<TaskId>,
    prefetch: Set<TaskId>,
    running: Set<TaskId>,
    /// Unresolved predecessors of each waiting task.
    dependencies: Map<TaskId, Set<TaskId>>,
    inverse_dependencies: Map<TaskId, Set<TaskId>>,
    counters: Counters,
}

impl State {
    fn new(strict_prefetch: bool) -> Self {
        State {
            stop: false,
            strict_prefetch,
            clock: 1,
            tasks: Map::default(),
            ready: BTreeSet::new(),
            ready_cpu: BTreeSet::new(),
            ready_keys: Map::default(),
            immediate: Set::default(),
            prefetch: Set::default(),
            running: Set::default(),
            dependencies: Map::default(),
            inverse_dependencies: Map::default(),
            counters: Counters::default(),
        }
    }

    /// Returns true if workers may take the task.
    fn make_ready(&mut self, t: &Task) -> bool {
        let key = ReadyKey::of(t);
        let cpu = !t.is_gpu_task() && (!self.strict_prefetch || key.deadline > 0);
        assert!(self.ready.insert(key), "{:?} is already ready", t);
        if cpu {
            self.ready_cpu.insert(key);
        }
        self.ready_keys.insert(t.id(), key);
        cpu
    }

    fn unready(&mut self, id: TaskId) -> bool {
        match self.ready_keys.remove(&id) {
            Some(key) => {
                self.ready.remove(&key);
                self.ready_cpu.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Lower the deadline of `t` (of all sub-tasks if `t` is a graph) and of everything it still
    /// waits for.
    fn set_deadline(&mut self, t: &TaskRef, deadline: u32, visited: &mut Set<TaskId>) {
        if !visited.insert(t.id()) {
            return;
        }
        if let Some(g) = t.graph() {
            t.set_deadline(deadline);
            for s in g.tasks() {
                self.set_deadline(&s, deadline, visited);
            }
            return;
        }
        // The task's own deadline may have been lowered behind the scheduler's back, so the ready
        // key and the immediate/prefetch membership are checked as well.
        let current = t.deadline();
        let stale = self.ready_keys.get(&t.id()).is_some_and(|k| k.deadline != current)
            || (current == 0 && self.prefetch.contains(&t.id()));
        if deadline >= current && !stale {
            return;
        }
        let deadline = deadline.min(current);
        let was_ready = self.unready(t.id());
        t.set_deadline(deadline);
        if deadline == 0 && self.prefetch.remove(&t.id()) {
            self.immediate.insert(t.id());
        }
        if was_ready {
            self.make_ready(t);
        }
        let predecessors = self
            .dependencies
            .get(&t.id())
            .map(|deps| deps.iter().filter_map(|id| self.tasks.get(id).cloned()).collect())
            .unwrap_or_else(Vec::new);
        for p in predecessors {
            self.set_deadline(&p, deadline, visited);
        }
    }

    /// Search the recorded dependencies together with `edges` for a cycle. Returns a task on it.
    fn find_cycle(&self, edges: &[(TaskRef, TaskRef)]) -> Option<TaskId> {
        let mut added: Map<TaskId, Vec<TaskId>> = Map::default();
        for (s, d) in edges {
            added.entry(s.id()).or_default().push(d.id());
        }
        let next = |id: TaskId| -> Vec<TaskId> {
            let recorded = self.dependencies.get(&id).into_iter().flatten();
            let new = added.get(&id).into_iter().flatten();
            recorded.chain(new).copied().collect()
        };

        let mut visits: Map<TaskId, Visit> = Map::default();
        for &root in added.keys() {
            if visits.contains_key(&root) {
                continue;
            }
            visits.insert(root, Visit::Active);
            let mut stack = vec![(root, next(root), 0usize)];
            loop {
                let Some(top) = stack.last_mut() else {
                    break;
                };
                let n = top.1.get(top.2).copied();
                top.2 += 1;
                match n {
                    Some(n) => match visits.get(&n) {
                        Some(Visit::Active) => return Some(n),
                        Some(Visit::Finished) => {}
                        None => {
                            visits.insert(n, Visit::Active);
                            stack.push((n, next(n), 0));
                        }
                    },
                    None => {
                        if let Some((node, _, _)) = stack.pop() {
                            visits.insert(node, Visit::Finished);
                        }
                    }
                }
            }
        }
        None
    }

    /// Add the flattened tasks and dependencies. Returns whether tasks became ready, and whether
    /// workers may take any of them.
    fn merge(&mut self, flat: Flattening) -> Result<(bool, bool)> {
        let (known, new_tasks): (Vec<_>, Vec<_>) = flat
            .tasks
            .into_iter()
            .partition(|t| self.tasks.contains_key(&t.id()));
        // Deadlines of already scheduled tasks may have been lowered since they were admitted.
        for t in &known {
            self.set_deadline(t, t.deadline(), &mut Set::default());
        }
        let new_ids = new_tasks.iter().map(|t| t.id()).collect::<Set<_>>();
        let pending = |t: &Task| self.tasks.contains_key(&t.id()) || new_ids.contains(&t.id());
        let edges = flat
            .edges
            .into_iter()
            .filter(|(s, d)| {
                pending(s)
                    && pending(d)
                    && !s.is_done()
                    && !d.is_done()
                    && !self.running.contains(&s.id())
            })
            .collect::<Vec<_>>();

        if let Some(id) = self.find_cycle(&edges) {
            let kind = edges
                .iter()
                .flat_map(|(s, d)| [s, d])
                .find(|t| t.id() == id)
                .or_else(|| self.tasks.get(&id))
                .map(|t| t.kind().to_owned())
                .unwrap_or_default();
            return Err(Error::Cycle { kind });
        }

        for t in &new_tasks {
            self.tasks.insert(t.id(), t.clone());
            if t.deadline() == 0 {
                self.immediate.insert(t.id());
            } else {
                self.prefetch.insert(t.id());
            }
        }
        for (s, d) in &edges {
            if self.dependencies.entry(s.id()).or_default().insert(d.id()) {
                self.inverse_dependencies
                    .entry(d.id())
                    .or_default()
                    .insert(s.id());
            }
            self.unready(s.id());
            self.set_deadline(d, s.deadline(), &mut Set::default());
            assert!(
                s.deadline() >= d.deadline(),
                "{:?} is needed before its dependency {:?}",
                s,
                d
            );
        }

        let mut ready = false;
        let mut cpu = false;
        for t in &new_tasks {
            if !self.dependencies.contains_key(&t.id()) {
                cpu |= self.make_ready(t);
                ready = true;
            }
        }
        debug!(
            tasks = new_tasks.len(),
            edges = edges.len(),
            immediate = self.immediate.len(),
            prefetch = self.prefetch.len(),
            "Scheduled task graph"
        );
        Ok((ready, cpu))
    }

    /// The task the driving thread should execute next: a task with the earliest deadline,
    /// preferably one in `context`.
    fn pick(&self, context: Option<ContextId>) -> Option<ReadyKey> {
        let first = *self.ready.first()?;
        if context.is_some() && context != first.context {
            let probe = ReadyKey {
                deadline: first.deadline,
                context,
                id: TaskId::from(0),
            };
            if let Some(k) = self.ready.range(probe..).next() {
                if k.deadline == first.deadline && k.context == context {
                    return Some(*k);
                }
            }
        }
        Some(first)
    }

    fn take(&mut self, key: ReadyKey) -> TaskRef {
        self.unready(key.id);
        self.running.insert(key.id);
        if key.deadline > 0 {
            self.counters.prefetched += 1;
        }
        self.tasks[&key.id].clone()
    }

    /// Record the execution of `t` and release its successors. `outcome` is `None` if `run` was
    /// skipped, otherwise whether the result changed. Returns true if workers may take any of the
    /// released tasks.
    fn task_done(&mut self, t: &Task, outcome: Option<bool>) -> bool {
        let id = t.id();
        self.running.remove(&id);
        self.immediate.remove(&id);
        self.prefetch.remove(&id);
        self.tasks.remove(&id);
        match outcome {
            Some(_) => self.counters.executed += 1,
            None => self.counters.skipped += 1,
        }

        let date = if outcome == Some(true) {
            self.clock
        } else {
            t.completion_date()
        };
        self.clock += 1;
        t.set_is_done(true, date, Reason::DataNeeded);

        let mut cpu = false;
        for s in self.inverse_dependencies.remove(&id).unwrap_or_default() {
            let released = match self.dependencies.get_mut(&s) {
                Some(deps) => {
                    deps.remove(&id);
                    deps.is_empty()
                }
                None => false,
            };
            if released {
                self.dependencies.remove(&s);
                if let Some(s) = self.tasks.get(&s).cloned() {
                    cpu |= self.make_ready(&s);
                }
            }
        }
        cpu
    }
}

fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard).unwrap_or_else(|e| e.into_inner())
}

fn wait_timeout<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>, d: Duration) -> MutexGuard<'a, T> {
    match cv.wait_timeout(guard, d) {
        Ok((guard, _)) => guard,
        Err(e) => e.into_inner().0,
    }
}

struct Shared {
    state: Mutex<State>,
    /// Signalled when any task became ready or finished.
    any_ready: Condvar,
    /// Signalled when a task workers may take became ready.
    cpu_ready: Condvar,
    statistics: Arc<TaskStatistics>,
    monitor: Mutex<FrameMonitor>,
}

impl Shared {
    fn run_task(&self, t: &Task) -> Option<bool> {
        if t.is_done() || t.is_up_to_date() {
            trace!(task = ?t, "Up to date, skipped");
            return None;
        }
        let start = Instant::now();
        let changed = t.run();
        let elapsed = start.elapsed();
        t.set_actual_duration(&self.statistics, elapsed);
        lock(&self.monitor).record_task(t.kind(), elapsed);
        Some(changed)
    }

    fn finish(&self, t: &Task, outcome: Option<bool>) {
        let cpu = lock(&self.state).task_done(t, outcome);
        self.any_ready.notify_all();
        if cpu {
            self.cpu_ready.notify_all();
        }
    }
}

impl JobSource for Shared {
    type Job = TaskRef;

    fn next_job(&self, worker: WorkerId) -> Option<TaskRef> {
        let mut state = lock(&self.state);
        loop {
            if state.stop {
                return None;
            }
            if let Some(&key) = state.ready_cpu.first() {
                let t = state.take(key);
                trace!(task = ?t, deadline = key.deadline, worker, "Picked");
                return Some(t);
            }
            state = wait(&self.cpu_ready, state);
        }
    }

    fn execute(&self, _worker: WorkerId, t: TaskRef) {
        let outcome = self.run_task(&t);
        self.finish(&t, outcome);
    }
}

/// State owned by the thread calling `run`.
#[derive(Default)]
struct Driver {
    active_gpu: Option<TaskRef>,
    last_frame_end: Option<Instant>,
    frames: u64,
    last: FrameStatistics,
}

/// A scheduler executing CPU tasks on a pool of worker threads and GPU tasks on the thread that
/// calls [`Scheduler::run`].
pub struct MultithreadScheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    frame_period: Option<Duration>,
    driver: Mutex<Driver>,
    workers: WorkerPool,
}

impl MultithreadScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        Self::with_statistics(config, Arc::new(TaskStatistics::new()))
    }

    /// Create a scheduler that records task durations into (and estimates them from) a shared
    /// statistics registry.
    pub fn with_statistics(config: SchedulerConfig, statistics: Arc<TaskStatistics>) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(State::new(config.strict_prefetch)),
            any_ready: Condvar::new(),
            cpu_ready: Condvar::new(),
            statistics,
            monitor: Mutex::new(FrameMonitor::new(
                &config.monitored_kinds,
                config.monitor_file.clone(),
            )),
        });
        let workers = match WorkerPool::new("ork-worker", config.worker_count(), shared.clone()) {
            Ok(workers) => workers,
            Err(e) => {
                lock(&shared.state).stop = true;
                shared.cpu_ready.notify_all();
                return Err(e);
            }
        };
        info!("Started {} worker threads", workers.len());
        Ok(MultithreadScheduler {
            frame_period: config.frame_period(),
            shared,
            config,
            driver: Mutex::new(Driver::default()),
            workers,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn statistics(&self) -> &Arc<TaskStatistics> {
        &self.shared.statistics
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Number of scheduled tasks that are not done yet.
    pub fn pending_tasks(&self) -> usize {
        lock(&self.shared.state).tasks.len()
    }

    pub fn last_frame(&self) -> FrameStatistics {
        lock(&self.driver).last
    }

    pub fn frame_count(&self) -> u64 {
        lock(&self.driver).frames
    }

    /// Track the number of executions and the execution time of tasks of `kind` per frame.
    pub fn monitor_task(&self, kind: &str) {
        lock(&self.shared.monitor).monitor(kind);
    }

    /// The monitored frames not yet written to the record file.
    pub fn monitored_frames(&self) -> Vec<FrameRecord> {
        lock(&self.shared.monitor).frames()
    }

    /// Wait for and take the next task for the driving thread. Returns `None` once the frame is
    /// complete.
    fn next_task(&self, context: Option<ContextId>, frame_deadline: Option<Instant>) -> Option<TaskRef> {
        let mut state = lock(&self.shared.state);
        loop {
            match state.ready.first().copied() {
                Some(first) if first.deadline == 0 => {
                    let key = state.pick(context).unwrap_or(first);
                    return Some(state.take(key));
                }
                _ if !state.immediate.is_empty() => {
                    state = wait(&self.shared.any_ready, state);
                }
                Some(first) => {
                    let key = state.pick(context).unwrap_or(first);
                    let expected = state.tasks[&key.id].expected_duration(&self.shared.statistics);
                    let quota_met = state.counters.prefetched >= self.config.prefetch_rate;
                    let fits = frame_deadline.is_some_and(|d| Instant::now() + expected <= d);
                    if quota_met && !fits {
                        return None;
                    }
                    return Some(state.take(key));
                }
                None => {
                    let deadline = frame_deadline?;
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    state = wait_timeout(&self.shared.any_ready, state, deadline - now);
                }
            }
        }
    }
}

impl Scheduler for MultithreadScheduler {
    fn supports_prefetch(&self, gpu_tasks: bool) -> bool {
        let driver_prefetches = self.config.prefetch_rate > 0 || self.frame_period.is_some();
        if gpu_tasks {
            driver_prefetches
        } else {
            driver_prefetches || self.workers.len() > 0
        }
    }

    fn schedule(&self, task: &TaskRef) -> Result<()> {
        task.init(&mut Set::default());

        let mut state = lock(&self.shared.state);
        if task.deadline() > 0 && state.prefetch.len() >= self.config.prefetch_queue_size {
            debug!(task = ?task, "Prefetch queue full, request declined");
            return Ok(());
        }
        let mut flat = Flattening::default();
        flat.add_task(task);
        let (ready, cpu) = state.merge(flat)?;
        drop(state);

        if ready {
            self.shared.any_ready.notify_all();
        }
        if cpu {
            self.shared.cpu_ready.notify_all();
        }
        Ok(())
    }

    fn reschedule(&self, task: &TaskRef, reason: Reason, deadline: u32) {
        // Completions propagate through the same listeners under the state lock.
        let mut state = lock(&self.shared.state);
        task.set_is_done(false, 0, reason);
        if reason == Reason::DataNeeded {
            state.set_deadline(task, deadline, &mut Set::default());
            drop(state);
            self.shared.any_ready.notify_all();
        }
    }

    #[tracing::instrument(skip_all)]
    fn run(&self, task: &TaskRef) -> Result<()> {
        let mut driver = lock(&self.driver);
        let start = Instant::now();
        lock(&self.shared.state).counters = Counters::default();

        self.schedule(task)?;
        let overhead = start.elapsed();

        let frame_deadline = self.frame_period.map(|period| {
            driver.last_frame_end.unwrap_or(start) + period.saturating_sub(FRAME_MARGIN)
        });

        let mut context_switches = 0;
        loop {
            let context = driver.active_gpu.as_ref().and_then(|t| t.context());
            let Some(t) = self.next_task(context, frame_deadline) else {
                break;
            };
            trace!(task = ?t, deadline = t.deadline(), "Picked");
            if t.is_gpu_task() {
                let switch = match &driver.active_gpu {
                    Some(active) => active.context() != t.context(),
                    None => true,
                };
                if switch {
                    if let Some(active) = driver.active_gpu.take() {
                        active.end();
                    }
                    t.begin();
                    driver.active_gpu = Some(t.clone());
                    context_switches += 1;
                }
            }
            let outcome = self.shared.run_task(&t);
            self.shared.finish(&t, outcome);
        }
        if let Some(active) = driver.active_gpu.take() {
            active.end();
        }

        if let Some(deadline) = frame_deadline {
            let now = Instant::now();
            if now < deadline {
                std::thread::sleep(deadline - now);
            } else if now > deadline + FRAME_MARGIN {
                warn!(
                    "Frame {} overran its deadline by {:?}",
                    driver.frames + 1,
                    now - deadline - FRAME_MARGIN
                );
            }
        }

        let end = Instant::now();
        let counters = std::mem::take(&mut lock(&self.shared.state).counters);
        driver.frames += 1;
        driver.last = FrameStatistics {
            tasks_executed: counters.executed,
            tasks_skipped: counters.skipped,
            prefetched: counters.prefetched,
            context_switches,
            elapsed: end - start,
        };
        driver.last_frame_end = Some(end);
        debug!(
            frame = driver.frames,
            executed = counters.executed,
            skipped = counters.skipped,
            prefetched = counters.prefetched,
            context_switches,
            elapsed = ?driver.last.elapsed,
            "Frame done"
        );

        let mut monitor = lock(&self.shared.monitor);
        if monitor.is_active() {
            monitor.end_frame(driver.frames, overhead, end - start)?;
        }
        Ok(())
    }
}

impl Drop for MultithreadScheduler {
    fn drop(&mut self) {
        lock(&self.shared.state).stop = true;
        self.shared.cpu_ready.notify_all();
        self.shared.any_ready.notify_all();
        self.workers.join();
        info!("Stopped worker threads");
        if let Err(e) = lock(&self.shared.monitor).flush() {
            warn!("Could not write frame record: {}", e);
        }
    }
}
