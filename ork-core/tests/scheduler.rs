mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{setup, Log};
use ork_core::{
    ContextId, Error, MultithreadScheduler, Reason, Scheduler, SchedulerConfig, Task, TaskGraph,
    TaskStatistics,
};

fn scheduler(config: SchedulerConfig) -> MultithreadScheduler {
    setup();
    MultithreadScheduler::new(config).unwrap()
}

#[test]
fn chain_runs_in_order() {
    let log = Log::default();
    let g = TaskGraph::new();
    let t1 = Task::new("t1", 0, log.job("t1"));
    let t2 = Task::new("t2", 0, log.job("t2"));
    let t3 = Task::new("t3", 0, log.job("t3"));
    g.add_task(&t1);
    g.add_task(&t2);
    g.add_task(&t3);
    g.add_dependency(&t2, &t1);
    g.add_dependency(&t3, &t2);

    let s = scheduler(SchedulerConfig::default().num_threads(2).strict_prefetch(false));
    s.run(g.task()).unwrap();

    assert_eq!(log.names(), vec!["t1", "t2", "t3"]);
    assert!(g.is_done());
    assert_eq!(s.pending_tasks(), 0);
    assert_eq!(s.last_frame().tasks_executed, 3);
}

#[test]
fn independent_tasks_complete_in_one_run() {
    let log = Log::default();
    let g = TaskGraph::new();
    for name in ["a", "b"] {
        g.add_task(&Task::new(
            name,
            0,
            log.job(name).working(Duration::from_millis(20)),
        ));
    }

    let s = scheduler(SchedulerConfig::default().num_threads(2).strict_prefetch(false));
    s.run(g.task()).unwrap();

    let mut names = log.names();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
    assert!(g.is_done());
    assert_eq!(s.pending_tasks(), 0);
}

#[test]
fn prefetch_task_runs_within_three_frames() {
    let log = Log::default();
    let t = Task::new("later", 3, log.job("later"));

    let s = scheduler(SchedulerConfig::default().frame_rate(60.0).prefetch_rate(1));
    assert!(s.supports_prefetch(false));
    assert!(s.supports_prefetch(true));
    s.schedule(&t).unwrap();

    let frame = TaskGraph::new();
    for _ in 0..3 {
        s.run(frame.task()).unwrap();
    }
    assert!(t.is_done());
    assert_eq!(log.count("later"), 1);
}

#[test]
fn prefetch_waits_without_quota_or_frame_rate() {
    let log = Log::default();
    let t = Task::new_gpu("later", None, 3, log.job("later").gpu());

    let s = scheduler(SchedulerConfig::default().num_threads(0));
    assert!(!s.supports_prefetch(true));
    s.schedule(&t).unwrap();
    s.run(TaskGraph::new().task()).unwrap();
    assert!(!t.is_done());

    // Needed now after all.
    s.reschedule(&t, Reason::DataNeeded, 0);
    s.run(TaskGraph::new().task()).unwrap();
    assert!(t.is_done());
}

#[test]
fn reschedule_data_needed() {
    let log = Log::default();
    let t = Task::new("t", 0, log.job("t"));
    let s = scheduler(SchedulerConfig::default());
    s.run(&t).unwrap();
    assert!(t.is_done());

    s.reschedule(&t, Reason::DataNeeded, 5);
    assert!(!t.is_done());
    assert!(t.deadline() <= 5);

    s.run(&t).unwrap();
    assert!(t.is_done());
    assert_eq!(log.count("t"), 2);
}

#[test]
fn gpu_tasks_stay_on_calling_thread() {
    let log = Log::default();
    let g = TaskGraph::new();
    let context = ContextId::next();
    for i in 0..16 {
        let name = format!("cpu{}", i);
        g.add_task(&Task::new(
            name.as_str(),
            0,
            log.job(&name).working(Duration::from_millis(1)),
        ));
        let name = format!("gpu{}", i);
        g.add_task(&Task::new_gpu(
            name.as_str(),
            Some(context),
            0,
            log.job(&name).working(Duration::from_millis(1)).gpu(),
        ));
    }

    let s = scheduler(SchedulerConfig::default().num_threads(4).strict_prefetch(false));
    s.run(g.task()).unwrap();

    let me = std::thread::current().id();
    let entries = log.entries();
    assert_eq!(entries.len(), 32);
    assert!(entries
        .iter()
        .filter(|e| e.name.starts_with("gpu"))
        .all(|e| e.thread == me));
    assert_eq!(log.gpu_overlaps(), 0);
}

#[test]
fn strict_prefetch_keeps_immediate_work_on_calling_thread() {
    let log = Log::default();
    let s = scheduler(SchedulerConfig::default().num_threads(2));
    let later = Task::new("later", 1, log.job("later"));
    s.schedule(&later).unwrap();
    let start = Instant::now();
    while !later.is_done() && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(later.is_done());

    let g = TaskGraph::new();
    for i in 0..8 {
        let name = format!("now{}", i);
        g.add_task(&Task::new(
            name.as_str(),
            0,
            log.job(&name).working(Duration::from_millis(1)),
        ));
    }
    s.run(g.task()).unwrap();

    let me = std::thread::current().id();
    let entries = log.entries();
    assert_eq!(entries.len(), 9);
    for e in &entries {
        if e.name == "later" {
            assert_ne!(e.thread, me);
            assert!(e
                .thread_name
                .as_deref()
                .is_some_and(|n| n.starts_with("ork-worker")));
        } else {
            assert_eq!(e.thread, me, "{} left the calling thread", e.name);
        }
    }
}

#[test]
fn context_switches_are_grouped() {
    let log = Log::default();
    let x = ContextId::next();
    let y = ContextId::next();
    let g = TaskGraph::new();
    for (name, context) in [("a", x), ("d", y), ("b", x), ("c", x)] {
        g.add_task(&Task::new_gpu(name, Some(context), 0, log.job(name).gpu()));
    }

    let s = scheduler(SchedulerConfig::default().num_threads(1));
    s.run(g.task()).unwrap();

    assert_eq!(log.entries().len(), 4);
    assert!(s.last_frame().context_switches <= 2);
    assert!(log.begins() <= 2);
}

#[test]
fn no_redundant_execution() {
    let log = Log::default();
    let g = TaskGraph::new();
    let t1 = Task::new("t1", 0, log.job("t1").unchanged());
    let t2 = Task::new("t2", 0, log.job("t2"));
    g.add_task(&t1);
    g.add_task(&t2);
    g.add_dependency(&t2, &t1);

    let s = scheduler(SchedulerConfig::default());
    s.run(g.task()).unwrap();
    assert_eq!(log.names(), vec!["t1", "t2"]);

    // Nothing changed: running again does nothing.
    s.run(g.task()).unwrap();
    assert_eq!(log.names().len(), 2);

    // t1 re-runs, but its result does not change, so t2 stays up to date.
    s.reschedule(&t1, Reason::DataChanged, 0);
    assert!(!t2.is_done());
    s.run(g.task()).unwrap();
    assert_eq!(log.names(), vec!["t1", "t2", "t1"]);
    assert!(g.is_done());
    assert_eq!(s.last_frame().tasks_skipped, 1);
}

#[test]
fn changed_result_reruns_successors() {
    let log = Log::default();
    let g = TaskGraph::new();
    let t1 = Task::new("t1", 0, log.job("t1"));
    let t2 = Task::new("t2", 0, log.job("t2"));
    g.add_task(&t1);
    g.add_task(&t2);
    g.add_dependency(&t2, &t1);

    let s = scheduler(SchedulerConfig::default());
    s.run(g.task()).unwrap();
    s.reschedule(&t1, Reason::DataChanged, 0);
    s.run(g.task()).unwrap();
    assert_eq!(log.names(), vec!["t1", "t2", "t1", "t2"]);
    assert!(t2.completion_date() > t1.completion_date());
}

#[test]
fn deadlines_follow_dependencies() {
    let log = Log::default();
    let inner = TaskGraph::new();
    let a = Task::new("a", 8, log.job("a"));
    let b = Task::new("b", 6, log.job("b"));
    inner.add_task(&a);
    inner.add_task(&b);
    inner.add_dependency(&b, &a);

    let outer = TaskGraph::with_deadline(4);
    let consumer = Task::new("consumer", 4, log.job("consumer"));
    outer.add_task(inner.task());
    outer.add_task(&consumer);
    outer.add_dependency(&consumer, inner.task());

    let s = scheduler(SchedulerConfig::default().num_threads(0));
    s.schedule(outer.task()).unwrap();
    for (src, dst) in [(&b, &a), (&consumer, &b)] {
        assert!(src.deadline() >= dst.deadline());
    }
    assert_eq!(b.deadline(), 4);
    assert_eq!(a.deadline(), 4);

    s.reschedule(&consumer, Reason::DataNeeded, 1);
    assert_eq!(a.deadline(), 1);
    s.reschedule(&consumer, Reason::DataNeeded, 3);
    assert_eq!(consumer.deadline(), 1);
}

#[test]
fn cyclic_graph_is_rejected() {
    let log = Log::default();
    let g = TaskGraph::new();
    let a = Task::new("a", 0, log.job("a"));
    let b = Task::new("b", 0, log.job("b"));
    let c = Task::new("c", 0, log.job("c"));
    for t in [&a, &b, &c] {
        g.add_task(t);
    }
    g.add_dependency(&b, &a);
    g.add_dependency(&c, &b);
    g.add_dependency(&a, &c);

    let s = scheduler(SchedulerConfig::default().num_threads(1));
    assert!(matches!(s.run(g.task()), Err(Error::Cycle { .. })));
    assert!(log.entries().is_empty());
    assert_eq!(s.pending_tasks(), 0);
}

#[test]
fn statistics_gating() {
    setup();
    let statistics = Arc::new(TaskStatistics::new());
    let s = MultithreadScheduler::with_statistics(
        SchedulerConfig::default().num_threads(0),
        statistics.clone(),
    )
    .unwrap();

    let t = Task::new("blur", 0, Log::default().job("blur"));
    for _ in 0..63 {
        t.set_actual_duration(s.statistics(), Duration::from_micros(100));
    }
    assert_eq!(t.expected_duration(&statistics), Duration::ZERO);

    t.set_actual_duration(&statistics, Duration::from_micros(100));
    let estimate = t.expected_duration(&statistics);
    assert!(estimate > Duration::ZERO);
    assert!(
        (estimate.as_secs_f64() * 1e6 - 100.0).abs() < 1.0,
        "{:?}",
        estimate
    );
}

#[test]
fn slow_prefetch_waits_for_a_later_frame() {
    setup();
    let statistics = Arc::new(TaskStatistics::new());
    for _ in 0..64 {
        statistics.record("slow", Duration::from_secs(1), 1);
    }
    let log = Log::default();
    let s = MultithreadScheduler::with_statistics(
        SchedulerConfig::default()
            .num_threads(0)
            .frame_rate(60.0)
            .prefetch_rate(0),
        statistics.clone(),
    )
    .unwrap();
    let slow = Task::new("slow", 1, log.job("slow"));
    s.schedule(&slow).unwrap();
    s.run(TaskGraph::new().task()).unwrap();
    assert!(!slow.is_done());
    assert_eq!(log.count("slow"), 0);
    assert_eq!(s.pending_tasks(), 1);

    // Below the quota the estimate does not matter.
    let s = MultithreadScheduler::with_statistics(
        SchedulerConfig::default()
            .num_threads(0)
            .frame_rate(60.0)
            .prefetch_rate(1),
        statistics,
    )
    .unwrap();
    let slow = Task::new("slow", 1, log.job("slow"));
    s.schedule(&slow).unwrap();
    s.run(TaskGraph::new().task()).unwrap();
    assert!(slow.is_done());
    assert_eq!(s.last_frame().prefetched, 1);
}

#[test]
fn executed_tasks_feed_statistics() {
    let s = scheduler(SchedulerConfig::default().num_threads(0));
    let log = Log::default();
    for _ in 0..3 {
        s.run(&Task::new("step", 0, log.job("step"))).unwrap();
    }
    assert_eq!(s.statistics().summary("step").unwrap().samples, 3);
    assert_eq!(s.frame_count(), 3);
}

#[test]
fn frame_rate_paces_frames() {
    let s = scheduler(SchedulerConfig::default().frame_rate(100.0).num_threads(1));
    let frame = TaskGraph::new();
    s.run(frame.task()).unwrap();
    let start = Instant::now();
    for _ in 0..3 {
        s.run(frame.task()).unwrap();
    }
    // Three frames of 10ms minus the margin each.
    assert!(start.elapsed() >= Duration::from_millis(28), "{:?}", start.elapsed());
}

#[test]
fn monitored_frames_are_recorded() {
    let path = std::env::temp_dir().join(format!("ork-frames-{}.txt", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let log = Log::default();
    {
        let s = scheduler(
            SchedulerConfig::default()
                .num_threads(0)
                .monitor("draw")
                .monitor_file(&path),
        );
        s.monitor_task("upload");
        let g = TaskGraph::new();
        g.add_task(&Task::new("draw", 0, log.job("draw")));
        g.add_task(&Task::new("draw", 0, log.job("draw")));
        g.add_task(&Task::new("upload", 0, log.job("upload")));
        s.run(g.task()).unwrap();

        let frames = s.monitored_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame, 1);
        assert_eq!(frames[0].kinds.len(), 2);
        assert_eq!(frames[0].kinds[0].0, 2);
        assert_eq!(frames[0].kinds[1].0, 1);
    }

    let content = std::fs::read_to_string(&path).unwrap();
    let fields = content.lines().next().unwrap().split(' ').collect::<Vec<_>>();
    assert_eq!(fields.len(), 7);
    assert_eq!(fields[0], "1");
    assert_eq!(fields[3], "2");
    assert_eq!(fields[5], "1");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn config_from_json() {
    setup();
    let config = SchedulerConfig::from_json(
        r#"{ "num_threads": 1, "prefetch_rate": 2, "strict_prefetch": false }"#,
    )
    .unwrap();
    let s = MultithreadScheduler::new(config).unwrap();
    assert_eq!(s.num_workers(), 1);
    assert_eq!(s.config().prefetch_rate, 2);
    assert!(matches!(
        MultithreadScheduler::new(SchedulerConfig::default().frame_rate(f32::NAN)),
        Err(Error::Config(_))
    ));
}
