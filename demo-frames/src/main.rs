use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use clap::Parser;
use ork_core::{
    ContextId, Job, MultithreadScheduler, Reason, Scheduler, SchedulerConfig, Task, TaskGraph,
    TaskRef,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct CliArgs {
    /// Number of frames to drive.
    #[arg(short, long, default_value = "10")]
    frames: u32,

    /// Force a specific number of worker threads [default: number of cores - 1]
    #[arg(short, long)]
    threads: Option<usize>,

    /// Target frame rate, 0 for uncapped.
    #[arg(long, default_value = "60.0")]
    frame_rate: f32,

    /// Minimum number of prefetch tasks per frame.
    #[arg(short, long, default_value = "1")]
    prefetch_rate: usize,

    /// Tasks per layer of the synthetic frame graph.
    #[arg(short, long, default_value = "8")]
    width: usize,

    /// Scheduler configuration (json). Overrides the other scheduler options.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Burns cpu time proportional to its complexity.
struct Busy {
    iterations: u64,
    complexity: u32,
    acc: u64,
}

impl Job for Busy {
    fn run(&mut self) -> bool {
        let prev = self.acc;
        let mut acc = self.acc;
        for i in 0..self.iterations * self.complexity as u64 {
            acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i);
        }
        self.acc = acc;
        acc != prev
    }

    fn complexity(&self) -> u32 {
        self.complexity
    }
}

/// Stands in for a draw call. Counts how often its context is bound.
struct Draw {
    bindings: Arc<AtomicUsize>,
}

impl Job for Draw {
    fn begin(&mut self) {
        self.bindings.fetch_add(1, Ordering::Relaxed);
    }
}

fn busy(kind: &str, deadline: u32, iterations: u64, complexity: u32) -> TaskRef {
    Task::new(
        kind,
        deadline,
        Busy {
            iterations,
            complexity,
            acc: 1,
        },
    )
}

/// camera -> cull[0..width] -> draw (nested graph of gpu tasks in two contexts)
fn build_frame(width: usize, bindings: &Arc<AtomicUsize>) -> (TaskGraph, TaskRef) {
    let root = TaskGraph::new();
    let camera = busy("camera", 0, 1000, 1);
    root.add_task(&camera);

    let draw = TaskGraph::new();
    let contexts = [ContextId::next(), ContextId::next()];
    for i in 0..width {
        let t = Task::new_gpu(
            "draw",
            Some(contexts[i % contexts.len()]),
            0,
            Draw {
                bindings: bindings.clone(),
            },
        );
        draw.add_task(&t);
    }
    root.add_task(draw.task());

    for i in 0..width {
        let cull = busy("cull", 0, 20_000, 1 + (i % 3) as u32);
        root.add_task(&cull);
        root.add_dependency(&cull, &camera);
        root.add_dependency(draw.task(), &cull);
    }
    (root, camera)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => SchedulerConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => {
            let config = SchedulerConfig::default()
                .frame_rate(args.frame_rate)
                .prefetch_rate(args.prefetch_rate)
                .monitor("cull");
            match args.threads {
                Some(n) => config.num_threads(n),
                None => config,
            }
        }
    };
    let scheduler = MultithreadScheduler::new(config)?;
    tracing::info!(
        "Driving {} frames with {} worker threads",
        args.frames,
        scheduler.num_workers()
    );

    let bindings = Arc::new(AtomicUsize::new(0));
    let (root, camera) = build_frame(args.width, &bindings);

    for frame in 0..args.frames {
        if frame > 0 {
            // New camera position: everything downstream has to be redone.
            scheduler.reschedule(&camera, Reason::DataChanged, 0);
        }
        // Work that will be needed two frames from now.
        let preload = TaskGraph::with_deadline(2);
        for _ in 0..args.width {
            preload.add_task(&busy("preload", 2, 50_000, 1));
        }
        scheduler.schedule(preload.task())?;

        bindings.store(0, Ordering::Relaxed);
        scheduler.run(root.task())?;

        let stats = scheduler.last_frame();
        println!(
            "frame {}: {} executed, {} skipped, {} prefetched, {} context switches ({} bindings), {:?}",
            frame,
            stats.tasks_executed,
            stats.tasks_skipped,
            stats.prefetched,
            stats.context_switches,
            bindings.load(Ordering::Relaxed),
            stats.elapsed
        );
    }

    for kind in scheduler.statistics().kinds() {
        if let Some(s) = scheduler.statistics().summary(&kind) {
            println!(
                "{}: {} samples, mean {:?}, min {:?}, max {:?}",
                kind, s.samples, s.mean, s.min, s.max
            );
        }
    }
    if let Some(last) = scheduler.monitored_frames().last() {
        println!("last monitored frame: {:?}", last);
    }
    println!("{} pending tasks", scheduler.pending_tasks());

    Ok(())
}
