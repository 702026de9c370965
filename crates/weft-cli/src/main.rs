//! weft - run a simulated workload through the task queue.
//!
//! Seeds a small dependency graph (fetch -> build -> report), drives it with
//! a worker pool whose handlers fail at a configurable rate, and prints the
//! final queue statistics as JSON. Each task requires its own type as a
//! capability, so the pool only claims types it has a handler for.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weft_core::domain::{AddTaskOptions, Task, TaskId, TaskPriority};
use weft_core::queue::{QueueConfig, QueueStats, TaskQueue};
use weft_core::worker::{
    HandlerRegistry, ProgressReporter, TaskFailure, TaskHandler, WorkerOptions, WorkerPool,
};

#[derive(Debug, Parser)]
#[command(name = "weft", about = "Run a simulated workload through the task queue")]
struct Cli {
    /// Number of fetch tasks; one build task is added per fetch.
    #[arg(long, default_value_t = 8)]
    tasks: usize,

    /// Worker count (defaults to maxConcurrentTasks).
    #[arg(long)]
    workers: Option<usize>,

    /// Probability that a simulated attempt fails.
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,

    /// JSON queue configuration, e.g. {"maxRetries": 5, "retryDelayMs": 100}.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides retryDelayMs.
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value_t = 60)]
    deadline_secs: u64,
}

impl Cli {
    fn queue_config(&self) -> Result<QueueConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
            None => QueueConfig {
                retry_delay: Duration::from_millis(200),
                processing_interval: Duration::from_millis(250),
                ..QueueConfig::default()
            },
        };
        if let Some(ms) = self.retry_delay_ms {
            config.retry_delay = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

/// Sleeps a random few milliseconds and fails at `failure_rate`.
struct SimulatedHandler {
    failure_rate: f64,
}

#[async_trait]
impl TaskHandler for SimulatedHandler {
    async fn handle(&self, task: &Task, progress: &ProgressReporter) -> Result<Value, TaskFailure> {
        let (fails, steps) = {
            let mut rng = rand::thread_rng();
            (rng.gen_bool(self.failure_rate), rng.gen_range(2..6u32))
        };

        for step in 1..=steps {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let pct = i32::try_from(step * 100 / steps).unwrap_or(100);
            if !progress.report(pct, Some(json!({ "step": step }))) {
                return Err(TaskFailure::new("abandoned"));
            }
        }

        if fails {
            return Err(TaskFailure::new(format!(
                "simulated failure on attempt {}",
                task.retry_count + 1
            )));
        }
        Ok(json!({ "type": task.task_type.as_str(), "steps": steps }))
    }
}

fn seed(queue: &TaskQueue, fetches: usize) -> Result<()> {
    let mut builds: Vec<TaskId> = Vec::with_capacity(fetches);
    for n in 0..fetches {
        let fetch = queue.add_task(
            "fetch",
            json!({ "source": n }),
            AddTaskOptions::new()
                .priority(TaskPriority::High)
                .capability("fetch")
                .tag("demo"),
        )?;
        let build = queue.add_task(
            "build",
            json!({ "target": n }),
            AddTaskOptions::new()
                .depends_on(fetch)
                .capability("build")
                .tag("demo"),
        )?;
        builds.push(build);
    }

    let report = builds
        .iter()
        .fold(AddTaskOptions::new().priority(TaskPriority::Low), |opts, id| {
            opts.depends_on(*id)
        });
    queue.add_task("report", json!({}), report.capability("report").tag("demo"))?;
    Ok(())
}

fn settled(stats: &QueueStats) -> bool {
    let open = stats.by_status.pending
        + stats.by_status.queued
        + stats.by_status.assigned
        + stats.by_status.in_progress
        + stats.by_status.retry;
    open == 0
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.queue_config()?;
    let queue = TaskQueue::new(config.clone())?;
    seed(&queue, cli.tasks)?;
    tracing::info!(tasks = queue.len(), "seeded");

    let simulated: Arc<dyn TaskHandler> = Arc::new(SimulatedHandler {
        failure_rate: cli.failure_rate.clamp(0.0, 1.0),
    });
    let mut handlers = HandlerRegistry::new();
    for task_type in ["fetch", "build", "report"] {
        handlers.register(task_type, Arc::clone(&simulated))?;
    }

    let mut options = WorkerOptions::from_config(&config);
    options.capabilities = handlers.capabilities();
    if let Some(workers) = cli.workers {
        options.workers = workers;
    }
    let pool = WorkerPool::spawn(queue.clone(), Arc::new(handlers), options);
    queue.start_processing();

    let wait = async {
        while !settled(&queue.get_stats()) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::select! {
        _ = wait => tracing::info!("all tasks settled"),
        _ = tokio::time::sleep(Duration::from_secs(cli.deadline_secs)) => {
            tracing::warn!(deadline_secs = cli.deadline_secs, "deadline reached");
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    queue.stop_processing();
    pool.shutdown_and_join().await;

    println!("{}", serde_json::to_string_pretty(&queue.get_stats())?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}
