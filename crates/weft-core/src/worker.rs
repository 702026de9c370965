//! Worker pool: tokio tasks that claim work from a `TaskQueue` and report
//! the outcome back.
//!
//! The queue never runs task code itself. A pool is one possible driver of
//! the worker-facing contract (`claim_next` → `update_progress`* →
//! `complete` | `fail`).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{Task, TaskId, TaskType};
use crate::error::WorkerError;
use crate::queue::{QueueConfig, TaskQueue};

/// A failed attempt as reported by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub error: String,
    /// Partial result, stored on the task.
    pub result: Option<Value>,
}

impl TaskFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            result: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

impl From<&str> for TaskFailure {
    fn from(error: &str) -> Self {
        Self::new(error)
    }
}

impl From<String> for TaskFailure {
    fn from(error: String) -> Self {
        Self::new(error)
    }
}

/// Lets a running handler report progress on its task.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    queue: TaskQueue,
    task_id: TaskId,
}

impl ProgressReporter {
    /// Returns false once the task is no longer in progress (timed out or
    /// cancelled), which handlers may take as a signal to give up.
    pub fn report(&self, progress: i32, checkpoint: Option<Value>) -> bool {
        self.queue
            .update_progress(self.task_id, progress, checkpoint)
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task, progress: &ProgressReporter) -> Result<Value, TaskFailure>;
}

/// Dispatches to one handler per task type.
///
/// Built during initialization, then shared immutably.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), WorkerError> {
        let task_type = task_type.into();
        if self.handlers.contains_key(&task_type) {
            return Err(WorkerError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Task types with a registered handler, sorted. Offer these as a pool's
    /// capabilities when tasks require their own type.
    pub fn capabilities(&self) -> BTreeSet<String> {
        self.handlers
            .keys()
            .map(|t| t.as_str().to_string())
            .collect()
    }
}

#[async_trait]
impl TaskHandler for HandlerRegistry {
    async fn handle(&self, task: &Task, progress: &ProgressReporter) -> Result<Value, TaskFailure> {
        let Some(handler) = self.handlers.get(&task.task_type) else {
            return Err(TaskFailure::new(format!(
                "no handler registered for task type {}",
                task.task_type
            )));
        };
        handler.handle(task, progress).await
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub workers: usize,
    /// Agent ids are `{agent_prefix}-{n}`.
    pub agent_prefix: String,
    /// Offered to `claim_next`; empty takes any task.
    pub capabilities: BTreeSet<String>,
    /// Idle wait when nothing is ready.
    pub poll_interval: Duration,
}

impl WorkerOptions {
    /// One worker per `max_concurrent_tasks`.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            workers: config.max_concurrent_tasks,
            ..Self::default()
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            workers: QueueConfig::default().max_concurrent_tasks,
            agent_prefix: "worker".to_string(),
            capabilities: BTreeSet::new(),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Handle on a group of spawned workers.
///
/// Shutdown stops workers from claiming new tasks; a handler already
/// running is awaited, not cancelled.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `options.workers` workers on the current tokio runtime.
    pub fn spawn(queue: TaskQueue, handler: Arc<dyn TaskHandler>, options: WorkerOptions) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..options.workers)
            .map(|n| {
                let worker = Worker {
                    agent_id: format!("{}-{n}", options.agent_prefix),
                    capabilities: options.capabilities.clone(),
                    poll_interval: options.poll_interval,
                    queue: queue.clone(),
                    handler: Arc::clone(&handler),
                };
                let rx = shutdown_rx.clone();
                tokio::spawn(worker.run(rx))
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "worker panicked");
            }
        }
    }
}

struct Worker {
    agent_id: String,
    capabilities: BTreeSet<String>,
    poll_interval: Duration,
    queue: TaskQueue,
    handler: Arc<dyn TaskHandler>,
}

impl Worker {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::debug!(agent_id = %self.agent_id, "worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let Some(task) = self.queue.claim_next(&self.agent_id, &self.capabilities) else {
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            };

            self.execute(task).await;
        }
        tracing::debug!(agent_id = %self.agent_id, "worker stopped");
    }

    async fn execute(&self, task: Task) {
        let reporter = ProgressReporter {
            queue: self.queue.clone(),
            task_id: task.id,
        };

        let accepted = match self.handler.handle(&task, &reporter).await {
            Ok(result) => self.queue.complete(task.id, result, None),
            Err(failure) => self.queue.fail(task.id, &failure.error, failure.result),
        };
        if !accepted {
            // timed out or cancelled while the handler ran
            tracing::debug!(
                agent_id = %self.agent_id,
                task_id = %task.id,
                "outcome dropped, task no longer in progress"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AddTaskOptions, TaskStatus};
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, task: &Task, progress: &ProgressReporter) -> Result<Value, TaskFailure> {
            progress.report(50, Some(json!({"half": true})));
            Ok(task.payload.clone())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl TaskHandler for AlwaysFails {
        async fn handle(&self, _task: &Task, _progress: &ProgressReporter) -> Result<Value, TaskFailure> {
            Err(TaskFailure::new("broken").with_result(json!({"partial": 1})))
        }
    }

    fn quiet_config() -> QueueConfig {
        QueueConfig {
            enable_logging: false,
            retry_delay: Duration::from_millis(10),
            ..QueueConfig::default()
        }
    }

    async fn wait_for(queue: &TaskQueue, f: impl Fn(&TaskQueue) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f(queue) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn pool_completes_every_task() {
        let queue = TaskQueue::new(quiet_config()).unwrap();
        let ids: Vec<TaskId> = (0..8)
            .map(|n| queue.add_task("echo", json!(n), AddTaskOptions::new()).unwrap())
            .collect();

        let pool = WorkerPool::spawn(
            queue.clone(),
            Arc::new(Echo),
            WorkerOptions {
                workers: 3,
                poll_interval: Duration::from_millis(5),
                ..WorkerOptions::default()
            },
        );
        assert_eq!(pool.len(), 3);

        wait_for(&queue, |q| q.get_stats().by_status.completed == 8).await;
        pool.shutdown_and_join().await;

        for (n, id) in ids.into_iter().enumerate() {
            let task = queue.get_task(id).unwrap();
            assert_eq!(task.result, Some(json!(n)));
            assert!(task.metadata.actual_duration_ms.is_some());
        }
    }

    #[tokio::test]
    async fn failing_handler_ends_in_dead_letter() {
        let queue = TaskQueue::new(quiet_config()).unwrap();
        let id = queue
            .add_task("flaky", json!(null), AddTaskOptions::new().max_retries(1))
            .unwrap();

        let pool = WorkerPool::spawn(
            queue.clone(),
            Arc::new(AlwaysFails),
            WorkerOptions {
                workers: 1,
                poll_interval: Duration::from_millis(5),
                ..WorkerOptions::default()
            },
        );
        wait_for(&queue, |q| q.dead_letter().len() == 1).await;
        pool.shutdown_and_join().await;

        let task = queue.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.result, Some(json!({"partial": 1})));
    }

    #[tokio::test]
    async fn registry_routes_by_type_and_fails_unknown() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Echo)).unwrap();
        assert_eq!(
            registry.register("echo", Arc::new(Echo)).unwrap_err(),
            WorkerError::DuplicateHandler(TaskType::new("echo"))
        );

        let queue = TaskQueue::new(quiet_config()).unwrap();
        let known = queue.add_task("echo", json!("hi"), AddTaskOptions::new()).unwrap();
        let unknown = queue
            .add_task("other", json!(null), AddTaskOptions::new().max_retries(0))
            .unwrap();

        let pool = WorkerPool::spawn(
            queue.clone(),
            Arc::new(registry),
            WorkerOptions {
                workers: 1,
                poll_interval: Duration::from_millis(5),
                ..WorkerOptions::default()
            },
        );
        wait_for(&queue, |q| q.get_stats().throughput == 2).await;
        pool.shutdown_and_join().await;

        assert_eq!(queue.get_task(known).unwrap().status, TaskStatus::Completed);
        let failed = queue.get_task(unknown).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.metadata.error.unwrap().contains("other"));
    }

    #[tokio::test]
    async fn capabilities_restrict_what_a_pool_claims() {
        let queue = TaskQueue::new(quiet_config()).unwrap();
        let gpu = queue
            .add_task("render", json!(null), AddTaskOptions::new().capability("gpu"))
            .unwrap();
        let plain = queue.add_task("render", json!(null), AddTaskOptions::new()).unwrap();

        let pool = WorkerPool::spawn(
            queue.clone(),
            Arc::new(Echo),
            WorkerOptions {
                workers: 2,
                capabilities: ["cpu".to_string()].into(),
                poll_interval: Duration::from_millis(5),
                ..WorkerOptions::default()
            },
        );
        wait_for(&queue, |q| q.get_stats().by_status.completed == 1).await;
        pool.shutdown_and_join().await;

        assert_eq!(queue.get_task(plain).unwrap().status, TaskStatus::Completed);
        assert_eq!(queue.get_task(gpu).unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn registry_capabilities_limit_pool_to_registered_types() {
        let mut registry = HandlerRegistry::new();
        registry.register("resize", Arc::new(Echo)).unwrap();
        registry.register("crop", Arc::new(Echo)).unwrap();
        assert_eq!(
            registry.capabilities(),
            BTreeSet::from(["crop".to_string(), "resize".to_string()])
        );

        let queue = TaskQueue::new(quiet_config()).unwrap();
        let crop = queue
            .add_task("crop", json!(1), AddTaskOptions::new().capability("crop"))
            .unwrap();
        let encode = queue
            .add_task("encode", json!(2), AddTaskOptions::new().capability("encode"))
            .unwrap();

        let capabilities = registry.capabilities();
        let pool = WorkerPool::spawn(
            queue.clone(),
            Arc::new(registry),
            WorkerOptions {
                workers: 1,
                capabilities,
                poll_interval: Duration::from_millis(5),
                ..WorkerOptions::default()
            },
        );
        wait_for(&queue, |q| q.get_stats().by_status.completed == 1).await;
        pool.shutdown_and_join().await;

        assert_eq!(queue.get_task(crop).unwrap().status, TaskStatus::Completed);
        assert_eq!(queue.get_task(encode).unwrap().status, TaskStatus::Queued);
    }
}
