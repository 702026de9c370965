//! In-memory task queue.
//!
//! `TaskQueue` is the public facade. All mutable state lives in one
//! `QueueState` behind a single mutex; every operation takes the lock,
//! mutates, and collects the events it produced into an outbox. Before the
//! lock is released the outbox is appended to the delivery queue, so the
//! delivery queue holds events in transition order. Whichever caller finds
//! no delivery in progress drains it, outside the state lock. Subscribers
//! may therefore call back into the queue; events they cause are delivered
//! once the current event has reached every subscriber.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::lifecycle::FailOutcome;
use super::ready::{self, ReadyOrder};
use super::{QueueConfig, QueueStats, RetryPolicy, SweepReport, TaskFilter, TaskStore};
use crate::domain::{AddTaskOptions, EventKind, QueueEvent, Task, TaskId, TaskType};
use crate::error::{ConfigError, QueueError};
use crate::impls::TokioTimer;
use crate::ports::{
    Clock, EventBus, IdGenerator, SubscriptionId, SystemClock, Timer, TimerHandle, UlidGenerator,
};

/// Events produced inside one critical section, queued for delivery before unlock.
pub(crate) type Outbox = Vec<QueueEvent>;

/// Everything guarded by the queue lock.
pub(crate) struct QueueState {
    pub(crate) config: QueueConfig,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) store: TaskStore,
    /// Armed retry reinsertions, keyed by task.
    pub(crate) retry_timers: HashMap<TaskId, TimerHandle>,
    sweeper: Option<TimerHandle>,
    /// Bumped on every start; ticks armed by an older start exit.
    sweep_generation: u64,
    running: bool,
}

impl QueueState {
    fn new(config: QueueConfig) -> Self {
        Self {
            retry_policy: config.retry_policy(),
            config,
            store: TaskStore::new(),
            retry_timers: HashMap::new(),
            sweeper: None,
            sweep_generation: 0,
            running: false,
        }
    }

    pub(crate) fn ready_order(&self) -> ReadyOrder {
        ReadyOrder::from_priority_enabled(self.config.priority_enabled)
    }
}

/// Events waiting for delivery, in transition order.
#[derive(Default)]
struct Delivery {
    pending: VecDeque<QueueEvent>,
    draining: bool,
}

/// Clears `draining` if a subscriber panics mid-delivery, so the next
/// mutation can resume delivery.
struct ReleaseOnUnwind<'a>(&'a Mutex<Delivery>);

impl Drop for ReleaseOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().draining = false;
        }
    }
}

struct Inner {
    state: Mutex<QueueState>,
    delivery: Mutex<Delivery>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn Timer>,
    ids: Box<dyn IdGenerator>,
    config: QueueConfig,
}

impl Inner {
    /// Runs `f` under the queue lock, then delivers whatever it emitted.
    ///
    /// Lock order is queue, then clock or delivery; `now` is read inside the
    /// section so timestamps are monotonic with respect to mutations.
    fn mutate<R>(&self, f: impl FnOnce(&mut QueueState, DateTime<Utc>, &mut Outbox) -> R) -> R {
        let mut out = Outbox::new();
        let result = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            let result = f(&mut *state, now, &mut out);
            if !out.is_empty() {
                self.delivery.lock().pending.extend(out);
            }
            result
        };
        self.drain();
        result
    }

    fn read<R>(&self, f: impl FnOnce(&QueueState) -> R) -> R {
        let state = self.state.lock();
        f(&*state)
    }

    /// Delivers queued events one at a time until none are left. Returns at
    /// once if another caller, or an enclosing frame of this one, is
    /// already draining; that drainer picks up what was appended.
    fn drain(&self) {
        {
            let mut delivery = self.delivery.lock();
            if delivery.draining || delivery.pending.is_empty() {
                return;
            }
            delivery.draining = true;
        }
        let _unwind = ReleaseOnUnwind(&self.delivery);
        loop {
            let event = {
                let mut delivery = self.delivery.lock();
                match delivery.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        delivery.draining = false;
                        return;
                    }
                }
            };
            if self.config.enable_logging {
                log_event(&event);
            }
            self.events.publish(&event);
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: TaskId, delay: std::time::Duration) -> TimerHandle {
        let weak: Weak<Inner> = Arc::downgrade(self);
        self.timer.after(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.mutate(|state, now, out| state.requeue_retry(id, now, out));
                }
            }),
        )
    }

    fn arm_sweeper(self: &Arc<Self>, generation: u64) -> TimerHandle {
        let weak: Weak<Inner> = Arc::downgrade(self);
        self.timer.after(
            self.config.processing_interval,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.tick(generation);
                }
            }),
        )
    }

    fn tick(self: &Arc<Self>, generation: u64) {
        self.mutate(|state, now, out| {
            if !state.running || state.sweep_generation != generation {
                return;
            }
            let report = state.sweep(now, out);
            if self.config.enable_logging
                && (!report.timed_out.is_empty() || !report.dependency_failed.is_empty())
            {
                tracing::debug!(
                    timed_out = report.timed_out.len(),
                    dependency_failed = report.dependency_failed.len(),
                    queued = report.stats.by_status.queued,
                    in_progress = report.stats.by_status.in_progress,
                    "sweep"
                );
            }
            state.sweeper = Some(self.arm_sweeper(generation));
        });
    }
}

fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::TaskFailed {
            task,
            error,
            will_retry: true,
            ..
        } => tracing::warn!(
            task_id = %task.id,
            retry = task.retry_count,
            max_retries = task.max_retries,
            %error,
            "task failed, retry scheduled"
        ),
        QueueEvent::TaskFailed {
            task,
            error,
            will_retry: false,
            ..
        } => tracing::warn!(
            task_id = %task.id,
            retry = task.retry_count,
            %error,
            "task failed permanently"
        ),
        QueueEvent::TaskTimeout { task } => tracing::warn!(
            task_id = %task.id,
            timeout_ms = task.timeout_ms,
            "task timed out"
        ),
        QueueEvent::TaskDependencyFailed {
            task,
            failed_dependency_ids,
        } => tracing::warn!(
            task_id = %task.id,
            failed = ?failed_dependency_ids,
            "dependency failed"
        ),
        QueueEvent::QueueStarted | QueueEvent::QueueStopped => {
            tracing::info!(event = event.name(), "sweeper")
        }
        other => tracing::debug!(
            event = other.name(),
            task_id = ?other.task().map(|t| t.id.to_string()),
            "queue event"
        ),
    }
}

/// Builder for `TaskQueue`. Defaults to the system clock, ULID ids and the
/// tokio timer of the calling runtime.
pub struct TaskQueueBuilder {
    config: QueueConfig,
    clock: Option<Arc<dyn Clock>>,
    timer: Option<Arc<dyn Timer>>,
    ids: Option<Box<dyn IdGenerator>>,
}

impl TaskQueueBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn id_generator(mut self, ids: Box<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Uses one simulated clock for both time and timers.
    pub fn manual_clock(self, clock: crate::impls::ManualClock) -> Self {
        let timer: Arc<dyn Timer> = Arc::new(clock.clone());
        self.clock(Arc::new(clock)).timer(timer)
    }

    pub fn build(self) -> Result<TaskQueue, ConfigError> {
        self.config.validate()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let timer: Arc<dyn Timer> = match self.timer {
            Some(timer) => timer,
            None => Arc::new(TokioTimer::try_current().ok_or(ConfigError::NoTimer)?),
        };
        let ids = self
            .ids
            .unwrap_or_else(|| Box::new(UlidGenerator::new(Arc::clone(&clock))));

        Ok(TaskQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::new(self.config.clone())),
                delivery: Mutex::new(Delivery::default()),
                events: EventBus::new(),
                clock,
                timer,
                ids,
                config: self.config,
            }),
        })
    }
}

/// In-process task queue.
///
/// Cheap to clone; clones share state. Transition operations return
/// `false` (or `None`) when the task is unknown or the transition is not
/// legal from its current status, and leave the queue unchanged.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// A queue on the system clock and the current tokio runtime.
    pub fn new(config: QueueConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: QueueConfig) -> TaskQueueBuilder {
        TaskQueueBuilder {
            config,
            clock: None,
            timer: None,
            ids: None,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    // ---- events ----

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, handler)
    }

    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe_all(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    // ---- intake and reads ----

    /// Adds a task. It starts `queued`, or `pending` while any dependency
    /// is not yet complete.
    pub fn add_task(
        &self,
        task_type: impl Into<TaskType>,
        payload: Value,
        options: AddTaskOptions,
    ) -> Result<TaskId, QueueError> {
        let task_type = task_type.into();
        self.inner.mutate(|state, now, out| {
            let id = self.inner.ids.generate_task_id();
            state.add_task(id, task_type, payload, options, now, out)
        })
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.inner.read(|state| state.store.get(id).cloned())
    }

    pub fn get_all_tasks(&self) -> Vec<Task> {
        self.inner
            .read(|state| state.store.get_all().into_iter().cloned().collect())
    }

    pub fn find_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.inner
            .read(|state| state.store.find(filter).into_iter().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.inner.read(|state| state.store.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best ready task for a worker offering `capabilities`. Does not
    /// assign it.
    pub fn select_next(&self, capabilities: &BTreeSet<String>) -> Option<Task> {
        self.inner.read(|state| {
            ready::select_next(&state.store, capabilities, state.ready_order()).cloned()
        })
    }

    /// The whole ready view for `capabilities`, best first.
    pub fn queued_tasks(&self, capabilities: &BTreeSet<String>) -> Vec<Task> {
        self.inner.read(|state| {
            ready::ready_tasks(&state.store, capabilities, state.ready_order())
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn dead_letter(&self) -> Vec<Task> {
        self.inner.read(|state| state.store.dead_letter().to_vec())
    }

    pub fn get_stats(&self) -> QueueStats {
        self.inner.read(|state| QueueStats::compute(&state.store))
    }

    // ---- lifecycle ----

    pub fn assign(&self, id: TaskId, agent_id: &str) -> bool {
        self.inner
            .mutate(|state, _, out| state.assign(id, agent_id, out))
    }

    pub fn start(&self, id: TaskId) -> bool {
        self.inner.mutate(|state, now, out| state.start(id, now, out))
    }

    /// Selects, assigns and starts the best ready task in one step.
    pub fn claim_next(&self, agent_id: &str, capabilities: &BTreeSet<String>) -> Option<Task> {
        self.inner
            .mutate(|state, now, out| state.claim_next(agent_id, capabilities, now, out))
    }

    /// Completes the task and releases dependents that were waiting only
    /// on it. `metadata` is merged into the task's context.
    pub fn complete(&self, id: TaskId, result: Value, metadata: Option<Map<String, Value>>) -> bool {
        self.inner
            .mutate(|state, now, out| state.complete(id, result, metadata, now, out))
    }

    /// Records a failed attempt. Retries after the backoff delay while the
    /// budget lasts, then fails terminally.
    pub fn fail(&self, id: TaskId, error: &str, result: Option<Value>) -> bool {
        self.inner.mutate(|state, now, out| {
            match state.fail(id, error, result, now, out) {
                FailOutcome::Rejected => false,
                FailOutcome::Failed => true,
                FailOutcome::Retrying(delay) => {
                    let handle = self.inner.schedule_retry(id, delay);
                    if let Some(stale) = state.retry_timers.insert(id, handle) {
                        stale.cancel();
                    }
                    true
                }
            }
        })
    }

    pub fn cancel(&self, id: TaskId, reason: Option<String>) -> bool {
        self.inner
            .mutate(|state, _, out| state.cancel(id, reason, out))
    }

    /// Progress is clamped into 0..=100.
    pub fn update_progress(&self, id: TaskId, progress: i32, checkpoint: Option<Value>) -> bool {
        self.inner
            .mutate(|state, _, out| state.update_progress(id, progress, checkpoint, out))
    }

    pub fn requeue_from_dead_letter(&self, id: TaskId) -> bool {
        self.inner
            .mutate(|state, now, out| state.requeue_from_dead_letter(id, now, out))
    }

    /// Removes completed tasks. Returns how many were removed.
    pub fn clear_terminal(&self) -> usize {
        self.inner.mutate(|state, _, _| state.clear_terminal())
    }

    /// Drops every task, dead-letter entry and pending retry. The sweeper
    /// keeps its running state.
    pub fn reset(&self) {
        self.inner.mutate(|state, _, out| state.reset(out));
    }

    // ---- sweeper ----

    /// Runs one sweep now, independent of the periodic sweeper.
    pub fn sweep(&self) -> SweepReport {
        self.inner.mutate(|state, now, out| state.sweep(now, out))
    }

    pub fn start_processing(&self) {
        self.inner.mutate(|state, _, out| {
            if state.running {
                return;
            }
            state.running = true;
            state.sweep_generation += 1;
            state.sweeper = Some(self.inner.arm_sweeper(state.sweep_generation));
            out.push(QueueEvent::QueueStarted);
        });
    }

    /// Stops the sweeper. No tick runs after this returns.
    pub fn stop_processing(&self) {
        self.inner.mutate(|state, _, out| {
            if !state.running {
                return;
            }
            state.running = false;
            if let Some(sweeper) = state.sweeper.take() {
                sweeper.cancel();
            }
            out.push(QueueEvent::QueueStopped);
        });
    }

    pub fn is_running(&self) -> bool {
        self.inner.read(|state| state.running)
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TaskQueue")
            .field("tasks", &state.store.len())
            .field("dead_letter", &state.store.dead_letter().len())
            .field("running", &state.running)
            .finish()
    }
}
