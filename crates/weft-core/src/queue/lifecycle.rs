//! Lifecycle controller: every caller-driven status transition.
//!
//! Each operation validates against `TaskStatus::can_transition_to`,
//! mutates the canonical record, and appends its named event followed by a
//! `TaskStatusChanged` to the outbox. Rejections return `false` / `None`
//! and leave the store untouched.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::memory::{Outbox, QueueState};
use crate::domain::{AddTaskOptions, QueueEvent, Task, TaskId, TaskStatus, TaskType};
use crate::error::QueueError;

/// What `fail` did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailOutcome {
    /// Unknown task or not in progress.
    Rejected,
    /// Moved to `retry`; reinsert after the delay.
    Retrying(Duration),
    /// Retries exhausted; terminal.
    Failed,
}

pub(crate) fn status_changed(out: &mut Outbox, task: &Task, old_status: TaskStatus) {
    out.push(QueueEvent::TaskStatusChanged {
        task: task.clone(),
        old_status,
        new_status: task.status,
    });
}

impl QueueState {
    pub(crate) fn add_task(
        &mut self,
        id: TaskId,
        task_type: TaskType,
        payload: Value,
        options: AddTaskOptions,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> Result<TaskId, QueueError> {
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let timeout = options
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.config.task_timeout);
        let seq = self.store.allocate_seq();

        let mut task = Task::new(id, seq, task_type, payload, options, max_retries, timeout, now);
        // dependencies that finished before intake don't hold the task back
        if task.status == TaskStatus::Pending && self.store.dependencies_satisfied(&task) {
            task.status = TaskStatus::Queued;
        }

        self.store.insert(task.clone())?;
        out.push(QueueEvent::TaskAdded { task });
        Ok(id)
    }

    pub(crate) fn assign(&mut self, id: TaskId, agent_id: &str, out: &mut Outbox) -> bool {
        let Some(task) = self.store.get_mut(id) else {
            return false;
        };
        if task.status != TaskStatus::Queued || task.agent_id.is_some() {
            return false;
        }
        let Some(old) = task.transition_to(TaskStatus::Assigned) else {
            return false;
        };
        task.agent_id = Some(agent_id.to_string());

        let task = task.clone();
        out.push(QueueEvent::TaskAssigned {
            task: task.clone(),
            agent_id: agent_id.to_string(),
        });
        status_changed(out, &task, old);
        true
    }

    pub(crate) fn start(&mut self, id: TaskId, now: DateTime<Utc>, out: &mut Outbox) -> bool {
        let Some(task) = self.store.get_mut(id) else {
            return false;
        };
        if task.status != TaskStatus::Assigned {
            return false;
        }
        let Some(old) = task.transition_to(TaskStatus::InProgress) else {
            return false;
        };
        task.started_at = Some(now);

        let task = task.clone();
        out.push(QueueEvent::TaskStarted { task: task.clone() });
        status_changed(out, &task, old);
        true
    }

    pub(crate) fn complete(
        &mut self,
        id: TaskId,
        result: Value,
        metadata: Option<Map<String, Value>>,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> bool {
        let Some(task) = self.store.get_mut(id) else {
            return false;
        };
        if task.status != TaskStatus::InProgress {
            return false;
        }
        let Some(old) = task.transition_to(TaskStatus::Completed) else {
            return false;
        };
        task.completed_at = Some(now);
        task.metadata.actual_duration_ms = task
            .started_at
            .map(|started| u64::try_from((now - started).num_milliseconds()).unwrap_or(0));
        task.metadata.progress = 100;
        if let Some(extra) = metadata {
            task.metadata.merge_context(extra);
        }
        task.result = Some(result.clone());

        let task = task.clone();
        out.push(QueueEvent::TaskCompleted {
            task: task.clone(),
            result,
        });
        status_changed(out, &task, old);

        self.release_dependents(id, out);
        true
    }

    /// Moves every pending dependent of `id` whose dependencies are now all
    /// complete to `queued`.
    fn release_dependents(&mut self, id: TaskId, out: &mut Outbox) {
        for dependent in self.store.dependents_of(id) {
            let ready = self.store.get(dependent).is_some_and(|t| {
                t.status == TaskStatus::Pending && self.store.dependencies_satisfied(t)
            });
            if !ready {
                continue;
            }
            if let Some(task) = self.store.get_mut(dependent)
                && let Some(old) = task.transition_to(TaskStatus::Queued)
            {
                let task = task.clone();
                status_changed(out, &task, old);
            }
        }
    }

    pub(crate) fn fail(
        &mut self,
        id: TaskId,
        error: &str,
        result: Option<Value>,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> FailOutcome {
        let dead_letter_enabled = self.config.dead_letter_queue_enabled;
        let Some(task) = self.store.get_mut(id) else {
            return FailOutcome::Rejected;
        };
        if task.status != TaskStatus::InProgress {
            return FailOutcome::Rejected;
        }

        let will_retry = task.retry_count < task.max_retries;
        let target = if will_retry {
            TaskStatus::Retry
        } else {
            TaskStatus::Failed
        };
        let Some(old) = task.transition_to(target) else {
            return FailOutcome::Rejected;
        };
        if will_retry {
            task.retry_count += 1;
        }
        task.failed_at = Some(now);
        task.metadata.error = Some(error.to_string());
        if result.is_some() {
            task.result = result.clone();
        }

        let task = task.clone();
        out.push(QueueEvent::TaskFailed {
            task: task.clone(),
            error: error.to_string(),
            result,
            will_retry,
        });
        status_changed(out, &task, old);

        if will_retry {
            FailOutcome::Retrying(self.retry_policy.next_delay(task.retry_count))
        } else {
            if dead_letter_enabled {
                self.store.push_dead_letter(task);
            }
            FailOutcome::Failed
        }
    }

    /// Retry timer fired: `retry -> queued` with a fresh attempt.
    pub(crate) fn requeue_retry(&mut self, id: TaskId, now: DateTime<Utc>, out: &mut Outbox) -> bool {
        self.retry_timers.remove(&id);
        let Some(task) = self.store.get_mut(id) else {
            return false;
        };
        if task.status != TaskStatus::Retry {
            return false;
        }
        let Some(old) = task.transition_to(TaskStatus::Queued) else {
            return false;
        };
        task.reset_attempt(now);

        let task = task.clone();
        out.push(QueueEvent::TaskRequeued { task: task.clone() });
        status_changed(out, &task, old);
        true
    }

    pub(crate) fn cancel(&mut self, id: TaskId, reason: Option<String>, out: &mut Outbox) -> bool {
        let Some(task) = self.store.get_mut(id) else {
            return false;
        };
        let Some(old) = task.transition_to(TaskStatus::Cancelled) else {
            return false;
        };

        let task = task.clone();
        if let Some(timer) = self.retry_timers.remove(&id) {
            timer.cancel();
        }
        out.push(QueueEvent::TaskCancelled {
            task: task.clone(),
            reason,
        });
        status_changed(out, &task, old);
        true
    }

    pub(crate) fn update_progress(
        &mut self,
        id: TaskId,
        progress: i32,
        checkpoint: Option<Value>,
        out: &mut Outbox,
    ) -> bool {
        let Some(task) = self.store.get_mut(id) else {
            return false;
        };
        if task.status != TaskStatus::InProgress {
            return false;
        }
        let progress = u8::try_from(progress.clamp(0, 100)).unwrap_or(100);
        task.metadata.progress = progress;
        if checkpoint.is_some() {
            task.metadata.checkpoint = checkpoint.clone();
        }

        out.push(QueueEvent::TaskProgress {
            task: task.clone(),
            progress,
            checkpoint,
        });
        true
    }

    pub(crate) fn requeue_from_dead_letter(
        &mut self,
        id: TaskId,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> bool {
        if !self.store.dead_letter().iter().any(|t| t.id == id) {
            return false;
        }
        let Some(task) = self.store.get_mut(id) else {
            return false;
        };
        let Some(old) = task.transition_to(TaskStatus::Queued) else {
            return false;
        };
        task.retry_count = 0;
        task.reset_attempt(now);

        let task = task.clone();
        self.store.take_dead_letter(id);
        out.push(QueueEvent::TaskRequeued { task: task.clone() });
        status_changed(out, &task, old);
        true
    }

    /// `queued -> assigned -> in_progress` for the best ready task, in one
    /// critical section.
    pub(crate) fn claim_next(
        &mut self,
        agent_id: &str,
        capabilities: &std::collections::BTreeSet<String>,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> Option<Task> {
        let id = super::ready::select_next(&self.store, capabilities, self.ready_order())?.id;
        if !self.assign(id, agent_id, out) || !self.start(id, now, out) {
            return None;
        }
        self.store.get(id).cloned()
    }

    pub(crate) fn clear_terminal(&mut self) -> usize {
        self.store.clear_terminal()
    }

    pub(crate) fn reset(&mut self, out: &mut Outbox) {
        for (_, timer) in self.retry_timers.drain() {
            timer.cancel();
        }
        self.store.reset();
        out.push(QueueEvent::QueueReset);
    }
}
