//! Lifecycle events published by the queue.
//!
//! Every event carries a snapshot of the task taken right after the
//! transition, so subscribers never need to call back into the queue to see
//! the new state.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::{Task, TaskId, TaskStatus};

/// Event name, used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    TaskAdded,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskProgress,
    TaskTimeout,
    TaskDependencyFailed,
    TaskRequeued,
    TaskStatusChanged,
    QueueStarted,
    QueueStopped,
    QueueReset,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            EventKind::TaskAdded => "task.added",
            EventKind::TaskAssigned => "task.assigned",
            EventKind::TaskStarted => "task.started",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::TaskCancelled => "task.cancelled",
            EventKind::TaskProgress => "task.progress",
            EventKind::TaskTimeout => "task.timeout",
            EventKind::TaskDependencyFailed => "task.dependency.failed",
            EventKind::TaskRequeued => "task.requeued",
            EventKind::TaskStatusChanged => "task.status.changed",
            EventKind::QueueStarted => "queue.started",
            EventKind::QueueStopped => "queue.stopped",
            EventKind::QueueReset => "queue.reset",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    TaskAdded {
        task: Task,
    },
    TaskAssigned {
        task: Task,
        agent_id: String,
    },
    TaskStarted {
        task: Task,
    },
    TaskCompleted {
        task: Task,
        result: Value,
    },
    TaskFailed {
        task: Task,
        error: String,
        result: Option<Value>,
        /// `true` when the failure consumed a retry and the task will be
        /// requeued after the backoff delay.
        will_retry: bool,
    },
    TaskCancelled {
        task: Task,
        reason: Option<String>,
    },
    TaskProgress {
        task: Task,
        progress: u8,
        checkpoint: Option<Value>,
    },
    TaskTimeout {
        task: Task,
    },
    TaskDependencyFailed {
        task: Task,
        failed_dependency_ids: Vec<TaskId>,
    },
    TaskRequeued {
        task: Task,
    },
    TaskStatusChanged {
        task: Task,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },
    QueueStarted,
    QueueStopped,
    QueueReset,
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::TaskAdded { .. } => EventKind::TaskAdded,
            QueueEvent::TaskAssigned { .. } => EventKind::TaskAssigned,
            QueueEvent::TaskStarted { .. } => EventKind::TaskStarted,
            QueueEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            QueueEvent::TaskFailed { .. } => EventKind::TaskFailed,
            QueueEvent::TaskCancelled { .. } => EventKind::TaskCancelled,
            QueueEvent::TaskProgress { .. } => EventKind::TaskProgress,
            QueueEvent::TaskTimeout { .. } => EventKind::TaskTimeout,
            QueueEvent::TaskDependencyFailed { .. } => EventKind::TaskDependencyFailed,
            QueueEvent::TaskRequeued { .. } => EventKind::TaskRequeued,
            QueueEvent::TaskStatusChanged { .. } => EventKind::TaskStatusChanged,
            QueueEvent::QueueStarted => EventKind::QueueStarted,
            QueueEvent::QueueStopped => EventKind::QueueStopped,
            QueueEvent::QueueReset => EventKind::QueueReset,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// The task snapshot carried by task-level events.
    pub fn task(&self) -> Option<&Task> {
        match self {
            QueueEvent::TaskAdded { task }
            | QueueEvent::TaskAssigned { task, .. }
            | QueueEvent::TaskStarted { task }
            | QueueEvent::TaskCompleted { task, .. }
            | QueueEvent::TaskFailed { task, .. }
            | QueueEvent::TaskCancelled { task, .. }
            | QueueEvent::TaskProgress { task, .. }
            | QueueEvent::TaskTimeout { task }
            | QueueEvent::TaskDependencyFailed { task, .. }
            | QueueEvent::TaskRequeued { task }
            | QueueEvent::TaskStatusChanged { task, .. } => Some(task),
            QueueEvent::QueueStarted | QueueEvent::QueueStopped | QueueEvent::QueueReset => None,
        }
    }
}
