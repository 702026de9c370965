use thiserror::Error;

use crate::domain::{TaskId, TaskType};

/// Errors returned by `TaskQueue::add_task`.
///
/// Lifecycle operations on existing tasks never error: an unknown id or an
/// illegal transition is reported as `false` / `None`, since workers racing
/// for the same task is a normal occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("task id {0} is already in use")]
    DuplicateId(TaskId),

    #[error("unknown dependency {0}")]
    UnknownDependency(TaskId),

    #[error("dependency cycle: {}", format_path(.0))]
    DependencyCycle(Vec<TaskId>),
}

/// Invalid `QueueConfig`, reported when the queue is constructed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("retry_backoff_multiplier must be a finite value >= 1.0, got {0}")]
    InvalidBackoffMultiplier(f64),

    #[error("max_retry_delay ({max_ms}ms) is shorter than retry_delay ({base_ms}ms)")]
    RetryDelayCap { base_ms: u128, max_ms: u128 },

    #[error("no timer configured and no tokio runtime to fall back on")]
    NoTimer,
}

/// Errors building a `worker::HandlerRegistry`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("handler already registered for task type {0}")]
    DuplicateHandler(TaskType),
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
