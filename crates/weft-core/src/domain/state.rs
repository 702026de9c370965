//! Task lifecycle states and the legal-transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - Pending -> Queued (all dependencies completed)
/// - Pending -> Failed (a dependency failed, was cancelled or timed out)
/// - Queued -> Assigned -> InProgress -> Completed
/// - InProgress -> Retry -> Queued (loop until max_retries)
/// - InProgress -> Failed (retries exhausted)
/// - Assigned | InProgress -> Timeout
/// - Failed -> Queued (requeue from the dead-letter list)
/// - any non-terminal state -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies.
    Pending,

    /// Eligible for assignment.
    Queued,

    /// Claimed by a worker, not yet started.
    Assigned,

    /// Being executed by a worker.
    InProgress,

    /// Finished successfully.
    Completed,

    /// Failed permanently (retries exhausted or a dependency failed).
    Failed,

    /// Aborted by a caller.
    Cancelled,

    /// Exceeded its deadline while in flight.
    Timeout,

    /// Waiting for the retry delay to elapse.
    Retry,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Timeout,
        TaskStatus::Retry,
    ];

    /// Is this a terminal state (no further transitions besides a
    /// dead-letter requeue)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Is a worker currently holding the task?
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    /// Does a dependency in this state doom its dependents?
    pub fn fails_dependents(self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Returns true if the transition from self to target is legal.
    pub fn can_transition_to(self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Pending => matches!(target, Queued | Failed | Cancelled),
            Queued => matches!(target, Assigned | Cancelled),
            Assigned => matches!(target, InProgress | Timeout | Cancelled),
            InProgress => matches!(target, Completed | Retry | Failed | Timeout | Cancelled),
            Retry => matches!(target, Queued | Cancelled),
            Failed => matches!(target, Queued),
            Completed | Cancelled | Timeout => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Retry => "retry",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
