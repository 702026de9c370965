//! Task record, priority, metadata and intake options.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task priority. Higher wins.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
    Urgent = 4,
    Critical = 5,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 5] = [
        TaskPriority::Low,
        TaskPriority::Medium,
        TaskPriority::High,
        TaskPriority::Urgent,
        TaskPriority::Critical,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
            TaskPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form bookkeeping attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub created_by: Option<String>,
    pub description: Option<String>,
    pub estimated_duration_ms: Option<u64>,
    pub actual_duration_ms: Option<u64>,
    /// Last error reported by `fail` (or the dependency failure message).
    pub error: Option<String>,
    /// 0..=100
    pub progress: u8,
    pub checkpoint: Option<Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl TaskMetadata {
    pub fn merge_context(&mut self, extra: Map<String, Value>) {
        self.context.extend(extra);
    }

    /// Drops the failure/progress bookkeeping of a previous attempt.
    pub(crate) fn clear_attempt(&mut self) {
        self.error = None;
        self.progress = 0;
        self.checkpoint = None;
    }
}

/// Options recognised by `TaskQueue::add_task`.
///
/// Unset fields fall back to the queue-wide defaults from `QueueConfig`.
#[derive(Debug, Clone, Default)]
pub struct AddTaskOptions {
    pub priority: TaskPriority,
    pub required_capabilities: BTreeSet<String>,
    pub metadata: TaskMetadata,
    pub max_retries: Option<u32>,
    /// `None` or zero means "use the queue default", never "no timeout".
    pub timeout: Option<Duration>,
    pub dependencies: Vec<TaskId>,
    pub tags: BTreeSet<String>,
}

impl AddTaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        self.dependencies.push(task_id);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// The unit of work.
///
/// Callers only ever see clones; the canonical record lives inside the
/// queue and changes only through the lifecycle operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub agent_id: Option<String>,
    pub required_capabilities: BTreeSet<String>,
    pub payload: Value,
    pub result: Option<Value>,
    pub metadata: TaskMetadata,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub max_retries: u32,
    /// Per-task timeout in force, used to recompute `timeout_at` on retry.
    pub timeout_ms: u64,

    pub dependencies: Vec<TaskId>,
    pub tags: BTreeSet<String>,

    /// Arrival order; final FIFO tie-break when `created_at` is equal.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TaskId,
        seq: u64,
        task_type: TaskType,
        payload: Value,
        options: AddTaskOptions,
        max_retries: u32,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut dependencies = Vec::with_capacity(options.dependencies.len());
        for dep in options.dependencies {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        let mut metadata = options.metadata;
        metadata.actual_duration_ms = None;
        metadata.clear_attempt();

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let status = if dependencies.is_empty() {
            TaskStatus::Queued
        } else {
            TaskStatus::Pending
        };

        Self {
            id,
            task_type,
            priority: options.priority,
            status,
            agent_id: None,
            required_capabilities: options.required_capabilities,
            payload,
            result: None,
            metadata,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            timeout_at: Some(deadline(now, timeout_ms)),
            retry_count: 0,
            max_retries,
            timeout_ms,
            dependencies,
            tags: options.tags,
            seq,
        }
    }

    /// Moves to `target` if the transition table allows it.
    ///
    /// Returns the previous status on success.
    pub(crate) fn transition_to(&mut self, target: TaskStatus) -> Option<TaskStatus> {
        if !self.status.can_transition_to(target) {
            return None;
        }
        let old = self.status;
        self.status = target;
        if !target.is_in_flight() {
            self.agent_id = None;
        }
        Some(old)
    }

    /// Clears the bookkeeping of the previous attempt and restarts the
    /// timeout window from `now`.
    pub(crate) fn reset_attempt(&mut self, now: DateTime<Utc>) {
        self.agent_id = None;
        self.started_at = None;
        self.failed_at = None;
        self.metadata.clear_attempt();
        self.timeout_at = Some(deadline(now, self.timeout_ms));
    }

    pub fn has_capabilities(&self, offered: &BTreeSet<String>) -> bool {
        self.required_capabilities.is_subset(offered)
    }

    /// Time spent between creation and start.
    pub fn wait_time(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| started - self.created_at)
    }

    /// Time spent between start and completion.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.is_some_and(|at| now > at)
    }
}

fn deadline(from: DateTime<Utc>, timeout_ms: u64) -> DateTime<Utc> {
    let millis = i64::try_from(timeout_ms).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(millis)
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn task(options: AddTaskOptions) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            1,
            TaskType::new("test"),
            serde_json::json!({"k": "v"}),
            options,
            3,
            Duration::from_secs(10),
            at(0),
        )
    }

    #[test]
    fn priorities_are_ordered_low_to_critical() {
        assert!(TaskPriority::Low < TaskPriority::Medium);
        assert!(TaskPriority::Medium < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Urgent);
        assert!(TaskPriority::Urgent < TaskPriority::Critical);
        assert_eq!(TaskPriority::Critical.as_u8(), 5);
        assert_eq!(TaskPriority::default(), TaskPriority::Medium);
    }

    #[test]
    fn new_task_without_dependencies_is_queued() {
        let task = task(AddTaskOptions::new());
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.timeout_at, Some(at(10)));
        assert_eq!(task.retry_count, 0);
        assert!(task.agent_id.is_none());
    }

    #[test]
    fn new_task_with_dependencies_is_pending_and_dedups() {
        let dep = TaskId::from_ulid(Ulid::new());
        let task = task(AddTaskOptions::new().depends_on(dep).depends_on(dep));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.dependencies, vec![dep]);
    }

    #[test]
    fn transition_clears_agent_outside_flight() {
        let mut task = task(AddTaskOptions::new());
        assert_eq!(task.transition_to(TaskStatus::Assigned), Some(TaskStatus::Queued));
        task.agent_id = Some("agent-1".into());
        assert_eq!(task.transition_to(TaskStatus::InProgress), Some(TaskStatus::Assigned));
        assert!(task.agent_id.is_some());
        assert_eq!(task.transition_to(TaskStatus::Completed), Some(TaskStatus::InProgress));
        assert!(task.agent_id.is_none());
    }

    #[test]
    fn illegal_transition_leaves_task_untouched() {
        let mut task = task(AddTaskOptions::new());
        let before = task.clone();
        assert_eq!(task.transition_to(TaskStatus::Completed), None);
        assert_eq!(task, before);
    }

    #[test]
    fn durations_are_derived_from_timestamps() {
        let mut task = task(AddTaskOptions::new());
        assert!(task.wait_time().is_none());
        task.started_at = Some(at(3));
        task.completed_at = Some(at(8));
        assert_eq!(task.wait_time(), Some(chrono::Duration::seconds(3)));
        assert_eq!(task.processing_time(), Some(chrono::Duration::seconds(5)));
    }

    #[test]
    fn timeout_is_strictly_after_deadline() {
        let task = task(AddTaskOptions::new());
        assert!(!task.is_timed_out(at(10)));
        assert!(task.is_timed_out(at(11)));
    }
}
