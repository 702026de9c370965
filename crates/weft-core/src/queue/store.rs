//! Task store: canonical task map, dead-letter list and dependency graph.
//!
//! This is the single source of truth for task status. The ready view is
//! derived from it on demand; the dead-letter list is kept explicitly and
//! reconciled in the same critical section as the status change that
//! fills or drains it.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use super::DependencyGraph;
use crate::domain::{Task, TaskId, TaskPriority, TaskStatus, TaskType};
use crate::error::QueueError;

/// Conjunctive task search. Unset predicates match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub task_type: Option<TaskType>,
    pub agent_id: Option<String>,
    /// The task must require at least these capabilities.
    pub capabilities: BTreeSet<String>,
    /// The task must carry at least these tags.
    pub tags: BTreeSet<String>,
    /// Inclusive lower bound on `created_at`.
    pub created_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub created_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn task_type(mut self, task_type: impl Into<TaskType>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.priority.is_none_or(|p| task.priority == p)
            && self.task_type.as_ref().is_none_or(|t| &task.task_type == t)
            && self
                .agent_id
                .as_deref()
                .is_none_or(|a| task.agent_id.as_deref() == Some(a))
            && self.capabilities.is_subset(&task.required_capabilities)
            && self.tags.is_subset(&task.tags)
            && self.created_after.is_none_or(|at| task.created_at >= at)
            && self.created_before.is_none_or(|at| task.created_at <= at)
    }
}

#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: HashMap<TaskId, Task>,
    dead_letter: Vec<Task>,
    graph: DependencyGraph,
    next_seq: u64,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next arrival sequence number.
    pub(crate) fn allocate_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Adds a freshly created task.
    ///
    /// The id must be new, every dependency must already be in the store,
    /// and the new edges must not close a cycle. Nothing is inserted on
    /// error.
    pub(crate) fn insert(&mut self, task: Task) -> Result<(), QueueError> {
        if self.tasks.contains_key(&task.id) || self.dead_letter.iter().any(|t| t.id == task.id) {
            return Err(QueueError::DuplicateId(task.id));
        }
        if let Some(&unknown) = task
            .dependencies
            .iter()
            .find(|dep| !self.tasks.contains_key(dep))
        {
            return Err(QueueError::UnknownDependency(unknown));
        }
        self.graph
            .try_add_dependencies(task.id, &task.dependencies)
            .map_err(QueueError::DependencyCycle)?;
        self.tasks.insert(task.id, task);
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// All tasks, unordered.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// All tasks, in arrival order.
    pub fn get_all(&self) -> Vec<&Task> {
        let mut all: Vec<&Task> = self.tasks.values().collect();
        all.sort_by_key(|t| t.seq);
        all
    }

    /// Tasks matching `filter`, in arrival order.
    pub fn find(&self, filter: &TaskFilter) -> Vec<&Task> {
        let mut found: Vec<&Task> = self.tasks.values().filter(|t| filter.matches(t)).collect();
        found.sort_by_key(|t| t.seq);
        found
    }

    /// Ids of tasks in `status`, in arrival order.
    pub(crate) fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.find(&TaskFilter::new().status(status))
            .into_iter()
            .map(|t| t.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Removes every completed task. The dead-letter list is untouched.
    pub(crate) fn clear_terminal(&mut self) -> usize {
        let completed = self.ids_with_status(TaskStatus::Completed);
        for id in &completed {
            self.tasks.remove(id);
            self.graph.remove_task(*id);
        }
        completed.len()
    }

    pub(crate) fn reset(&mut self) {
        self.tasks.clear();
        self.dead_letter.clear();
        self.graph.clear();
    }

    /// True iff every dependency is completed.
    ///
    /// A dependency that is no longer in the store counts as completed:
    /// intake rejects unknown ids, and the only way a known task leaves the
    /// store short of a reset is `clear_terminal`, which removes completed
    /// tasks.
    pub fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_none_or(|d| d.status == TaskStatus::Completed)
        })
    }

    /// Dependencies that are failed, cancelled or timed out.
    pub fn failed_dependencies(&self, task: &Task) -> Vec<TaskId> {
        task.dependencies
            .iter()
            .copied()
            .filter(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|d| d.status.fails_dependents())
            })
            .collect()
    }

    /// Tasks that list `id` as a dependency.
    pub(crate) fn dependents_of(&self, id: TaskId) -> Vec<TaskId> {
        self.graph.get_waiting_tasks(id)
    }

    pub(crate) fn push_dead_letter(&mut self, task: Task) {
        self.dead_letter.retain(|t| t.id != task.id);
        self.dead_letter.push(task);
    }

    pub(crate) fn take_dead_letter(&mut self, id: TaskId) -> Option<Task> {
        let pos = self.dead_letter.iter().position(|t| t.id == id)?;
        Some(self.dead_letter.remove(pos))
    }

    /// Dead-letter entries, oldest first.
    pub fn dead_letter(&self) -> &[Task] {
        &self.dead_letter
    }
}
