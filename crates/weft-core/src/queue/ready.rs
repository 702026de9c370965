//! Ready-queue selection.
//!
//! The ready view is recomputed from the store on each call instead of
//! being maintained as a separate list, so it can never drift from task
//! status.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use super::TaskStore;
use crate::domain::{Task, TaskStatus};

/// Orders queued tasks for assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOrder {
    /// Priority descending, then arrival.
    Priority,
    /// Arrival only.
    Fifo,
}

impl ReadyOrder {
    pub fn from_priority_enabled(enabled: bool) -> Self {
        if enabled {
            ReadyOrder::Priority
        } else {
            ReadyOrder::Fifo
        }
    }

    pub fn compare(self, a: &Task, b: &Task) -> Ordering {
        let arrival = a
            .created_at
            .cmp(&b.created_at)
            .then_with(|| a.seq.cmp(&b.seq));
        match self {
            ReadyOrder::Priority => b.priority.cmp(&a.priority).then(arrival),
            ReadyOrder::Fifo => arrival,
        }
    }
}

/// Every queued task a worker with `capabilities` may take, best first.
///
/// An empty capability set means "any worker" and skips capability
/// filtering entirely.
pub fn ready_tasks<'a>(
    store: &'a TaskStore,
    capabilities: &BTreeSet<String>,
    order: ReadyOrder,
) -> Vec<&'a Task> {
    let mut candidates: Vec<&Task> = store
        .iter()
        .filter(|t| t.status == TaskStatus::Queued)
        .filter(|t| capabilities.is_empty() || t.has_capabilities(capabilities))
        .filter(|t| store.dependencies_satisfied(t))
        .collect();
    candidates.sort_by(|a, b| order.compare(a, b));
    candidates
}

/// Head of `ready_tasks`. Does not mutate anything.
pub fn select_next<'a>(
    store: &'a TaskStore,
    capabilities: &BTreeSet<String>,
    order: ReadyOrder,
) -> Option<&'a Task> {
    ready_tasks(store, capabilities, order).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AddTaskOptions, TaskId, TaskPriority, TaskType};
    use chrono::{DateTime, TimeZone, Utc};
    use rstest::rstest;
    use std::time::Duration;
    use ulid::Ulid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn add(store: &mut TaskStore, options: AddTaskOptions, secs: i64) -> TaskId {
        let seq = store.allocate_seq();
        let task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            seq,
            TaskType::new("t"),
            serde_json::Value::Null,
            options,
            3,
            Duration::from_secs(60),
            at(secs),
        );
        let id = task.id;
        store.insert(task).unwrap();
        id
    }

    fn caps(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn higher_priority_first_then_fifo() {
        let mut store = TaskStore::new();
        let low = add(&mut store, AddTaskOptions::new().priority(TaskPriority::Low), 0);
        let high_1 = add(&mut store, AddTaskOptions::new().priority(TaskPriority::High), 1);
        let high_2 = add(&mut store, AddTaskOptions::new().priority(TaskPriority::High), 2);

        let order: Vec<TaskId> = ready_tasks(&store, &BTreeSet::new(), ReadyOrder::Priority)
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec![high_1, high_2, low]);
    }

    #[test]
    fn fifo_ignores_priority() {
        let mut store = TaskStore::new();
        let low = add(&mut store, AddTaskOptions::new().priority(TaskPriority::Low), 0);
        let _critical = add(
            &mut store,
            AddTaskOptions::new().priority(TaskPriority::Critical),
            1,
        );

        let next = select_next(&store, &BTreeSet::new(), ReadyOrder::Fifo).unwrap();
        assert_eq!(next.id, low);
    }

    #[test]
    fn equal_timestamps_fall_back_to_arrival_order() {
        let mut store = TaskStore::new();
        let first = add(&mut store, AddTaskOptions::new(), 0);
        let _second = add(&mut store, AddTaskOptions::new(), 0);

        let next = select_next(&store, &BTreeSet::new(), ReadyOrder::Priority).unwrap();
        assert_eq!(next.id, first);
    }

    #[rstest]
    #[case(&[], true)]
    #[case(&["rust"], false)]
    #[case(&["rust", "docker"], true)]
    #[case(&["rust", "docker", "gpu"], true)]
    fn capability_subset_filter(#[case] offered: &[&str], #[case] eligible: bool) {
        let mut store = TaskStore::new();
        add(
            &mut store,
            AddTaskOptions::new().capability("rust").capability("docker"),
            0,
        );

        let next = select_next(&store, &caps(offered), ReadyOrder::Priority);
        assert_eq!(next.is_some(), eligible);
    }

    #[test]
    fn selection_is_non_destructive() {
        let mut store = TaskStore::new();
        let a = add(&mut store, AddTaskOptions::new(), 0);

        let first = select_next(&store, &BTreeSet::new(), ReadyOrder::Priority).map(|t| t.id);
        let second = select_next(&store, &BTreeSet::new(), ReadyOrder::Priority).map(|t| t.id);
        assert_eq!(first, Some(a));
        assert_eq!(second, Some(a));
    }

    #[test]
    fn pending_tasks_are_never_selected() {
        let mut store = TaskStore::new();
        let a = add(&mut store, AddTaskOptions::new().priority(TaskPriority::Low), 0);
        let _b = add(
            &mut store,
            AddTaskOptions::new()
                .priority(TaskPriority::Critical)
                .depends_on(a),
            1,
        );

        let ready = ready_tasks(&store, &BTreeSet::new(), ReadyOrder::Priority);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, a);
    }
}
