//! Periodic sweep: timeouts, dependency-failure propagation, statistics.
//!
//! The facade arms one timer per tick while the queue is running; each tick
//! calls `QueueState::sweep` under the queue lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lifecycle::status_changed;
use super::memory::{Outbox, QueueState};
use super::stats::QueueStats;
use crate::domain::{QueueEvent, TaskId, TaskStatus};

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub timed_out: Vec<TaskId>,
    pub dependency_failed: Vec<TaskId>,
    /// Statistics after this sweep's transitions.
    pub stats: QueueStats,
}

impl QueueState {
    pub(crate) fn sweep(&mut self, now: DateTime<Utc>, out: &mut Outbox) -> SweepReport {
        let timed_out = self.expire_timeouts(now, out);
        let dependency_failed = self.propagate_dependency_failures(now, out);
        SweepReport {
            timed_out,
            dependency_failed,
            stats: QueueStats::compute(&self.store),
        }
    }

    /// `assigned | in_progress -> timeout` once the deadline has passed.
    /// Timeouts do not consume a retry.
    fn expire_timeouts(&mut self, now: DateTime<Utc>, out: &mut Outbox) -> Vec<TaskId> {
        let mut in_flight = self.store.ids_with_status(TaskStatus::Assigned);
        in_flight.extend(self.store.ids_with_status(TaskStatus::InProgress));

        let mut expired = Vec::new();
        for id in in_flight {
            let Some(task) = self.store.get_mut(id) else {
                continue;
            };
            if !task.is_timed_out(now) {
                continue;
            }
            let Some(old) = task.transition_to(TaskStatus::Timeout) else {
                continue;
            };
            task.metadata.error = Some(format!("timed out after {}ms", task.timeout_ms));

            let task = task.clone();
            out.push(QueueEvent::TaskTimeout { task: task.clone() });
            status_changed(out, &task, old);
            expired.push(id);
        }
        expired
    }

    /// Fails every pending task with a failed, cancelled or timed-out
    /// dependency. Repeats until nothing changes so a whole chain collapses
    /// within one tick.
    fn propagate_dependency_failures(&mut self, now: DateTime<Utc>, out: &mut Outbox) -> Vec<TaskId> {
        let mut failed = Vec::new();
        loop {
            let mut changed = false;
            for id in self.store.ids_with_status(TaskStatus::Pending) {
                let Some(task) = self.store.get(id) else {
                    continue;
                };
                let broken = self.store.failed_dependencies(task);
                if broken.is_empty() {
                    continue;
                }
                let Some(task) = self.store.get_mut(id) else {
                    continue;
                };
                let Some(old) = task.transition_to(TaskStatus::Failed) else {
                    continue;
                };
                task.failed_at = Some(now);
                task.metadata.error = Some(format!(
                    "dependency failed: {}",
                    broken
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ));

                let task = task.clone();
                out.push(QueueEvent::TaskDependencyFailed {
                    task: task.clone(),
                    failed_dependency_ids: broken,
                });
                status_changed(out, &task, old);
                failed.push(id);
                changed = true;
            }
            if !changed {
                break;
            }
        }
        failed
    }
}
