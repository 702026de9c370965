//! Queue-wide statistics, recomputed from the live task set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::TaskStore;
use crate::domain::{TaskPriority, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub queued: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timeout: usize,
    pub retry: usize,
}

impl StatusCounts {
    fn record(&mut self, status: TaskStatus) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Queued => &mut self.queued,
            TaskStatus::Assigned => &mut self.assigned,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Cancelled => &mut self.cancelled,
            TaskStatus::Timeout => &mut self.timeout,
            TaskStatus::Retry => &mut self.retry,
        };
        *slot += 1;
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Queued => self.queued,
            TaskStatus::Assigned => self.assigned,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
            TaskStatus::Timeout => self.timeout,
            TaskStatus::Retry => self.retry,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub by_status: StatusCounts,
    pub by_priority: BTreeMap<TaskPriority, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub dead_letter: usize,
    /// Mean created -> started over completed tasks, in milliseconds.
    pub average_wait_ms: f64,
    /// Mean started -> completed over completed tasks, in milliseconds.
    pub average_processing_ms: f64,
    /// completed + failed
    pub throughput: usize,
    /// failed / throughput, 0 when nothing has finished.
    pub error_rate: f64,
}

impl QueueStats {
    pub fn compute(store: &TaskStore) -> Self {
        let mut stats = QueueStats {
            dead_letter: store.dead_letter().len(),
            ..QueueStats::default()
        };

        let mut wait_total = 0i64;
        let mut processing_total = 0i64;
        let mut timed = 0i64;

        for task in store.get_all() {
            stats.total += 1;
            stats.by_status.record(task.status);
            *stats.by_priority.entry(task.priority).or_default() += 1;
            *stats
                .by_type
                .entry(task.task_type.as_str().to_string())
                .or_default() += 1;

            if task.status == TaskStatus::Completed
                && let (Some(wait), Some(processing)) = (task.wait_time(), task.processing_time())
            {
                wait_total += wait.num_milliseconds();
                processing_total += processing.num_milliseconds();
                timed += 1;
            }
        }

        if timed > 0 {
            stats.average_wait_ms = wait_total as f64 / timed as f64;
            stats.average_processing_ms = processing_total as f64 / timed as f64;
        }

        stats.throughput = stats.by_status.completed + stats.by_status.failed;
        if stats.throughput > 0 {
            stats.error_rate = stats.by_status.failed as f64 / stats.throughput as f64;
        }
        stats
    }
}
