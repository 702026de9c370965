//! Queue module: task store, ready selection, lifecycle transitions, the
//! periodic sweeper, and the in-memory `TaskQueue` facade.

mod config;
mod dependency;
mod lifecycle;
mod memory;
mod ready;
mod retry;
mod stats;
mod store;
mod sweeper;

pub use config::QueueConfig;
pub use dependency::DependencyGraph;
pub use memory::{TaskQueue, TaskQueueBuilder};
pub use ready::ReadyOrder;
pub use retry::RetryPolicy;
pub use stats::{QueueStats, StatusCounts};
pub use store::{TaskFilter, TaskStore};
pub use sweeper::SweepReport;
