//! weft-core
//!
//! In-process task scheduling queue.
//!
//! # Modules
//! - **domain**: task model, lifecycle states, events
//! - **ports**: clock, timer, id generation, event bus
//! - **impls**: tokio timer and a simulated clock for tests
//! - **queue**: store, ready selection, lifecycle, sweeper, `TaskQueue`
//! - **worker**: tokio worker pool driving a `TaskHandler`
//! - **error**: `QueueError`, `ConfigError`

pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod worker;

pub use domain::{AddTaskOptions, EventKind, QueueEvent, Task, TaskId, TaskPriority, TaskStatus};
pub use error::{ConfigError, QueueError};
pub use queue::{QueueConfig, QueueStats, SweepReport, TaskFilter, TaskQueue};
pub use worker::{TaskHandler, WorkerOptions, WorkerPool};
