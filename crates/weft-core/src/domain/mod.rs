//! Domain model (ids, tasks, lifecycle states, events).

pub mod events;
pub mod ids;
pub mod state;
pub mod task;

pub use events::{EventKind, QueueEvent};
pub use ids::{IdMarker, ParseIdError, TaskId};
pub use state::TaskStatus;
pub use task::{AddTaskOptions, Task, TaskMetadata, TaskPriority, TaskType};
