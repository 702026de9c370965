//! Ports - seams between the queue and its environment.
//!
//! The queue itself does no I/O. Time, deferred execution, id minting and
//! event delivery are reached through these traits so they can be replaced
//! in tests (see `impls::ManualClock`).

pub mod clock;
pub mod event_bus;
pub mod id_generator;
pub mod timer;

pub use self::clock::{Clock, SystemClock};
pub use self::event_bus::{EventBus, EventHandler, SubscriptionId};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::timer::{Timer, TimerCallback, TimerHandle};
