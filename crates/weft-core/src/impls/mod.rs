//! Impls - concrete adapters for the ports.
//!
//! - **TokioTimer**: production timer on the tokio runtime
//! - **ManualClock**: simulated clock + timer for tests

pub mod manual_clock;
pub mod tokio_timer;

pub use self::manual_clock::ManualClock;
pub use self::tokio_timer::TokioTimer;
