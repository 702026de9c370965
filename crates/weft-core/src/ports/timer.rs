//! Timer port - deferred callbacks.
//!
//! The queue schedules two kinds of deferred work: retry reinsertion after
//! the backoff delay, and the periodic sweeper tick. Both go through
//! `Timer::after` so tests can swap in a simulated clock
//! (`impls::ManualClock`) and advance time deterministically.

use std::fmt;
use std::time::Duration;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait Timer: Send + Sync {
    /// Runs `callback` once, after `delay`, unless the returned handle is
    /// cancelled first.
    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Cancellation handle for a scheduled callback.
///
/// Dropping the handle does NOT cancel the callback.
pub struct TimerHandle {
    cancel: Box<dyn FnOnce() + Send + 'static>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn cancel(self) {
        (self.cancel)();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").finish_non_exhaustive()
    }
}
