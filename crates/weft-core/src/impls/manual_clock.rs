//! ManualClock - simulated time for tests and deterministic replays.
//!
//! Acts as both `Clock` and `Timer`. Time only moves when `advance` is
//! called; callbacks whose due time is reached fire in due order (ties in
//! scheduling order), with the clock set to each callback's due time while
//! it runs. Callbacks may schedule further callbacks; those fire within
//! the same `advance` if they fall inside the window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::ports::{Clock, Timer, TimerCallback, TimerHandle};

type TimerKey = (DateTime<Utc>, u64);

struct ManualState {
    now: DateTime<Utc>,
    next_seq: u64,
    timers: BTreeMap<TimerKey, TimerCallback>,
}

#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: start,
                next_seq: 0,
                timers: BTreeMap::new(),
            })),
        }
    }

    /// Starts at 2024-01-01T00:00:00Z.
    pub fn epoch() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default())
    }

    /// Moves time forward by `by`, firing every callback that becomes due.
    pub fn advance(&self, by: Duration) {
        let target = {
            let state = self.state.lock();
            state.now + to_chrono(by)
        };

        loop {
            let due = {
                let mut state = self.state.lock();
                let next_due = state
                    .timers
                    .first_key_value()
                    .map(|(&(at, _), _)| at)
                    .filter(|at| *at <= target);
                match next_due {
                    Some(at) => {
                        if at > state.now {
                            state.now = at;
                        }
                        state.timers.pop_first().map(|(_, callback)| callback)
                    }
                    None => {
                        if target > state.now {
                            state.now = target;
                        }
                        None
                    }
                }
            };

            match due {
                // run outside the lock: callbacks schedule more timers
                Some(callback) => callback(),
                None => break,
            }
        }
    }

    /// Number of callbacks waiting to fire.
    pub fn pending_timers(&self) -> usize {
        self.state.lock().timers.len()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }
}

impl Timer for ManualClock {
    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let key = {
            let mut state = self.state.lock();
            let key = (state.now + to_chrono(delay), state.next_seq);
            state.next_seq += 1;
            state.timers.insert(key, callback);
            key
        };

        let weak = Arc::downgrade(&self.state);
        TimerHandle::new(move || {
            if let Some(state) = weak.upgrade() {
                state.lock().timers.remove(&key);
            }
        })
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn advance_moves_now() {
        let clock = ManualClock::epoch();
        let start = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn callbacks_fire_in_due_order_at_their_due_time() {
        let clock = ManualClock::epoch();
        let start = clock.now();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (label, ms) in [("late", 300u64), ("early", 100), ("mid", 200)] {
            let fired = Arc::clone(&fired);
            let observer = clock.clone();
            clock.after(
                Duration::from_millis(ms),
                Box::new(move || {
                    let offset = (observer.now() - start).num_milliseconds();
                    fired.lock().push((label, offset));
                }),
            );
        }

        clock.advance(Duration::from_millis(250));
        assert_eq!(*fired.lock(), vec![("early", 100), ("mid", 200)]);
        assert_eq!(clock.pending_timers(), 1);

        clock.advance(Duration::from_millis(50));
        assert_eq!(fired.lock().last(), Some(&("late", 300)));
    }

    #[test]
    fn cancelled_callback_never_fires() {
        let clock = ManualClock::epoch();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let handle = clock.after(
            Duration::from_secs(1),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        handle.cancel();
        clock.advance(Duration::from_secs(5));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn rescheduling_callback_fires_repeatedly_within_window() {
        fn arm(clock: ManualClock, hits: Arc<AtomicUsize>) {
            let next = clock.clone();
            clock.after(
                Duration::from_secs(1),
                Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    arm(next, hits);
                }),
            );
        }

        let clock = ManualClock::epoch();
        let hits = Arc::new(AtomicUsize::new(0));
        arm(clock.clone(), Arc::clone(&hits));

        clock.advance(Duration::from_millis(3500));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
