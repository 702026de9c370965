//! IdGenerator port.
//!
//! Abstracted behind a trait so tests can pin the timestamp part of ids.

use crate::domain::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

/// Mints task ids.
///
/// Implementations must never return the same id twice for the lifetime of
/// a queue; `add_task` rejects a repeat with `QueueError::DuplicateId`.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULID based generator.
///
/// The timestamp part comes from the injected clock; the remaining 80 bits
/// are random.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        TaskId::from(ulid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::ManualClock;
    use crate::ports::SystemClock;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let ids: HashSet<TaskId> = (0..1_000).map(|_| id_gen.generate_task_id()).collect();
        assert_eq!(ids.len(), 1_000);
    }

    #[test]
    fn ulid_generator_with_stopped_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(ManualClock::new(fixed_time));

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();

        // random part still differs
        assert_ne!(id1, id2);

        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            fixed_time.timestamp_millis() as u64
        );
        assert!(id1.to_string().starts_with("task-"));
    }
}
