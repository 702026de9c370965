//! Queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::RetryPolicy;
use crate::error::ConfigError;

/// Settings fixed for the lifetime of a queue.
///
/// Durations are read and written as milliseconds (`taskTimeoutMs`, ...),
/// and missing keys fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// Advisory cap used to size a `WorkerPool`; the queue does not
    /// enforce it.
    pub max_concurrent_tasks: usize,

    /// Default per-task timeout.
    #[serde(rename = "taskTimeoutMs", with = "duration_ms")]
    pub task_timeout: Duration,

    /// Delay before the first retry.
    #[serde(rename = "retryDelayMs", with = "duration_ms")]
    pub retry_delay: Duration,

    pub retry_backoff_multiplier: f64,

    #[serde(rename = "maxRetryDelayMs", with = "duration_ms")]
    pub max_retry_delay: Duration,

    /// Default retry budget.
    pub max_retries: u32,

    /// Priority ordering; when false, tasks are offered purely FIFO.
    pub priority_enabled: bool,

    pub dead_letter_queue_enabled: bool,

    /// Sweeper tick period.
    #[serde(rename = "processingIntervalMs", with = "duration_ms")]
    pub processing_interval: Duration,

    pub enable_logging: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            task_timeout: Duration::from_secs(300),
            retry_delay: Duration::from_secs(5),
            retry_backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(300),
            max_retries: 3,
            priority_enabled: true,
            dead_letter_queue_enabled: true,
            processing_interval: Duration::from_secs(1),
            enable_logging: true,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_concurrent_tasks",
            });
        }
        if self.task_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "task_timeout",
            });
        }
        if self.processing_interval.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "processing_interval",
            });
        }
        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(
                self.retry_backoff_multiplier,
            ));
        }
        if self.max_retry_delay < self.retry_delay {
            return Err(ConfigError::RetryDelayCap {
                base_ms: self.retry_delay.as_millis(),
                max_ms: self.max_retry_delay.as_millis(),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_delay,
            self.retry_backoff_multiplier,
            self.max_retry_delay,
        )
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
