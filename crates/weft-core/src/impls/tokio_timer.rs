//! TokioTimer - production `Timer` backed by the tokio runtime.

use std::time::Duration;

use tokio::runtime::Handle;

use crate::ports::{Timer, TimerCallback, TimerHandle};

/// Spawns one sleeping task per scheduled callback.
///
/// Cancelling aborts the sleeping task. A callback that has already begun
/// running is not interrupted; the queue's callbacks re-check state under
/// the queue lock for that reason.
#[derive(Debug, Clone)]
pub struct TokioTimer {
    handle: Handle,
}

impl TokioTimer {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the calling context, if there is one.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Timer for TokioTimer {
    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        let abort = join.abort_handle();
        TimerHandle::new(move || abort.abort())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let timer = TokioTimer::try_current().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        timer.after(
            Duration::from_millis(100),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let timer = TokioTimer::try_current().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let handle = timer.after(
            Duration::from_millis(100),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_runtime_no_timer() {
        assert!(TokioTimer::try_current().is_none());
    }
}
