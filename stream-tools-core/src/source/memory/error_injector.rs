//! Error injection controller for testing.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Controller for injecting failures into a [super::MemoryLog], so the retry and error paths
/// of the readers can be exercised without a real log going down.
#[derive(Debug, Default)]
pub struct ErrorInjector {
    /// Fail the next N polls.
    fail_next_polls: AtomicUsize,
    /// Fail the next N appends.
    fail_next_appends: AtomicUsize,
    /// Artificial poll latency in milliseconds.
    poll_latency_ms: AtomicU64,
}

impl ErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next N poll operations.
    pub fn fail_polls(&self, count: usize) {
        self.fail_next_polls.store(count, Ordering::Relaxed);
    }

    /// Fail the next N append operations.
    pub fn fail_appends(&self, count: usize) {
        self.fail_next_appends.store(count, Ordering::Relaxed);
    }

    /// Delay every poll by `ms` before it looks at the log.
    pub fn set_poll_latency(&self, ms: u64) {
        self.poll_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Number of injected poll failures not consumed yet.
    pub fn pending_poll_failures(&self) -> usize {
        self.fail_next_polls.load(Ordering::Relaxed)
    }

    pub(crate) fn should_fail_poll(&self) -> bool {
        Self::decrement_counter(&self.fail_next_polls)
    }

    pub(crate) fn should_fail_append(&self) -> bool {
        Self::decrement_counter(&self.fail_next_appends)
    }

    pub(crate) async fn apply_poll_latency(&self) {
        let ms = self.poll_latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Returns true, consuming one failure, if the counter was above zero.
    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }
}
