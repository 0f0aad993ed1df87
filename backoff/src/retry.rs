use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{Condition, Operation};

/// Retry retries an operation based on the backoff strategy.
///
/// The retry flips between running the [`Operation`] and cooling off:
/// ```text
///        (Ok) -> [Return(Ok)]
///       /
/// (op) ---        (Non-retryable) -> [Return(Err)]
///       \        /
///        (Err) ---                (None) -> [Return(Err)]
///                 \              /
///                  (Retryable) ---              (Cancelled) -> [Return(Err)]
///                                 \            /
///                                  (Backoff) ---
///                                              \
///                                               (Slept) -> [START(op)]
/// ```
/// The last error is returned whenever the retry gives up.
pub struct Retry<I, C> {
    backoff: I,
    condition: C,
    cancel: Option<CancellationToken>,
}

impl<I, C> Retry<I, C>
where
    I: Iterator<Item = Duration>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(backoff: II, condition: C) -> Self {
        Self {
            backoff: backoff.into_iter(),
            condition,
            cancel: None,
        }
    }

    /// Stop cooling off as soon as the token is cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Runs the operation till it succeeds or the retry gives up.
    pub async fn run<O>(mut self, mut operation: O) -> Result<O::Item, O::Error>
    where
        O: Operation,
        C: Condition<O::Error>,
    {
        loop {
            let err = match operation.run().await {
                Ok(item) => return Ok(item),
                Err(e) => e,
            };

            if !self.condition.can_retry(&err) {
                return Err(err);
            }

            // ran out of backoff, return the same error
            let Some(duration) = self.backoff.next() else {
                return Err(err);
            };

            match &self.cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(err),
                        _ = sleep(duration) => {}
                    }
                }
                None => sleep(duration).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::strategy::{exponential, fixed};

    async fn always_successful() -> Result<u64, ()> {
        Ok(42)
    }

    fn true_cond<E>(_: &E) -> bool {
        true
    }

    fn false_cond<E>(_: &E) -> bool {
        false
    }

    #[tokio::test]
    async fn successful_first_attempt() {
        let interval = fixed::Interval::from_millis(1);
        let result = Retry::new(interval, |_: &()| true)
            .run(always_successful)
            .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn non_retriable_failure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cloned_counter = Arc::clone(&counter);

        let result = Retry::new(fixed::Interval::from_millis(1), false_cond::<&str>)
            .run(move || {
                cloned_counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), &str>("err"))
            })
            .await;

        assert_eq!(result, Err("err"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_till_condition() {
        let interval = fixed::Interval::from_millis(1).take(10);

        let counter = Arc::new(AtomicUsize::new(0));
        let cloned_counter = Arc::clone(&counter);

        let result = Retry::new(interval, |e: &usize| *e < 3)
            .run(move || {
                let previous = cloned_counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), usize>(previous + 1))
            })
            .await;

        assert_eq!(result, Err(3));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_till_exhaustion() {
        let attempts = 5;
        let interval = fixed::Interval::from_millis(1).take(attempts);

        let counter = Arc::new(AtomicUsize::new(0));
        let cloned_counter = Arc::clone(&counter);

        let result = Retry::new(interval, true_cond::<usize>)
            .run(move || {
                let previous = cloned_counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), usize>(previous + 1))
            })
            .await;

        // + 1 because take(n) are retries and the first run is not a retry
        assert_eq!(result, Err(attempts + 1));
        assert_eq!(counter.load(Ordering::SeqCst), attempts + 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cloned_counter = Arc::clone(&counter);

        let result = Retry::new(exponential::Exponential::from_millis(1, 4, 2.0, None), true_cond::<&str>)
            .run(move || {
                let attempt = cloned_counter.fetch_add(1, Ordering::SeqCst);
                future::ready(if attempt < 3 { Err("down") } else { Ok(attempt) })
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn cancellation_stops_cool_off() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let cloned_counter = Arc::clone(&counter);

        let retry = Retry::new(fixed::Interval::from_millis(60_000), true_cond::<&str>)
            .with_cancellation(cancel.clone());
        let handle = tokio::spawn(retry.run(move || {
            cloned_counter.fetch_add(1, Ordering::SeqCst);
            future::ready(Err::<(), &str>("unavailable"))
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("retry should stop once cancelled")
            .unwrap();
        assert_eq!(result, Err("unavailable"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
