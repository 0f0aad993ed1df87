//! Retry with backoff for async Rust.
//!
//! An [`Operation`] is run until it succeeds. Failures are retried after a cool-off period
//! prescribed by a backoff [`strategy`], unless the [`Condition`] says the error is not worth
//! retrying, the strategy runs out, or the optional cancellation token fires.
//!
//! ```rust
//! use backoff::retry::Retry;
//! use backoff::strategy::fixed;
//!
//! async fn some_work() -> Result<u64, ()> {
//!     Ok(42)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let interval = fixed::Interval::from_millis(1);
//!     let result = Retry::new(interval, |_: &()| true).run(some_work).await;
//!     assert_eq!(result, Ok(42));
//! }
//! ```

use std::future::Future;

/// strategy has all the different backoff strategies. It is an iterator with Item=Duration.
/// The strategy decides what duration to return. Since it is an iterator, we can stop the
/// iterator using [`take`](https://doc.rust-lang.org/std/iter/struct.Take.html).
pub mod strategy;

/// Conditional retry till we run out of backoff or get cancelled.
pub mod retry;

/// The retry condition depends on the result of [`Condition::can_retry`] function.
/// [`Condition::can_retry`] should return `true` to continue retrying or `false` to stop.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

/// A closure deciding on the error is a [`Condition`].
impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}

/// An `Operation` is anything that returns a Future when executed and that
/// Future can be run to completion.
pub trait Operation {
    type Item;
    type Error;
    /// The [`Future`] returned when the Operation is called.
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    #[must_use = "futures do nothing unless you `.await` or poll them"]
    fn run(&mut self) -> Self::Future;
}

/// Any [`FnMut`] returning a [`Future`] whose output is a [`Result`] is an [`Operation`].
impl<T, E, R, F> Operation for F
where
    R: Future<Output = Result<T, E>>,
    F: FnMut() -> R,
{
    type Item = T;
    type Error = E;
    type Future = R;

    fn run(&mut self) -> Self::Future {
        self()
    }
}
