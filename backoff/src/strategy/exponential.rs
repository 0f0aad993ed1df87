use std::time::Duration;

/// An Exponential Backoff strategy that doubles (or grows by `factor`) the delay with each retry.
///
/// The delay is calculated as `base_interval * factor^(attempt - 1)`, capped at `max_interval`.
///
/// # Example
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let mut backoff = Exponential::from_millis(100, 1_000, 2.0, Some(3));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(400)));
/// assert_eq!(backoff.next(), None);
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    /// If None, retries indefinitely.
    max_attempts: Option<u16>,
    current_attempt: u16,
}

impl Exponential {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        factor: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            max_attempts,
            current_attempt: 0,
        }
    }

    pub fn from_millis(
        base_interval_ms: u64,
        max_interval_ms: u64,
        factor: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self::new(
            Duration::from_millis(base_interval_ms),
            Duration::from_millis(max_interval_ms),
            factor,
            max_attempts,
        )
    }

    /// Starts over from the base interval.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn current_attempt(&self) -> u16 {
        self.current_attempt
    }

    fn delay(&self, attempt: u16) -> Duration {
        // attempt is at least 1 here, so the exponent never goes negative
        let exponent = i32::from(attempt.saturating_sub(1));
        let delay_ms = self.base_interval.as_millis() as f64 * self.factor.powi(exponent);
        let max_ms = self.max_interval.as_millis() as f64;
        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.current_attempt >= max_attempts
        {
            return None;
        }

        self.current_attempt = self.current_attempt.saturating_add(1);
        Some(self.delay(self.current_attempt))
    }
}
