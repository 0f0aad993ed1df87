/// A fixed interval between retries.
pub mod fixed;

/// An exponentially growing interval between retries, capped at a maximum.
pub mod exponential;
