//! Filters transform every record of a single stream.

/// Moving average over the last samples of declared fields.
pub mod moving_average;

pub use moving_average::{MovingAverage, MovingAverageState};
