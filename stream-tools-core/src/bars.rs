//! Bars accumulate records of a single stream and only emit when a condition fires.

/// Threshold triggered running sums.
pub mod sum_bar;

pub use sum_bar::{SumBar, SumBarState};
