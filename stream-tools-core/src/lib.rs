//! Stream processing over append-only logs.
//!
//! A [reader::FanInReader] polls a set of streams of a [source::LogSource] and hands every new
//! record to exactly one consumer:
//! - [merge::Merge] republishes the records of all its streams in arrival order.
//! - [join::Join] keeps the last record of every stream and emits a snapshot per record.
//! - [filters::MovingAverage] emits the moving average of declared fields for every record.
//! - [bars::SumBar] emits running sums whenever one of them reaches its threshold.
//!
//! Every consumer is a [futures::Stream] and owns its reader: dropping it, or cancelling the
//! token it was built with, stops the polling.
//!
//! [sanitize] turns raw fields into typed values for downstream code and [app::App] routes
//! records to async handlers per stream.

pub use self::error::{Error, Result};

mod error;

pub mod app;
pub mod bars;
pub mod config;
pub mod filters;
pub mod join;
pub mod merge;
pub mod metrics;
pub mod reader;
pub mod record;
pub mod sanitize;
pub mod shared;
pub mod source;

mod pipeline;
mod sink;

pub use crate::pipeline::{run, run_with};
