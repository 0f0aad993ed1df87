//! The append-only logs the pipelines read from.
//!
//! A log holds named streams of [StreamRecord]s, each addressed by a [RecordId] that strictly
//! increases within its stream. Readers keep their own cursors and ask the log for everything
//! newer, waiting a bounded amount of time when nothing new has arrived.

use std::collections::HashMap;
use std::time::Duration;

use crate::Result;
use crate::record::{Fields, RecordId, StreamId, StreamRecord};

/// In-memory log with error injection.
pub mod memory;

/// Synthetic producer appending numeric records at a fixed pace.
pub mod generator;

/// Access to an append-only log.
#[trait_variant::make(LogSource: Send)]
pub trait LocalLogSource {
    /// Returns at most `max` records newer than the cursor of each requested stream, ordered as
    /// they became visible in the log. Waits up to `timeout` when none are available and then
    /// returns an empty batch. Failures are reported as [crate::Error::Upstream].
    async fn poll(
        &self,
        cursors: &HashMap<StreamId, RecordId>,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamRecord>>;

    /// Appends a record and returns the id the log assigned to it.
    async fn append(&self, stream: &StreamId, fields: Fields) -> Result<RecordId>;

    /// Id of the newest record of the stream, `None` if nothing was ever appended to it.
    async fn last_id(&self, stream: &StreamId) -> Result<Option<RecordId>>;

    /// Names of all streams known to the log.
    async fn streams(&self) -> Result<Vec<StreamId>>;
}
