//! In-memory log.
//!
//! Mimics the behavior of a Redis-like stream store: wall-clock based `<millis>-<seq>` ids that
//! strictly increase per stream, optional length capping of each stream, and blocking polls that
//! wake up as soon as something is appended. Failures can be injected through the
//! [ErrorInjector] to test the error paths of the readers.
//!
//! # Example
//! ```ignore
//! let log = MemoryLog::new().with_max_len(1000);
//! let id = log.append(&"s1".into(), fields).await?;
//! ```

mod error_injector;

pub use error_injector::ErrorInjector;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::record::{Fields, RecordId, StreamId, StreamRecord};
use crate::source::LogSource;
use crate::{Error, Result};

/// A single stored record, tagged with the global arrival order.
#[derive(Debug)]
struct Entry {
    arrival: u64,
    id: RecordId,
    fields: Fields,
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: VecDeque<Entry>,
    /// Survives trimming, new ids are always above it.
    last_id: RecordId,
}

#[derive(Debug, Default)]
struct LogState {
    streams: HashMap<StreamId, StreamLog>,
    arrivals: u64,
    max_len: Option<usize>,
}

impl LogState {
    fn push(&mut self, stream: &StreamId, id: RecordId, fields: Fields) -> Result<RecordId> {
        let max_len = self.max_len;
        let log = self.streams.entry(stream.clone()).or_default();
        if id <= log.last_id {
            return Err(Error::Source(format!(
                "id {id} for stream {stream} is not greater than the top item {}",
                log.last_id
            )));
        }

        self.arrivals += 1;
        log.entries.push_back(Entry {
            arrival: self.arrivals,
            id,
            fields,
        });
        log.last_id = id;

        if let Some(max_len) = max_len {
            while log.entries.len() > max_len {
                log.entries.pop_front();
            }
        }
        Ok(id)
    }

    /// Everything newer than the cursors, in arrival order, capped at `max`.
    fn collect(&self, cursors: &HashMap<StreamId, RecordId>, max: usize) -> Vec<StreamRecord> {
        let mut found: Vec<(u64, StreamRecord)> = Vec::new();
        for (stream, cursor) in cursors {
            let Some(log) = self.streams.get(stream) else {
                continue;
            };
            let start = log.entries.partition_point(|e| e.id <= *cursor);
            found.extend(log.entries.range(start..).take(max).map(|e| {
                (
                    e.arrival,
                    StreamRecord::new(stream.clone(), e.id, e.fields.clone()),
                )
            }));
        }
        found.sort_unstable_by_key(|(arrival, _)| *arrival);
        found.truncate(max);
        found.into_iter().map(|(_, record)| record).collect()
    }
}

/// Shared in-memory log. Clones share the same streams.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    state: Arc<RwLock<LogState>>,
    appended: Arc<Notify>,
    error_injector: Arc<ErrorInjector>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max_len` records per stream, dropping the oldest ones.
    pub fn with_max_len(self, max_len: usize) -> Self {
        self.state.write().max_len = Some(max_len);
        self
    }

    /// Use this to inject errors for testing.
    pub fn error_injector(&self) -> &Arc<ErrorInjector> {
        &self.error_injector
    }

    /// Appends with an explicit id, which must be greater than the newest id of the stream.
    pub fn append_with_id(&self, stream: &StreamId, id: RecordId, fields: Fields) -> Result<RecordId> {
        let id = self.state.write().push(stream, id, fields)?;
        self.appended.notify_waiters();
        Ok(id)
    }

    /// Number of records currently retained for the stream.
    pub fn len(&self, stream: &str) -> usize {
        self.state
            .read()
            .streams
            .get(stream)
            .map_or(0, |log| log.entries.len())
    }

    fn next_id(last: RecordId) -> RecordId {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        if now > last.millis {
            RecordId::new(now, 0)
        } else {
            // the clock stalled or went back, stay on the last millisecond
            RecordId::new(last.millis, last.seq + 1)
        }
    }
}

impl LogSource for MemoryLog {
    async fn poll(
        &self,
        cursors: &HashMap<StreamId, RecordId>,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamRecord>> {
        self.error_injector.apply_poll_latency().await;
        if self.error_injector.should_fail_poll() {
            return Err(Error::Upstream("injected poll failure".to_string()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            // register interest before looking, so an append in between is not missed
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.state.read().collect(cursors, max);
            if !batch.is_empty() {
                trace!(count = batch.len(), "Polled records");
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(vec![]);
            }
        }
    }

    async fn append(&self, stream: &StreamId, fields: Fields) -> Result<RecordId> {
        if self.error_injector.should_fail_append() {
            return Err(Error::Upstream("injected append failure".to_string()));
        }
        let id = {
            let mut state = self.state.write();
            let last = state
                .streams
                .get(stream)
                .map_or(RecordId::ZERO, |log| log.last_id);
            state.push(stream, Self::next_id(last), fields)?
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn last_id(&self, stream: &StreamId) -> Result<Option<RecordId>> {
        Ok(self.state.read().streams.get(stream).map(|log| log.last_id))
    }

    async fn streams(&self) -> Result<Vec<StreamId>> {
        let mut streams: Vec<StreamId> = self.state.read().streams.keys().cloned().collect();
        streams.sort();
        Ok(streams)
    }
}
