//! Join keeps the last record of every stream it reads and emits a snapshot of that combined
//! view on every new record.
//!
//! Three modes are supported:
//! - [JoinMode::UpdateState] keeps every stream forever.
//! - [JoinMode::TimeCatch] evicts the streams whose last record is older than a sliding window.
//! - [JoinMode::Timeframe] keeps only the streams seen in the current tumbling frame.
//!
//! Both windowed modes are clocked by the id of the arriving record, not by the wall clock, so
//! replaying the same records always produces the same snapshots.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::metrics::{component_metric_labels, stream_tools_metrics};
use crate::reader::{FanInReader, Upstream};
use crate::record::{Fields, RecordId, StreamId, StreamRecord};
use crate::source::LogSource;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "JoinArgs")]
pub enum JoinMode {
    UpdateState,
    /// Evicts a stream once `now - last_seen > window`.
    TimeCatch { window: Duration },
    /// Clears the state whenever a record opens a new frame.
    Timeframe { frame: Duration },
}

/// `{"method": "time_catch", "window_secs": 0.3}`
#[derive(Deserialize)]
struct JoinArgs {
    method: String,
    #[serde(default)]
    window_secs: Option<f64>,
}

impl TryFrom<JoinArgs> for JoinMode {
    type Error = Error;

    fn try_from(args: JoinArgs) -> Result<Self> {
        JoinMode::from_args(&args.method, args.window_secs)
    }
}

impl JoinMode {
    /// Builds a mode from its name and an optional window in seconds.
    pub fn from_args(method: &str, window_secs: Option<f64>) -> Result<Self> {
        match method {
            "update_state" => Ok(JoinMode::UpdateState),
            "time_catch" => Ok(JoinMode::TimeCatch {
                window: window_from_secs(window_secs)?,
            }),
            "timeframe" => {
                let mode = JoinMode::Timeframe {
                    frame: window_from_secs(window_secs)?,
                };
                mode.validate()?;
                Ok(mode)
            }
            other => Err(Error::Config(format!("Wrong join type {other:?}"))),
        }
    }

    /// Frames are counted in whole milliseconds, so a timeframe needs at least one.
    pub fn validate(&self) -> Result<()> {
        match self {
            JoinMode::Timeframe { frame } if frame.as_millis() == 0 => Err(Error::Config(
                format!("timeframe needs a frame of at least one millisecond, got {frame:?}"),
            )),
            _ => Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JoinMode::UpdateState => "update_state",
            JoinMode::TimeCatch { .. } => "time_catch",
            JoinMode::Timeframe { .. } => "timeframe",
        }
    }
}

/// Seconds are converted to whole milliseconds, the resolution of record ids.
fn window_from_secs(window_secs: Option<f64>) -> Result<Duration> {
    let secs =
        window_secs.ok_or_else(|| Error::Config("No time window provided".to_string()))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(Error::Config(format!(
            "time window must be a non-negative number of seconds, got {secs}"
        )));
    }
    Ok(Duration::from_millis((secs * 1000.0).round() as u64))
}

/// Start of the frame `millis` falls in, frames being aligned on multiples of `frame_ms`.
fn truncate_to_frame(millis: u64, frame_ms: u64) -> u64 {
    millis - millis.checked_rem(frame_ms).unwrap_or(0)
}

/// Last known record of a stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinEntry {
    pub id: RecordId,
    pub fields: Fields,
}

/// Copy of the join state at the time a record was applied.
pub type JoinSnapshot = BTreeMap<StreamId, JoinEntry>;

/// The keyed state of a join. Owned by exactly one consumer, which is also its only reader.
#[derive(Debug)]
pub struct JoinState {
    mode: JoinMode,
    state: BTreeMap<StreamId, JoinEntry>,
    /// Millis of the last accepted id per stream, time_catch only.
    state_time: HashMap<StreamId, u64>,
    /// Start of the current frame, timeframe mode only.
    current_frame: Option<u64>,
}

impl JoinState {
    pub fn new(mode: JoinMode) -> Result<Self> {
        mode.validate()?;
        Ok(Self {
            mode,
            state: BTreeMap::new(),
            state_time: HashMap::new(),
            current_frame: None,
        })
    }

    /// Applies the record and returns the resulting snapshot.
    pub fn apply(&mut self, record: StreamRecord) -> JoinSnapshot {
        self.update(record);
        self.snapshot()
    }

    pub fn snapshot(&self) -> JoinSnapshot {
        self.state.clone()
    }

    /// Applies the record, returning how many streams were dropped from the state.
    pub fn update(&mut self, record: StreamRecord) -> usize {
        let now = record.id.millis;
        match self.mode {
            JoinMode::UpdateState => {
                self.insert(record);
                0
            }
            JoinMode::TimeCatch { window } => {
                let window_ms = window.as_millis() as u64;
                self.state_time.insert(record.stream.clone(), now);
                self.insert(record);

                let stale: Vec<StreamId> = self
                    .state_time
                    .iter()
                    .filter(|(_, seen)| now.saturating_sub(**seen) > window_ms)
                    .map(|(stream, _)| stream.clone())
                    .collect();
                for stream in &stale {
                    trace!(%stream, now, "Evicting stale stream from join");
                    self.state.remove(stream);
                    self.state_time.remove(stream);
                }
                stale.len()
            }
            JoinMode::Timeframe { frame } => {
                let frame_start = truncate_to_frame(now, frame.as_millis() as u64);
                let mut evicted = 0;
                match self.current_frame {
                    Some(current) if frame_start < current => {
                        debug!(stream = %record.stream, id = %record.id, current, "Ignoring record of a closed frame");
                        return 0;
                    }
                    Some(current) if frame_start == current => {}
                    _ => {
                        evicted = self.state.len();
                        self.state.clear();
                        self.current_frame = Some(frame_start);
                    }
                }
                self.insert(record);
                evicted
            }
        }
    }

    fn insert(&mut self, record: StreamRecord) {
        self.state.insert(
            record.stream,
            JoinEntry {
                id: record.id,
                fields: record.fields,
            },
        );
    }
}

/// A join over the streams of one [FanInReader].
pub struct Join {
    upstream: Upstream,
    state: JoinState,
    labels: Vec<(String, String)>,
}

impl Join {
    pub async fn new<S>(
        reader: FanInReader<S>,
        mode: JoinMode,
        cancel: &CancellationToken,
    ) -> Result<Self>
    where
        S: LogSource + Send + Sync + 'static,
    {
        let name = format!(
            "join_{}({})",
            mode.name(),
            reader
                .streams()
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let state = JoinState::new(mode)?;
        Ok(Self {
            upstream: Upstream::start(reader, cancel).await?,
            state,
            labels: component_metric_labels(&name),
        })
    }

    /// The snapshot after the next record, `None` once the reader has stopped for good.
    pub async fn next(&mut self) -> Option<JoinSnapshot> {
        let record = self.upstream.next().await?;
        Some(self.on_record(record))
    }

    pub async fn stop(self) -> Result<()> {
        self.upstream.stop().await
    }

    fn on_record(&mut self, record: StreamRecord) -> JoinSnapshot {
        let evicted = self.state.update(record);
        let metrics = stream_tools_metrics();
        if evicted > 0 {
            metrics
                .join_evictions
                .get_or_create(&self.labels)
                .inc_by(evicted as u64);
        }
        metrics.records_emitted.get_or_create(&self.labels).inc();
        self.state.snapshot()
    }
}

impl Stream for Join {
    type Item = JoinSnapshot;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.upstream
            .poll_next_record(cx)
            .map(|record| record.map(|r| this.on_record(r)))
    }
}
