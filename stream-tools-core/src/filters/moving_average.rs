//! Moving average of the declared fields of a stream, emitted for every record.
//!
//! Every declared field owns a fixed window of its last samples. During warm-up the window has
//! empty slots, which are left out of the mean rather than counted as zero. Fields missing from
//! a record do not move their window. Fields that are not declared pass through as numbers.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::metrics::{component_metric_labels, stream_tools_metrics};
use crate::reader::{FanInReader, Upstream};
use crate::record::{DerivedRecord, StreamId, StreamRecord};
use crate::shared::{FieldDeclarations, ParsePolicy, numeric_field};
use crate::source::LogSource;
use crate::{Error, Result};

/// Ring buffer of the last samples of one field. Its size never changes.
#[derive(Debug, Clone)]
struct SampleWindow {
    slots: Box<[Option<f64>]>,
    /// Slot the next sample overwrites, the oldest one once the window is full.
    next: usize,
}

impl SampleWindow {
    fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size].into_boxed_slice(),
            next: 0,
        }
    }

    fn push(&mut self, sample: f64) {
        if let Some(slot) = self.slots.get_mut(self.next) {
            *slot = Some(sample);
        }
        self.next = (self.next + 1) % self.slots.len();
    }

    /// Mean over the samples received so far, `None` before the first one.
    fn mean(&self) -> Option<f64> {
        let (sum, count) = self
            .slots
            .iter()
            .flatten()
            .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
        (count > 0).then(|| sum / count as f64)
    }
}

/// The accumulators of a moving average, without the reader.
#[derive(Debug)]
pub struct MovingAverageState {
    source: StreamId,
    name: Arc<str>,
    declarations: FieldDeclarations<usize>,
    windows: Vec<(Bytes, SampleWindow)>,
    policy: ParsePolicy,
    labels: Vec<(String, String)>,
}

impl MovingAverageState {
    pub fn new(
        source: impl Into<StreamId>,
        windows: FieldDeclarations<usize>,
        policy: ParsePolicy,
    ) -> Result<Self> {
        windows.validate(|size| *size > 0, "needs a window of at least one sample")?;
        let source = source.into();
        let name: Arc<str> = format!("moving_average({source})").into();
        Ok(Self {
            labels: component_metric_labels(&name),
            windows: windows
                .iter()
                .map(|(field, size)| (Bytes::copy_from_slice(field.as_bytes()), SampleWindow::new(*size)))
                .collect(),
            declarations: windows,
            source,
            name,
            policy,
        })
    }

    /// Name of the emitted records, `moving_average(<source>)`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `moving_average(<source>)[(x, 5), (y, 2)]`
    pub fn node_name(&self) -> String {
        format!("{}{}", self.name, self.declarations)
    }

    pub fn source_name(&self) -> &StreamId {
        &self.source
    }

    /// Feeds one record and returns the averaged record. On a parse failure under
    /// [ParsePolicy::Strict] nothing is updated.
    pub fn update(&mut self, record: &StreamRecord) -> Result<DerivedRecord> {
        // parse everything first so a failing record leaves the windows untouched
        let mut samples: Vec<Option<f64>> = Vec::with_capacity(self.windows.len());
        for (field, _) in &self.windows {
            let sample = match record.fields.get(field) {
                Some(raw) => numeric_field(self.policy, &self.labels, record, field, raw)?,
                None => None,
            };
            samples.push(sample);
        }

        let mut passthrough: Vec<(Bytes, f64)> = Vec::new();
        for (field, raw) in record.fields.iter() {
            if self.windows.iter().any(|(declared, _)| declared == field) {
                continue;
            }
            if let Some(value) = numeric_field(self.policy, &self.labels, record, field, raw)? {
                passthrough.push((field.clone(), value));
            }
        }

        let mut values: Vec<(Bytes, f64)> = Vec::with_capacity(self.windows.len() + passthrough.len());
        for ((field, window), sample) in self.windows.iter_mut().zip(samples) {
            if let Some(sample) = sample {
                window.push(sample);
            }
            if let Some(mean) = window.mean() {
                values.push((field.clone(), mean));
            }
        }
        values.extend(passthrough);

        Ok(DerivedRecord {
            name: Arc::clone(&self.name),
            id: record.id,
            values,
        })
    }
}

/// Moving average over a single-stream reader.
///
/// Yields `Err` for a record whose declared or passthrough fields are not numbers when the
/// policy is [ParsePolicy::Strict], and ends right after it. Under [ParsePolicy::Lenient] those
/// fields are skipped and the sequence goes on.
pub struct MovingAverage {
    upstream: Upstream,
    state: MovingAverageState,
    failed: bool,
}

impl MovingAverage {
    pub async fn new<S>(
        reader: FanInReader<S>,
        windows: FieldDeclarations<usize>,
        policy: ParsePolicy,
        cancel: &CancellationToken,
    ) -> Result<Self>
    where
        S: LogSource + Send + Sync + 'static,
    {
        let [source] = reader.streams() else {
            return Err(Error::Config(format!(
                "moving average reads exactly one stream, got {}",
                reader.streams().len()
            )));
        };
        let state = MovingAverageState::new(source.clone(), windows, policy)?;
        Ok(Self {
            upstream: Upstream::start(reader, cancel).await?,
            state,
            failed: false,
        })
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn node_name(&self) -> String {
        self.state.node_name()
    }

    pub fn source_name(&self) -> &StreamId {
        self.state.source_name()
    }

    /// The averaged record for the next input, `None` once the sequence is over.
    pub async fn next(&mut self) -> Option<Result<DerivedRecord>> {
        if self.failed {
            return None;
        }
        let record = self.upstream.next().await?;
        Some(self.on_record(record))
    }

    pub async fn stop(self) -> Result<()> {
        self.upstream.stop().await
    }

    fn on_record(&mut self, record: StreamRecord) -> Result<DerivedRecord> {
        let derived = self.state.update(&record);
        match &derived {
            Ok(_) => {
                stream_tools_metrics()
                    .records_emitted
                    .get_or_create(&self.state.labels)
                    .inc();
            }
            Err(e) => {
                error!(?e, component = %self.state.name, "Stopping moving average");
                self.failed = true;
                self.upstream.cancel();
            }
        }
        derived
    }
}

impl Stream for MovingAverage {
    type Item = Result<DerivedRecord>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.failed {
            return Poll::Ready(None);
        }
        this.upstream
            .poll_next_record(cx)
            .map(|record| record.map(|r| this.on_record(r)))
    }
}
