//! FanInReader polls a set of streams from a [LogSource] and pushes every new record into a
//! private delivery channel, in the order the log made them visible.
//!
//! The cursor of a stream only moves once its record has been handed to the channel, so a
//! failed poll is retried from the same position and nothing is skipped. Delivery is
//! at-least-once: records handed over but not yet consumed when the process dies are read
//! again by the next reader starting from the same cursors.
//!
//! ```text
//!   (LogSource) --poll(cursors)--> [FanInReader] --send--> (RecordStream) --> Merge/Join/filters
//!                      ^                 |
//!                      +--- advance -----+
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::config::{DeliveryPolicy, ReadFrom, ReaderConfig};
use crate::metrics::{reader_metric_labels, stream_metric_labels, stream_tools_metrics};
use crate::record::{RecordId, StreamId, StreamRecord};
use crate::source::LogSource;
use crate::{Error, Result};

/// Reads a fixed set of streams. One reader feeds exactly one consumer.
pub struct FanInReader<S> {
    source: S,
    streams: Vec<StreamId>,
    cfg: ReaderConfig,
    /// Used in logs and metric labels.
    name: Arc<str>,
}

impl<S> FanInReader<S>
where
    S: LogSource + Send + Sync + 'static,
{
    pub fn new<T: Into<StreamId>>(
        source: S,
        streams: impl IntoIterator<Item = T>,
        cfg: ReaderConfig,
    ) -> Result<Self> {
        let mut unique: Vec<StreamId> = Vec::new();
        for stream in streams.into_iter().map(Into::into) {
            if !unique.contains(&stream) {
                unique.push(stream);
            }
        }
        if unique.is_empty() {
            return Err(Error::Config("reader needs at least one stream".to_string()));
        }
        cfg.validate()?;

        let name = unique
            .iter()
            .map(StreamId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        Ok(Self {
            source,
            streams: unique,
            cfg,
            name: name.into(),
        })
    }

    pub fn streams(&self) -> &[StreamId] {
        &self.streams
    }

    /// Streaming read from the log, returns the delivered records and a JoinHandle for
    /// monitoring errors. The reader stops when the token is cancelled or the stream is dropped.
    pub async fn streaming_read(
        self,
        cancel: CancellationToken,
    ) -> Result<(RecordStream, JoinHandle<Result<()>>)> {
        let mut cursors = self.initial_cursors().await?;
        let (tx, records) = delivery_channel(self.cfg.delivery);

        let handle = tokio::spawn(async move {
            info!(reader = %self.name, ?cursors, "Starting reader");
            let labels: HashMap<StreamId, Vec<(String, String)>> = self
                .streams
                .iter()
                .map(|s| (s.clone(), stream_metric_labels(s)))
                .collect();

            loop {
                if cancel.is_cancelled() {
                    break;
                }

                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = self.poll(&cursors, &cancel) => batch,
                };
                let batch = match batch {
                    Ok(batch) => batch,
                    // a cancelled retry hands back its last error
                    Err(_) if cancel.is_cancelled() => break,
                    Err(e) => {
                        error!(?e, reader = %self.name, "Giving up polling the log");
                        return Err(e);
                    }
                };

                for record in batch {
                    let (stream, id) = (record.stream.clone(), record.id);
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        sent = tx.send(record) => sent,
                    };
                    if sent.is_err() {
                        info!(reader = %self.name, "Consumer is gone, stopping reader");
                        return Ok(());
                    }
                    if let Some(labels) = labels.get(&stream) {
                        stream_tools_metrics().records_read.get_or_create(labels).inc();
                    }
                    cursors.insert(stream, id);
                }
            }

            info!(reader = %self.name, "Reader stopped");
            Ok(())
        });

        Ok((records, handle))
    }

    async fn initial_cursors(&self) -> Result<HashMap<StreamId, RecordId>> {
        let mut cursors = HashMap::with_capacity(self.streams.len());
        for stream in &self.streams {
            let cursor = match self.cfg.read_from {
                ReadFrom::Beginning => RecordId::ZERO,
                ReadFrom::Latest => self
                    .source
                    .last_id(stream)
                    .await?
                    .unwrap_or(RecordId::ZERO),
            };
            cursors.insert(stream.clone(), cursor);
        }
        Ok(cursors)
    }

    /// Polls once, retrying an unavailable log with backoff and the same cursors.
    async fn poll(
        &self,
        cursors: &HashMap<StreamId, RecordId>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamRecord>> {
        let retry = &self.cfg.retry;
        let backoff = Exponential::new(
            retry.base_interval,
            retry.max_interval,
            retry.factor,
            retry.max_attempts,
        );
        let labels = reader_metric_labels(&self.name);
        let condition = |e: &Error| {
            if !e.is_retryable() {
                return false;
            }
            warn!(?e, reader = %self.name, "Poll failed, retrying with the same cursors");
            stream_tools_metrics().poll_errors.get_or_create(&labels).inc();
            true
        };

        let (source, max, timeout) = (&self.source, self.cfg.batch_size, self.cfg.poll_timeout);
        let batch = Retry::new(backoff, condition)
            .with_cancellation(cancel.clone())
            .run(|| source.poll(cursors, max, timeout))
            .await?;
        debug!(reader = %self.name, count = batch.len(), "Polled batch");
        Ok(batch)
    }
}

enum DeliverySender {
    Bounded(mpsc::Sender<StreamRecord>),
    Unbounded(mpsc::UnboundedSender<StreamRecord>),
}

impl DeliverySender {
    /// Fails only when the consumer is gone.
    async fn send(&self, record: StreamRecord) -> Result<()> {
        let closed = |_| Error::Closed("delivery channel receiver dropped".to_string());
        match self {
            DeliverySender::Bounded(tx) => tx.send(record).await.map_err(closed),
            DeliverySender::Unbounded(tx) => tx.send(record).map_err(closed),
        }
    }
}

fn delivery_channel(policy: DeliveryPolicy) -> (DeliverySender, RecordStream) {
    match policy {
        DeliveryPolicy::Bounded { capacity } => {
            let (tx, rx) = mpsc::channel(capacity);
            (
                DeliverySender::Bounded(tx),
                RecordStream::Bounded(ReceiverStream::new(rx)),
            )
        }
        DeliveryPolicy::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                DeliverySender::Unbounded(tx),
                RecordStream::Unbounded(UnboundedReceiverStream::new(rx)),
            )
        }
    }
}

/// Records delivered by a [FanInReader]. Ends once the reader has stopped and everything it
/// sent was consumed.
pub enum RecordStream {
    Bounded(ReceiverStream<StreamRecord>),
    Unbounded(UnboundedReceiverStream<StreamRecord>),
}

impl Stream for RecordStream {
    type Item = StreamRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            RecordStream::Bounded(rx) => Pin::new(rx).poll_next(cx),
            RecordStream::Unbounded(rx) => Pin::new(rx).poll_next(cx),
        }
    }
}

/// The reader side of a pipeline component. Dropping it cancels the reader.
pub(crate) struct Upstream {
    records: RecordStream,
    handle: JoinHandle<Result<()>>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl Upstream {
    /// Starts the reader on a child of `cancel`.
    pub(crate) async fn start<S>(reader: FanInReader<S>, cancel: &CancellationToken) -> Result<Self>
    where
        S: LogSource + Send + Sync + 'static,
    {
        let cancel = cancel.child_token();
        let (records, handle) = reader.streaming_read(cancel.clone()).await?;
        Ok(Self {
            records,
            handle,
            _guard: cancel.clone().drop_guard(),
            cancel,
        })
    }

    pub(crate) async fn next(&mut self) -> Option<StreamRecord> {
        self.records.next().await
    }

    pub(crate) fn poll_next_record(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamRecord>> {
        Pin::new(&mut self.records).poll_next(cx)
    }

    /// Stops the reader without waiting for it.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels the reader and waits for it, surfacing the error that ended it, if any.
    pub(crate) async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.handle
            .await
            .map_err(|e| Error::Closed(format!("reader task failed: {e}")))?
    }
}
