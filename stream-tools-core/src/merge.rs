//! Merge republishes every record of its streams, unmodified, in the order the log made them
//! visible.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::metrics::{component_metric_labels, stream_tools_metrics};
use crate::reader::{FanInReader, Upstream};
use crate::record::StreamRecord;
use crate::source::LogSource;

pub struct Merge {
    upstream: Upstream,
    labels: Vec<(String, String)>,
}

impl Merge {
    pub async fn new<S>(reader: FanInReader<S>, cancel: &CancellationToken) -> Result<Self>
    where
        S: LogSource + Send + Sync + 'static,
    {
        let name = format!(
            "merge({})",
            reader
                .streams()
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Self {
            upstream: Upstream::start(reader, cancel).await?,
            labels: component_metric_labels(&name),
        })
    }

    /// The next record, `None` once the reader has stopped for good.
    pub async fn next(&mut self) -> Option<StreamRecord> {
        let record = self.upstream.next().await?;
        stream_tools_metrics()
            .records_emitted
            .get_or_create(&self.labels)
            .inc();
        Some(record)
    }

    /// Stops reading, returning the error that stopped the reader, if any.
    pub async fn stop(self) -> Result<()> {
        self.upstream.stop().await
    }
}

impl Stream for Merge {
    type Item = StreamRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.upstream.poll_next_record(cx);
        if let Poll::Ready(Some(_)) = &polled {
            stream_tools_metrics()
                .records_emitted
                .get_or_create(&this.labels)
                .inc();
        }
        polled
    }
}
