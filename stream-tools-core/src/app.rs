//! Routing of records to async handlers registered per stream.
//!
//! An [App] reads every stream that has a handler through one [FanInReader] and calls, for each
//! record, the agents of its stream and then the merge handlers covering it, each list in
//! registration order. A failing handler is logged and does not stop the dispatch.
//!
//! Handlers registered with [App::agent_to] or [App::merge_to] may return fields, which are
//! appended to a target stream of the same log. A handler on that stream sees them like any
//! other record, which chains handlers into small pipelines.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::{ReadFrom, ReaderConfig};
use crate::reader::{FanInReader, Upstream};
use crate::record::{Fields, StreamId, StreamRecord};
use crate::source::LogSource;

/// A registered callback.
pub type Handler = Arc<dyn Fn(StreamRecord) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    name: Arc<str>,
    handler: Handler,
}

#[derive(Default)]
struct Routes {
    agents: Vec<Registration>,
    merges: Vec<Registration>,
}

/// Handlers keyed by stream, over one log.
pub struct App<S> {
    source: S,
    routes: BTreeMap<StreamId, Routes>,
    reader: ReaderConfig,
}

fn boxed<F, Fut>(handler: F) -> Handler
where
    F: Fn(StreamRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |record| handler(record).boxed())
}

/// Wraps a handler so that the fields it returns are appended to `target`.
fn forwarding<S, F, Fut>(source: S, target: StreamId, handler: F) -> Handler
where
    S: LogSource + Clone + Send + Sync + 'static,
    F: Fn(StreamRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Fields>>> + Send + 'static,
{
    Arc::new(move |record| {
        let output = handler(record);
        let source = source.clone();
        let target = target.clone();
        async move {
            let Some(fields) = output.await? else {
                return Ok(());
            };
            let id = source.append(&target, fields).await?;
            debug!(stream = %target, %id, "Forwarded handler output");
            Ok(())
        }
        .boxed()
    })
}

impl<S> App<S>
where
    S: LogSource + Clone + Send + Sync + 'static,
{
    /// Dispatches every record from the beginning of the streams.
    pub fn new(source: S) -> Self {
        Self {
            source,
            routes: BTreeMap::new(),
            reader: ReaderConfig {
                read_from: ReadFrom::Beginning,
                ..Default::default()
            },
        }
    }

    /// Replaces the reader settings, including where reading starts.
    pub fn with_reader_config(mut self, reader: ReaderConfig) -> Self {
        self.reader = reader;
        self
    }

    /// Calls `handler` with every record of `stream`.
    pub fn agent<F, Fut>(self, stream: impl Into<StreamId>, name: &str, handler: F) -> Self
    where
        F: Fn(StreamRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_agent(stream.into(), name, boxed(handler))
    }

    /// Like [App::agent], appending every `Some` output of `handler` to `target`.
    pub fn agent_to<F, Fut>(
        self,
        stream: impl Into<StreamId>,
        name: &str,
        target: impl Into<StreamId>,
        handler: F,
    ) -> Self
    where
        F: Fn(StreamRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Fields>>> + Send + 'static,
    {
        let handler = forwarding(self.source.clone(), target.into(), handler);
        self.register_agent(stream.into(), name, handler)
    }

    /// Calls `handler` with every record of any of `streams`.
    pub fn merge<F, Fut, T>(
        self,
        streams: impl IntoIterator<Item = T>,
        name: &str,
        handler: F,
    ) -> Self
    where
        T: Into<StreamId>,
        F: Fn(StreamRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_merge(streams, name, boxed(handler))
    }

    /// Like [App::merge], appending every `Some` output of `handler` to `target`.
    pub fn merge_to<F, Fut, T>(
        self,
        streams: impl IntoIterator<Item = T>,
        name: &str,
        target: impl Into<StreamId>,
        handler: F,
    ) -> Self
    where
        T: Into<StreamId>,
        F: Fn(StreamRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Fields>>> + Send + 'static,
    {
        let handler = forwarding(self.source.clone(), target.into(), handler);
        self.register_merge(streams, name, handler)
    }

    fn register_agent(mut self, stream: StreamId, name: &str, handler: Handler) -> Self {
        self.routes
            .entry(stream)
            .or_default()
            .agents
            .push(Registration {
                name: name.into(),
                handler,
            });
        self
    }

    fn register_merge<T: Into<StreamId>>(
        mut self,
        streams: impl IntoIterator<Item = T>,
        name: &str,
        handler: Handler,
    ) -> Self {
        let registration = Registration {
            name: name.into(),
            handler,
        };
        for stream in streams {
            self.routes
                .entry(stream.into())
                .or_default()
                .merges
                .push(registration.clone());
        }
        self
    }

    /// Streams with at least one handler.
    pub fn streams(&self) -> Vec<StreamId> {
        self.routes.keys().cloned().collect()
    }

    /// Dispatches until `cancel` fires or the reader gives up.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.report_unrouted().await;

        let reader = FanInReader::new(self.source, self.routes.keys().cloned(), self.reader)?;
        let mut upstream = Upstream::start(reader, &cancel).await?;
        info!(streams = ?self.routes.keys().collect::<Vec<_>>(), "Dispatching records");

        while let Some(record) = upstream.next().await {
            let Some(routes) = self.routes.get(&record.stream) else {
                continue;
            };
            for (kind, registration) in routes
                .agents
                .iter()
                .map(|r| ("agent", r))
                .chain(routes.merges.iter().map(|r| ("merge", r)))
            {
                debug!(
                    kind,
                    handler = %registration.name,
                    stream = %record.stream,
                    id = %record.id,
                    "Executing handler"
                );
                if let Err(e) = (registration.handler)(record.clone()).await {
                    error!(?e, kind, handler = %registration.name, id = %record.id, "Handler failed");
                }
            }
        }

        upstream.stop().await
    }

    /// Warns about routed streams the log does not know and log streams nobody handles.
    async fn report_unrouted(&self) {
        let known = match self.source.streams().await {
            Ok(known) => known,
            Err(e) => {
                warn!(?e, "Could not list the streams of the log");
                return;
            }
        };
        let missing: Vec<&StreamId> = self
            .routes
            .keys()
            .filter(|s| !known.contains(*s))
            .collect();
        let unhandled: Vec<&StreamId> = known
            .iter()
            .filter(|s| !self.routes.contains_key(*s))
            .collect();
        if !missing.is_empty() {
            warn!(?missing, "Streams not in the log");
        }
        if !unhandled.is_empty() {
            warn!(?unhandled, "Streams without handlers");
        }
    }
}
