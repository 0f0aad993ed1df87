//! Running sums per declared field, emitted and reset as soon as one of them reaches its
//! threshold.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::metrics::{component_metric_labels, stream_tools_metrics};
use crate::reader::{FanInReader, Upstream};
use crate::record::{DerivedRecord, StreamId, StreamRecord};
use crate::shared::{FieldDeclarations, ParsePolicy, numeric_field};
use crate::source::LogSource;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Accumulator {
    field: Bytes,
    sum: f64,
    /// `None` for fields that were not declared, which never trigger.
    threshold: Option<f64>,
}

/// The running sums of a sum bar, without the reader.
#[derive(Debug)]
pub struct SumBarState {
    source: StreamId,
    name: Arc<str>,
    declarations: FieldDeclarations<f64>,
    sums: Vec<Accumulator>,
    policy: ParsePolicy,
    labels: Vec<(String, String)>,
}

impl SumBarState {
    pub fn new(
        source: impl Into<StreamId>,
        thresholds: FieldDeclarations<f64>,
        policy: ParsePolicy,
    ) -> Result<Self> {
        thresholds.validate(|t| t.is_finite(), "needs a finite threshold")?;
        let source = source.into();
        let name: Arc<str> = format!("sum({source})").into();
        let mut state = Self {
            labels: component_metric_labels(&name),
            sums: Vec::with_capacity(thresholds.len()),
            declarations: thresholds,
            source,
            name,
            policy,
        };
        state.reset();
        Ok(state)
    }

    /// Name of the emitted records, `sum(<source>)`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `sum_bar(<source>)[(x, 5)]`
    pub fn node_name(&self) -> String {
        format!("sum_bar({}){}", self.source, self.declarations)
    }

    pub fn source_name(&self) -> &StreamId {
        &self.source
    }

    /// Current sums, declared fields first.
    pub fn sums(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        self.sums.iter().map(|acc| (&acc.field, acc.sum))
    }

    /// Adds one record to the running sums. Returns the sums when a threshold is reached, after
    /// which every sum starts again from zero. On a parse failure under [ParsePolicy::Strict]
    /// nothing is added.
    pub fn update(&mut self, record: &StreamRecord) -> Result<Option<DerivedRecord>> {
        let mut increments: Vec<(&Bytes, f64)> = Vec::with_capacity(record.fields.len());
        for (field, raw) in record.fields.iter() {
            if let Some(value) = numeric_field(self.policy, &self.labels, record, field, raw)? {
                increments.push((field, value));
            }
        }

        for (field, value) in increments {
            match self.sums.iter_mut().find(|acc| acc.field == field) {
                Some(acc) => acc.sum += value,
                None => self.sums.push(Accumulator {
                    field: field.clone(),
                    sum: value,
                    threshold: None,
                }),
            }
        }

        let triggered = self
            .sums
            .iter()
            .any(|acc| acc.threshold.is_some_and(|t| acc.sum >= t));
        if !triggered {
            return Ok(None);
        }

        let bar = DerivedRecord {
            name: Arc::clone(&self.name),
            id: record.id,
            values: self.sums().map(|(f, v)| (f.clone(), v)).collect(),
        };
        self.reset();
        Ok(Some(bar))
    }

    /// Back to the declared fields at zero.
    fn reset(&mut self) {
        self.sums = self
            .declarations
            .iter()
            .map(|(field, threshold)| Accumulator {
                field: Bytes::copy_from_slice(field.as_bytes()),
                sum: 0.0,
                threshold: Some(*threshold),
            })
            .collect();
    }
}

/// Sum bar over a single-stream reader. A single output may take many input records.
///
/// Like [crate::filters::MovingAverage], a parse failure under [ParsePolicy::Strict] is yielded
/// once as `Err` and ends the sequence.
pub struct SumBar {
    upstream: Upstream,
    state: SumBarState,
    failed: bool,
}

impl SumBar {
    pub async fn new<S>(
        reader: FanInReader<S>,
        thresholds: FieldDeclarations<f64>,
        policy: ParsePolicy,
        cancel: &CancellationToken,
    ) -> Result<Self>
    where
        S: LogSource + Send + Sync + 'static,
    {
        let [source] = reader.streams() else {
            return Err(Error::Config(format!(
                "sum bar reads exactly one stream, got {}",
                reader.streams().len()
            )));
        };
        let state = SumBarState::new(source.clone(), thresholds, policy)?;
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

    /// Waits for the next trigger.
    pub async fn next(&mut self) -> Option<Result<DerivedRecord>> {
        while !self.failed {
            let record = self.upstream.next().await?;
            if let Some(bar) = self.on_record(record) {
                return Some(bar);
            }
        }
        None
    }

    pub async fn stop(self) -> Result<()> {
        self.upstream.stop().await
    }

    fn on_record(&mut self, record: StreamRecord) -> Option<Result<DerivedRecord>> {
        match self.state.update(&record) {
            Ok(Some(bar)) => {
                stream_tools_metrics()
                    .records_emitted
                    .get_or_create(&self.state.labels)
                    .inc();
                Some(Ok(bar))
            }
            Ok(None) => {
                debug!(id = %record.id, component = %self.state.name, "No threshold reached");
                None
            }
            Err(e) => {
                error!(?e, component = %self.state.name, "Stopping sum bar");
                self.failed = true;
                self.upstream.cancel();
                Some(Err(e))
            }
        }
    }
}

impl Stream for SumBar {
    type Item = Result<DerivedRecord>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.failed {
                return Poll::Ready(None);
            }
            let Some(record) = std::task::ready!(this.upstream.poll_next_record(cx)) else {
                return Poll::Ready(None);
            };
            if let Some(bar) = this.on_record(record) {
                return Poll::Ready(Some(bar));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::config::{ReadFrom, ReaderConfig};
    use crate::record::{Fields, RecordId};
    use crate::source::memory::MemoryLog;

    fn record(seq: u64, fields: &[(&'static str, &'static str)]) -> StreamRecord {
        StreamRecord::new(
            "src",
            RecordId::new(2000, seq),
            fields.iter().copied().collect(),
        )
    }

    fn state(thresholds: serde_json::Value) -> SumBarState {
        SumBarState::new(
            "src",
            FieldDeclarations::from_value(thresholds).unwrap(),
            ParsePolicy::Strict,
        )
        .unwrap()
    }

    fn feed(bar: &mut SumBarState, inputs: &[&[(&'static str, &'static str)]]) -> Vec<(u64, Vec<(String, f64)>)> {
        inputs
            .iter()
            .enumerate()
            .filter_map(|(i, fields)| bar.update(&record(i as u64, fields)).unwrap())
            .map(|out| {
                let values = out
                    .values
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), *v))
                    .collect();
                (out.id.seq, values)
            })
            .collect()
    }

    fn sums(values: &[(&str, f64)]) -> Vec<(String, f64)> {
        values.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn triggers_and_resets() {
        let mut bar = state(json!(["x", 10.0]));
        let outputs = feed(
            &mut bar,
            &[
                &[("x", "5")],
                &[("x", "6")],
                &[("x", "3")],
                &[("x", "3")],
                &[("x", "16")],
            ],
        );
        assert_eq!(
            outputs,
            vec![(1, sums(&[("x", 11.0)])), (4, sums(&[("x", 22.0)]))]
        );
    }

    #[test]
    fn undeclared_fields_are_summed_but_never_trigger() {
        let mut bar = state(json!(["x", 10.0]));
        let outputs = feed(
            &mut bar,
            &[&[("x", "5"), ("y", "10")], &[("x", "6"), ("y", "20")], &[("y", "100")]],
        );
        assert_eq!(outputs, vec![(1, sums(&[("x", 11.0), ("y", 30.0)]))]);
        // after the reset only the declared field is left
        assert_eq!(bar.sums().map(|(_, v)| v).collect::<Vec<_>>(), vec![0.0, 100.0]);
    }

    #[test]
    fn any_field_triggers_for_all() {
        let mut bar = state(json!([["x", 10.0], ["y", 20.0]]));
        let outputs = feed(
            &mut bar,
            &[
                &[("x", "5"), ("y", "10")],
                &[("x", "6"), ("y", "20")],
                &[("x", "3"), ("y", "22")],
                &[("x", "3"), ("y", "2")],
                &[("x", "16"), ("y", "22")],
            ],
        );
        assert_eq!(
            outputs,
            vec![
                (1, sums(&[("x", 11.0), ("y", 30.0)])),
                (2, sums(&[("x", 3.0), ("y", 22.0)])),
                (4, sums(&[("x", 19.0), ("y", 24.0)])),
            ]
        );
    }

    #[test]
    fn absent_declared_fields_report_zero() {
        let mut bar = state(json!([["x", 10.0], ["y", 25.0]]));
        let outputs = feed(&mut bar, &[&[("x", "5")], &[("x", "6")]]);
        assert_eq!(outputs, vec![(1, sums(&[("x", 11.0), ("y", 0.0)]))]);
    }

    #[test]
    fn strict_parse_failure_adds_nothing() {
        let mut bar = state(json!(["x", 10.0]));
        bar.update(&record(0, &[("x", "4")])).unwrap();
        let err = bar.update(&record(1, &[("x", "5"), ("y", "abc")])).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        assert_eq!(bar.sums().collect::<Vec<_>>(), vec![(&Bytes::from_static(b"x"), 4.0)]);
    }

    #[test]
    fn lenient_skips_bad_fields() {
        let mut bar = SumBarState::new(
            "src",
            FieldDeclarations::single("x", 10.0),
            ParsePolicy::Lenient,
        )
        .unwrap();
        assert!(bar.update(&record(0, &[("x", "4"), ("y", "abc")])).unwrap().is_none());
        let out = bar.update(&record(1, &[("x", "x"), ("z", "1")])).unwrap();
        assert!(out.is_none());
        assert_eq!(bar.sums().count(), 2);
    }

    #[test]
    fn names_and_thresholds() {
        let bar = state(json!(["x", 5]));
        assert_eq!(bar.name(), "sum(src)");
        assert_eq!(bar.node_name(), "sum_bar(src)[(x, 5)]");

        let result = SumBarState::new(
            "src",
            FieldDeclarations::single("x", f64::INFINITY),
            ParsePolicy::Strict,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    fn reader(log: &MemoryLog) -> FanInReader<MemoryLog> {
        FanInReader::new(
            log.clone(),
            ["src"],
            ReaderConfig {
                poll_timeout: Duration::from_millis(20),
                read_from: ReadFrom::Beginning,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn waits_for_the_trigger() {
        let log = MemoryLog::new();
        let cancel = CancellationToken::new();
        let mut bar = SumBar::new(
            reader(&log),
            FieldDeclarations::single("x", 10.0),
            ParsePolicy::Strict,
            &cancel,
        )
        .await
        .unwrap();

        for v in ["5", "6", "3", "3", "16"] {
            let fields: Fields = [("x", v)].into_iter().collect();
            log.append(&"src".into(), fields).await.unwrap();
        }

        let first = bar.next().await.unwrap().unwrap();
        assert_eq!(first.get("x"), Some(11.0));
        let second = StreamExt::next(&mut bar).await.unwrap().unwrap();
        assert_eq!(second.get("x"), Some(22.0));

        cancel.cancel();
        assert!(bar.next().await.is_none());
        bar.stop().await.unwrap();
    }
}
