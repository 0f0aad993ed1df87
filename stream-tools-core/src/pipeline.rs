use std::env;
use std::net::SocketAddr;

use futures::Stream;
use serde::Serialize;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;
use crate::bars::SumBar;
use crate::config::{PipelineSpec, Settings};
use crate::filters::MovingAverage;
use crate::join::Join;
use crate::merge::Merge;
use crate::metrics::start_metrics_server;
use crate::reader::FanInReader;
use crate::sink::LogSink;
use crate::source::generator::Generator;
use crate::source::memory::MemoryLog;

/// Runs the pipeline configured in the environment till SIGINT or SIGTERM.
pub async fn run() -> Result<()> {
    let settings = Settings::load(env::vars())?;
    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle: JoinHandle<()> = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let metrics_handle = tokio::spawn(start_metrics_server(metrics_addr, cln_token.clone()));

    let log = match settings.max_len {
        Some(max_len) => MemoryLog::new().with_max_len(max_len),
        None => MemoryLog::new(),
    };
    let generator_handle = match &settings.generator {
        Some(cfg) => Some(Generator::new(log.clone(), cfg)?.start(cln_token.clone())),
        None => None,
    };

    let result = run_with(&settings, log, cln_token.clone()).await;
    match &result {
        Ok(written) => info!(written, "Pipeline finished"),
        Err(e) => error!(?e, "Pipeline failed"),
    }

    cln_token.cancel();
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    if let Some(handle) = generator_handle {
        match handle.await {
            Ok(Err(e)) => error!(?e, "Generator failed"),
            Err(e) => error!(?e, "Generator task failed"),
            Ok(Ok(())) => {}
        }
    }
    match metrics_handle.await {
        Ok(Err(e)) => error!(?e, "Metrics server failed"),
        Err(e) => error!(?e, "Metrics server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Gracefully Exiting...");
    result.map(|_| ())
}

/// Builds the configured component over `log` and writes its outputs to the log sink till
/// `cancel` fires. Returns how many outputs were written.
pub async fn run_with(settings: &Settings, log: MemoryLog, cancel: CancellationToken) -> Result<u64> {
    let reader = FanInReader::new(log, settings.pipeline.streams(), settings.reader.clone())?;

    match &settings.pipeline {
        PipelineSpec::Merge { streams } => {
            let mut sink = LogSink::new(format!("merge({})", join_names(streams)));
            let mut merge = Merge::new(reader, &cancel).await?;
            let drained = drain((&mut merge).map(Ok), &mut sink).await;
            let stopped = merge.stop().await;
            drained.and(stopped).map(|_| sink.written())
        }
        PipelineSpec::Join { streams, mode } => {
            let mut sink = LogSink::new(format!("join_{}({})", mode.name(), join_names(streams)));
            let mut join = Join::new(reader, *mode, &cancel).await?;
            let drained = drain((&mut join).map(Ok), &mut sink).await;
            let stopped = join.stop().await;
            drained.and(stopped).map(|_| sink.written())
        }
        PipelineSpec::MovingAverage {
            windows,
            on_parse_error,
            ..
        } => {
            let mut avg = MovingAverage::new(reader, windows.clone(), *on_parse_error, &cancel).await?;
            let mut sink = LogSink::new(avg.node_name());
            let drained = drain(&mut avg, &mut sink).await;
            let stopped = avg.stop().await;
            drained.and(stopped).map(|_| sink.written())
        }
        PipelineSpec::SumBar {
            thresholds,
            on_parse_error,
            ..
        } => {
            let mut bar = SumBar::new(reader, thresholds.clone(), *on_parse_error, &cancel).await?;
            let mut sink = LogSink::new(bar.node_name());
            let drained = drain(&mut bar, &mut sink).await;
            let stopped = bar.stop().await;
            drained.and(stopped).map(|_| sink.written())
        }
    }
}

/// Writes outputs till the component ends. The first failed output ends the drain.
async fn drain<St, T>(mut outputs: St, sink: &mut LogSink) -> Result<()>
where
    St: Stream<Item = Result<T>> + Unpin,
    T: Serialize,
{
    while let Some(output) = outputs.next().await {
        sink.write(&output?)?;
    }
    Ok(())
}

fn join_names(streams: &[crate::record::StreamId]) -> String {
    streams
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::Error;
    use crate::config::{ReadFrom, ReaderConfig};
    use crate::record::Fields;
    use crate::source::LogSource;

    fn settings(pipeline: serde_json::Value) -> Settings {
        Settings {
            pipeline: serde_json::from_value(pipeline).unwrap(),
            reader: ReaderConfig {
                poll_timeout: Duration::from_millis(20),
                read_from: ReadFrom::Beginning,
                ..Default::default()
            },
            generator: None,
            metrics_port: 0,
            max_len: None,
        }
    }

    fn val(v: &'static str) -> Fields {
        [("val", v)].into_iter().collect()
    }

    #[tokio::test]
    async fn merge_writes_every_record() {
        let log = MemoryLog::new();
        for (stream, v) in [("a", "1"), ("b", "2"), ("a", "3")] {
            log.append(&stream.into(), val(v)).await.unwrap();
        }

        let settings = settings(json!({"type": "merge", "streams": ["a", "b"]}));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { run_with(&settings, log, cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn sum_bar_writes_only_triggers() {
        let log = MemoryLog::new();
        for v in ["5", "6", "3", "3", "16"] {
            log.append(&"src".into(), val(v)).await.unwrap();
        }

        let settings = settings(json!({
            "type": "sum_bar",
            "stream": "src",
            "thresholds": ["val", 10.0]
        }));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { run_with(&settings, log, cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn strict_parse_error_ends_the_pipeline() {
        let log = MemoryLog::new();
        for v in ["1", "oops", "3"] {
            log.append(&"src".into(), val(v)).await.unwrap();
        }

        let settings = settings(json!({
            "type": "moving_average",
            "stream": "src",
            "windows": ["val", 2]
        }));
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            run_with(&settings, log, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::Parse(_))));
    }
}
