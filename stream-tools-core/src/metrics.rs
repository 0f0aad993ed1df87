//! Prometheus metrics of the pipelines, exposed over HTTP at `/metrics` next to a `/livez`
//! probe.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::record::StreamId;
use crate::{Error, Result};

// The top-level metric registry is created with this prefix
const REGISTRY_PREFIX: &str = "stream_tools";

const RECORDS_READ: &str = "records_read";
const POLL_ERRORS: &str = "poll_errors";
const RECORDS_EMITTED: &str = "records_emitted";
const JOIN_EVICTIONS: &str = "join_evictions";
const PARSE_ERRORS: &str = "parse_errors";

const STREAM_LABEL: &str = "stream";
const READER_LABEL: &str = "reader";
const COMPONENT_LABEL: &str = "component";

struct GlobalRegistry {
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::default()),
        }
    }
}

/// GLOBAL_REGISTRY is the static global registry which is initialized only once.
static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Counters of the readers and the components consuming them. Each is a family keyed by the
/// label pairs given on use.
pub(crate) struct StreamToolsMetrics {
    pub(crate) records_read: Family<Vec<(String, String)>, Counter>,
    pub(crate) poll_errors: Family<Vec<(String, String)>, Counter>,
    pub(crate) records_emitted: Family<Vec<(String, String)>, Counter>,
    pub(crate) join_evictions: Family<Vec<(String, String)>, Counter>,
    pub(crate) parse_errors: Family<Vec<(String, String)>, Counter>,
}

impl StreamToolsMetrics {
    fn new() -> Self {
        let metrics = Self {
            records_read: Family::<Vec<(String, String)>, Counter>::default(),
            poll_errors: Family::<Vec<(String, String)>, Counter>::default(),
            records_emitted: Family::<Vec<(String, String)>, Counter>::default(),
            join_evictions: Family::<Vec<(String, String)>, Counter>::default(),
            parse_errors: Family::<Vec<(String, String)>, Counter>::default(),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
        registry.register(
            RECORDS_READ,
            "A Counter to keep track of the records delivered by the readers, per stream",
            metrics.records_read.clone(),
        );
        registry.register(
            POLL_ERRORS,
            "A Counter to keep track of the failed polls of the log which were retried",
            metrics.poll_errors.clone(),
        );
        registry.register(
            RECORDS_EMITTED,
            "A Counter to keep track of the outputs produced by each component",
            metrics.records_emitted.clone(),
        );
        registry.register(
            JOIN_EVICTIONS,
            "A Counter to keep track of the keys evicted from windowed joins",
            metrics.join_evictions.clone(),
        );
        registry.register(
            PARSE_ERRORS,
            "A Counter to keep track of the field values skipped because they are not numbers",
            metrics.parse_errors.clone(),
        );
        metrics
    }
}

static STREAM_TOOLS_METRICS: OnceLock<StreamToolsMetrics> = OnceLock::new();

pub(crate) fn stream_tools_metrics() -> &'static StreamToolsMetrics {
    STREAM_TOOLS_METRICS.get_or_init(StreamToolsMetrics::new)
}

pub(crate) fn stream_metric_labels(stream: &StreamId) -> Vec<(String, String)> {
    vec![(STREAM_LABEL.to_string(), stream.to_string())]
}

pub(crate) fn reader_metric_labels(reader: &str) -> Vec<(String, String)> {
    vec![(READER_LABEL.to_string(), reader.to_string())]
}

pub(crate) fn component_metric_labels(component: &str) -> Vec<(String, String)> {
    vec![(COMPONENT_LABEL.to_string(), component.to_string())]
}

// metrics_handler is used to generate and return a snapshot of the
// current state of the metrics in the global registry
pub async fn metrics_handler() -> impl IntoResponse {
    // make sure the families are registered even before the first record
    stream_tools_metrics();

    let state = global_registry().registry.lock();
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &state) {
        error!(?e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    debug!("Exposing metrics: {:?}", buffer);
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        Body::from(buffer),
    )
        .into_response()
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// router for metrics and health endpoints
fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

/// Serves the metrics till cancelled.
pub async fn start_metrics_server(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(?addr, "Started metrics server");

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {e}")))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    #[tokio::test]
    async fn exposes_registered_counters() {
        let labels = stream_metric_labels(&StreamId::from("metrics-test-stream"));
        stream_tools_metrics().records_read.get_or_create(&labels).inc();
        stream_tools_metrics()
            .parse_errors
            .get_or_create(&component_metric_labels("moving_average(metrics-test-stream)"))
            .inc_by(2);

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains(r#"stream_tools_records_read_total{stream="metrics-test-stream"}"#));
        assert!(text.contains(
            r#"stream_tools_parse_errors_total{component="moving_average(metrics-test-stream)"} 2"#
        ));
        assert!(text.contains("# TYPE stream_tools_poll_errors counter"));
    }

    #[tokio::test]
    async fn livez_has_no_content() {
        assert_eq!(livez().await.into_response().status(), StatusCode::NO_CONTENT);
    }
}
