//! Typed settings of the pipeline building blocks, with their defaults.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::join::JoinMode;
use crate::record::StreamId;
use crate::shared::{FieldDeclarations, ParsePolicy};
use crate::{Error, Result};

const DEFAULT_POLL_TIMEOUT_MILLIS: u64 = 1000;
const DEFAULT_BATCH_SIZE: usize = 64;
const DEFAULT_RETRY_BASE_INTERVAL_MILLIS: u64 = 100;
const DEFAULT_RETRY_MAX_INTERVAL_MILLIS: u64 = 5000;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_GENERATOR_INTERVAL_MILLIS: u64 = 800;
const DEFAULT_GENERATOR_BASE: f64 = 0.5;

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Where a reader starts when it has no cursor yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFrom {
    /// Only records appended after the reader started.
    #[default]
    Latest,
    /// Everything still retained by the log.
    Beginning,
}

/// Channel between a reader and its consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// The reader never waits on a slow consumer.
    #[default]
    Unbounded,
    /// The reader suspends once `capacity` records are waiting to be consumed.
    Bounded { capacity: usize },
}

/// How a failed poll is retried. Cursors stay where they are between attempts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(rename = "base_interval_ms", deserialize_with = "millis")]
    pub base_interval: Duration,
    #[serde(rename = "max_interval_ms", deserialize_with = "millis")]
    pub max_interval: Duration,
    pub factor: f64,
    /// Retry forever when unset.
    pub max_attempts: Option<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(DEFAULT_RETRY_BASE_INTERVAL_MILLIS),
            max_interval: Duration::from_millis(DEFAULT_RETRY_MAX_INTERVAL_MILLIS),
            factor: DEFAULT_RETRY_FACTOR,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// How long a poll waits for new records.
    #[serde(rename = "poll_timeout_ms", deserialize_with = "millis")]
    pub poll_timeout: Duration,
    /// Maximum number of records per poll.
    pub batch_size: usize,
    pub read_from: ReadFrom,
    pub delivery: DeliveryPolicy,
    pub retry: RetryConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MILLIS),
            batch_size: DEFAULT_BATCH_SIZE,
            read_from: ReadFrom::default(),
            delivery: DeliveryPolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if let DeliveryPolicy::Bounded { capacity: 0 } = self.delivery {
            return Err(Error::Config(
                "bounded delivery needs a capacity of at least 1".to_string(),
            ));
        }
        if self.retry.factor < 1.0 || !self.retry.factor.is_finite() {
            return Err(Error::Config(format!(
                "retry factor must be a finite number >= 1, got {}",
                self.retry.factor
            )));
        }
        if self.retry.base_interval > self.retry.max_interval {
            return Err(Error::Config(
                "retry base_interval_ms must not exceed max_interval_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Synthetic producer settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeneratorConfig {
    pub streams: Vec<StreamId>,
    #[serde(rename = "interval_ms", deserialize_with = "millis", default = "default_generator_interval")]
    pub interval: Duration,
    #[serde(default = "default_generator_base")]
    pub base: f64,
    /// Deterministic values when set.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_generator_interval() -> Duration {
    Duration::from_millis(DEFAULT_GENERATOR_INTERVAL_MILLIS)
}

fn default_generator_base() -> f64 {
    DEFAULT_GENERATOR_BASE
}

/// The component a pipeline runs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineSpec {
    Merge {
        streams: Vec<StreamId>,
    },
    Join {
        streams: Vec<StreamId>,
        mode: JoinMode,
    },
    MovingAverage {
        stream: StreamId,
        windows: FieldDeclarations<usize>,
        #[serde(default)]
        on_parse_error: ParsePolicy,
    },
    SumBar {
        stream: StreamId,
        thresholds: FieldDeclarations<f64>,
        #[serde(default)]
        on_parse_error: ParsePolicy,
    },
}

impl PipelineSpec {
    /// Every stream the pipeline reads.
    pub fn streams(&self) -> Vec<StreamId> {
        match self {
            PipelineSpec::Merge { streams } | PipelineSpec::Join { streams, .. } => streams.clone(),
            PipelineSpec::MovingAverage { stream, .. } | PipelineSpec::SumBar { stream, .. } => {
                vec![stream.clone()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reader_defaults() {
        let cfg: ReaderConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(cfg, ReaderConfig::default());
        assert_eq!(cfg.poll_timeout, Duration::from_millis(1000));
        assert_eq!(cfg.read_from, ReadFrom::Latest);
        assert_eq!(cfg.delivery, DeliveryPolicy::Unbounded);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn reader_overrides() {
        let cfg: ReaderConfig = serde_json::from_value(json!({
            "poll_timeout_ms": 250,
            "batch_size": 8,
            "read_from": "beginning",
            "delivery": {"type": "bounded", "capacity": 16},
            "retry": {"base_interval_ms": 10, "max_attempts": 3}
        }))
        .unwrap();
        assert_eq!(cfg.poll_timeout, Duration::from_millis(250));
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.read_from, ReadFrom::Beginning);
        assert_eq!(cfg.delivery, DeliveryPolicy::Bounded { capacity: 16 });
        assert_eq!(cfg.retry.base_interval, Duration::from_millis(10));
        assert_eq!(cfg.retry.max_interval, Duration::from_millis(5000));
        assert_eq!(cfg.retry.max_attempts, Some(3));
    }

    #[test]
    fn invalid_reader_settings() {
        let zero_batch = ReaderConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(zero_batch.validate(), Err(Error::Config(_))));

        let zero_capacity = ReaderConfig {
            delivery: DeliveryPolicy::Bounded { capacity: 0 },
            ..Default::default()
        };
        assert!(matches!(zero_capacity.validate(), Err(Error::Config(_))));

        let mut shrinking = ReaderConfig::default();
        shrinking.retry.factor = 0.5;
        assert!(matches!(shrinking.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn pipeline_specs() {
        let spec: PipelineSpec = serde_json::from_value(json!({
            "type": "moving_average",
            "stream": "s1",
            "windows": [["x", 3], ["y", 2]]
        }))
        .unwrap();
        let PipelineSpec::MovingAverage {
            windows,
            on_parse_error,
            ..
        } = &spec
        else {
            panic!("unexpected spec {spec:?}");
        };
        assert_eq!(windows.len(), 2);
        assert_eq!(*on_parse_error, ParsePolicy::Strict);
        assert_eq!(spec.streams(), vec![StreamId::from("s1")]);

        let spec: PipelineSpec = serde_json::from_value(json!({
            "type": "join",
            "streams": ["a", "b"],
            "mode": {"method": "time_catch", "window_secs": 0.3}
        }))
        .unwrap();
        assert_eq!(spec.streams().len(), 2);

        let bad = serde_json::from_value::<PipelineSpec>(json!({
            "type": "sum_bar",
            "stream": "s1",
            "thresholds": {"x": 10}
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn generator_defaults() {
        let cfg: GeneratorConfig = serde_json::from_value(json!({"streams": ["a"]})).unwrap();
        assert_eq!(cfg.interval, Duration::from_millis(800));
        assert_eq!(cfg.base, 0.5);
        assert_eq!(cfg.seed, None);
    }
}
