use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;
use serde_json::from_slice;

use crate::Error;
use crate::Result;

/// Environment variable holding the base64 encoded JSON settings of the process.
pub const ENV_PIPELINE_OBJECT: &str = "STREAM_TOOLS_PIPELINE_OBJECT";

const DEFAULT_METRICS_PORT: u16 = 2469;

/// Reader, producer and pipeline settings.
pub mod components;

pub use components::{
    DeliveryPolicy, GeneratorConfig, PipelineSpec, ReadFrom, ReaderConfig, RetryConfig,
};

/// Settings of one stream-tools process.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub pipeline: PipelineSpec,
    #[serde(default)]
    pub reader: ReaderConfig,
    /// Synthetic records appended to the log while the pipeline runs.
    #[serde(default)]
    pub generator: Option<GeneratorConfig>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Max records kept per stream by the in-memory log.
    #[serde(default)]
    pub max_len: Option<usize>,
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

impl Settings {
    /// Loads the settings from [ENV_PIPELINE_OBJECT] among the given variables, usually
    /// `std::env::vars()`.
    pub fn load<K, V>(env_vars: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let encoded: String = env_vars
            .into_iter()
            .find_map(|(k, v)| {
                let key: String = k.into();
                (key == ENV_PIPELINE_OBJECT).then(|| v.into())
            })
            .ok_or_else(|| Error::Config(format!("{ENV_PIPELINE_OBJECT} is not set")))?;

        let decoded = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Failed to decode pipeline settings: {e:?}")))?;
        let settings: Settings = from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse pipeline settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        self.reader.validate()?;
        if self.max_len == Some(0) {
            return Err(Error::Config("max_len must be at least 1".to_string()));
        }
        if self
            .generator
            .as_ref()
            .is_some_and(|generator| generator.streams.is_empty())
        {
            return Err(Error::Config("generator without streams".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use base64::Engine;
    use base64::prelude::BASE64_STANDARD;
    use serde_json::json;

    use super::*;
    use crate::join::JoinMode;
    use crate::record::StreamId;

    fn env(value: serde_json::Value) -> Vec<(String, String)> {
        vec![
            ("HOME".to_string(), "/root".to_string()),
            (
                ENV_PIPELINE_OBJECT.to_string(),
                BASE64_STANDARD.encode(value.to_string()),
            ),
        ]
    }

    #[test]
    fn test_settings_load_join() {
        let settings = Settings::load(env(json!({
            "pipeline": {
                "type": "join",
                "streams": ["stream_1", "stream_2"],
                "mode": {"method": "time_catch", "window_secs": 0.5}
            },
            "reader": {"poll_timeout_ms": 200},
            "generator": {"streams": ["stream_1", "stream_2"], "seed": 7},
            "max_len": 1000
        })))
        .unwrap();

        assert_eq!(
            settings.pipeline,
            PipelineSpec::Join {
                streams: vec![StreamId::from("stream_1"), StreamId::from("stream_2")],
                mode: JoinMode::TimeCatch {
                    window: Duration::from_millis(500)
                },
            }
        );
        assert_eq!(settings.reader.poll_timeout, Duration::from_millis(200));
        assert_eq!(settings.reader.batch_size, ReaderConfig::default().batch_size);
        assert_eq!(settings.metrics_port, 2469);
        assert_eq!(settings.max_len, Some(1000));
        let generator = settings.generator.unwrap();
        assert_eq!(generator.seed, Some(7));
        assert_eq!(generator.interval, Duration::from_millis(800));
    }

    #[test]
    fn test_settings_load_filters() {
        let settings = Settings::load(env(json!({
            "pipeline": {
                "type": "moving_average",
                "stream": "prices",
                "windows": [["x", 3], ["y", 2]],
                "on_parse_error": "lenient"
            },
            "metrics_port": 9090
        })))
        .unwrap();
        assert_eq!(settings.metrics_port, 9090);
        assert_eq!(settings.pipeline.streams(), vec![StreamId::from("prices")]);
        assert!(settings.generator.is_none());

        let settings = Settings::load(env(json!({
            "pipeline": {"type": "sum_bar", "stream": "prices", "thresholds": ["x", 10.0]}
        })))
        .unwrap();
        assert!(matches!(settings.pipeline, PipelineSpec::SumBar { .. }));
    }

    #[test]
    fn test_settings_load_errors() {
        assert!(matches!(
            Settings::load(Vec::<(String, String)>::new()),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Settings::load([(ENV_PIPELINE_OBJECT, "not base64!")]),
            Err(Error::Config(_))
        ));

        for bad in [
            json!({"pipeline": {"type": "merge"}}),
            json!({"pipeline": {"type": "unknown", "streams": ["a"]}}),
            json!({"pipeline": {"type": "join", "streams": ["a"], "mode": {"method": "time_catch"}}}),
            json!({"pipeline": {"type": "moving_average", "stream": "a", "windows": []}}),
            json!({"pipeline": {"type": "merge", "streams": ["a"]}, "reader": {"batch_size": 0}}),
            json!({"pipeline": {"type": "merge", "streams": ["a"]}, "max_len": 0}),
        ] {
            assert!(
                matches!(Settings::load(env(bad.clone())), Err(Error::Config(_))),
                "{bad}"
            );
        }
    }
}
