//! Generator appends `{val: <number>}` records to a set of streams at a fixed pace, so a pipeline
//! has something to chew on without an external producer.

use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::fixed;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::GeneratorConfig;
use crate::record::{Fields, StreamId};
use crate::source::LogSource;
use crate::{Error, Result};

const APPEND_RETRY_INTERVAL_MILLIS: u64 = 10;
const APPEND_RETRY_ATTEMPTS: usize = 5;

/// Field every generated record carries.
pub const VALUE_FIELD: &str = "val";

pub struct Generator<S> {
    log: S,
    streams: Vec<StreamId>,
    interval: Duration,
    /// Generated values are uniformly spread over `[base, base + 1)`.
    base: f64,
    rng: StdRng,
}

impl<S> Generator<S>
where
    S: LogSource + Send + Sync + 'static,
{
    pub fn new(log: S, config: &GeneratorConfig) -> Result<Self> {
        if config.streams.is_empty() {
            return Err(Error::Config(
                "generator needs at least one stream".to_string(),
            ));
        }
        if config.interval.is_zero() {
            return Err(Error::Config(
                "generator interval must be greater than zero".to_string(),
            ));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            log,
            streams: config.streams.clone(),
            interval: config.interval,
            base: config.base,
            rng,
        })
    }

    /// Appends one record to every stream.
    pub async fn tick(&mut self) -> Result<()> {
        for stream in &self.streams {
            let value = self.base + self.rng.random::<f64>();
            let fields: Fields = [(VALUE_FIELD, value.to_string())].into_iter().collect();

            let interval = fixed::Interval::from_millis(APPEND_RETRY_INTERVAL_MILLIS)
                .take(APPEND_RETRY_ATTEMPTS);
            let log = &self.log;
            let id = Retry::new(interval, |e: &Error| e.is_retryable())
                .run(|| log.append(stream, fields.clone()))
                .await?;
            debug!(%stream, %id, value, "Generated record");
        }
        Ok(())
    }

    /// Generates till cancelled.
    pub fn start(mut self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            info!(streams = ?self.streams, interval = ?self.interval, "Starting generator");
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            error!(?e, "Generator failed to append");
                            return Err(e);
                        }
                    }
                }
            }
            info!("Generator stopped");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemoryLog;

    fn config(streams: &[&str]) -> GeneratorConfig {
        GeneratorConfig {
            streams: streams.iter().map(|s| StreamId::from(*s)).collect(),
            interval: Duration::from_millis(5),
            base: 1.5,
            seed: Some(7),
        }
    }

    #[tokio::test]
    async fn tick_appends_to_every_stream() {
        let log = MemoryLog::new();
        let mut generator = Generator::new(log.clone(), &config(&["a", "b"])).unwrap();

        generator.tick().await.unwrap();
        generator.tick().await.unwrap();
        assert_eq!(log.len("a"), 2);
        assert_eq!(log.len("b"), 2);
    }

    #[tokio::test]
    async fn values_stay_in_range() {
        let log = MemoryLog::new();
        let mut generator = Generator::new(log.clone(), &config(&["a"])).unwrap();
        for _ in 0..20 {
            generator.tick().await.unwrap();
        }

        let cursors = [(StreamId::from("a"), crate::record::RecordId::ZERO)]
            .into_iter()
            .collect();
        let batch = log
            .poll(&cursors, 100, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(batch.len(), 20);
        for record in batch {
            let value = crate::shared::parse_f64(record.fields.get(VALUE_FIELD).unwrap()).unwrap();
            assert!((1.5..2.5).contains(&value));
        }
    }

    #[tokio::test]
    async fn transient_append_failures_are_retried() {
        let log = MemoryLog::new();
        log.error_injector().fail_appends(2);
        let mut generator = Generator::new(log.clone(), &config(&["a"])).unwrap();

        generator.tick().await.unwrap();
        assert_eq!(log.len("a"), 1);
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let log = MemoryLog::new();
        let cancel = CancellationToken::new();
        let handle = Generator::new(log.clone(), &config(&["a"]))
            .unwrap()
            .start(cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(log.len("a") > 0);
    }

    #[test]
    fn rejects_empty_streams() {
        assert!(matches!(
            Generator::new(MemoryLog::new(), &config(&[])),
            Err(Error::Config(_))
        ));
    }
}
