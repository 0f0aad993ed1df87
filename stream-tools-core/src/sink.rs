use std::sync::Arc;

use serde::Serialize;

use crate::{Error, Result};

/// Writes every output of a pipeline to the log as one JSON line.
pub(crate) struct LogSink {
    component: Arc<str>,
    written: u64,
}

impl LogSink {
    pub(crate) fn new(component: impl Into<Arc<str>>) -> Self {
        Self {
            component: component.into(),
            written: 0,
        }
    }

    /// Logs the output and returns the payload that was written.
    pub(crate) fn write<T: Serialize>(&mut self, output: &T) -> Result<String> {
        let payload = serde_json::to_string(output)
            .map_err(|e| Error::Parse(format!("output is not serializable: {e}")))?;
        self.written += 1;
        tracing::info!(
            component = %self.component,
            seq = self.written,
            "Payload - {}",
            payload
        );
        Ok(payload)
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }
}
