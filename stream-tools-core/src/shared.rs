//! Pieces shared by the aggregation filters.

use serde::Deserialize;
use tracing::warn;

use crate::metrics::stream_tools_metrics;
use crate::record::StreamRecord;
use crate::{Error, Result};

/// `(field, parameter)` declarations of the aggregation filters.
pub mod declarations;

pub use declarations::FieldDeclarations;

/// What an aggregation does with a field value that is not a number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsePolicy {
    /// The record fails and the pipeline ends with [Error::Parse].
    #[default]
    Strict,
    /// The field is skipped for that record only.
    Lenient,
}

/// Parses a raw field value as a finite float. Surrounding whitespace is ignored.
pub fn parse_f64(raw: &[u8]) -> Result<f64> {
    let invalid = || Error::Parse(format!("{:?} is not a number", String::from_utf8_lossy(raw)));
    let text = std::str::from_utf8(raw).map_err(|_| invalid())?;
    let value: f64 = text.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() {
        return Err(invalid());
    }
    Ok(value)
}

/// Coerces one field of a record to a number, applying the parse policy. `Ok(None)` means the
/// field is skipped for this record.
#[allow(clippy::ptr_arg)]
pub(crate) fn numeric_field(
    policy: ParsePolicy,
    labels: &Vec<(String, String)>,
    record: &StreamRecord,
    field: &[u8],
    raw: &[u8],
) -> Result<Option<f64>> {
    if let Ok(value) = parse_f64(raw) {
        return Ok(Some(value));
    }

    let e = Error::Parse(format!(
        "field {:?} of record {} in stream {} is not a number: {:?}",
        String::from_utf8_lossy(field),
        record.id,
        record.stream,
        String::from_utf8_lossy(raw)
    ));
    match policy {
        ParsePolicy::Strict => Err(e),
        ParsePolicy::Lenient => {
            warn!(?e, "Skipping field which is not a number");
            stream_tools_metrics().parse_errors.get_or_create(labels).inc();
            Ok(None)
        }
    }
}
