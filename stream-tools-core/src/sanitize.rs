//! Conversion of raw record fields into typed values for code downstream of the pipelines.
//!
//! A value is read as an integer if it can be, otherwise as a float, otherwise as text. Integers
//! too wide for an `i64` keep their digits, and `nan` or `inf` spellings stay text, so encoding a
//! sanitized record gives back its wire values. Values that are not valid UTF-8 are kept as raw
//! bytes. A float stored under a `timestamp` (or `TIMESTAMP`) key is taken as seconds and
//! converted to integer milliseconds.

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::record::Fields;
use crate::{Error, Result};

const TIMESTAMP_KEYS: [&[u8]; 2] = [b"timestamp", b"TIMESTAMP"];

/// A field value after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    /// Integer outside the `i64` range, as its decimal digits.
    BigInt(String),
    Float(f64),
    Text(String),
    Raw(Bytes),
}

impl Value {
    fn coerce(key: &[u8], raw: &Bytes) -> Self {
        let Ok(text) = std::str::from_utf8(raw) else {
            return Value::Raw(raw.clone());
        };
        let trimmed = text.trim();
        if let Ok(int) = trimmed.parse::<i64>() {
            return Value::Int(int);
        }
        if is_integer_literal(trimmed) {
            return Value::BigInt(trimmed.to_string());
        }
        match trimmed.parse::<f64>() {
            Ok(float) if !float.is_finite() => Value::Text(text.to_string()),
            Ok(seconds) if TIMESTAMP_KEYS.contains(&key) => {
                Value::Int((seconds * 1000.0).trunc() as i64)
            }
            Ok(float) => Value::Float(float),
            Err(_) => Value::Text(text.to_string()),
        }
    }

    /// Wire form of the value, the inverse of the coercion for integers and text.
    pub fn encode(&self) -> Bytes {
        match self {
            Value::Int(v) => Bytes::from(v.to_string()),
            Value::BigInt(v) => Bytes::from(v.clone()),
            // shortest representation that parses back to the same float
            Value::Float(v) => Bytes::from(format!("{v:?}")),
            Value::Text(v) => Bytes::from(v.clone()),
            Value::Raw(v) => v.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::BigInt(v) => v.parse().ok(),
            Value::Float(v) => Some(*v),
            Value::Text(_) | Value::Raw(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Raw(v) => write!(f, "{v:?}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::BigInt(v) => serializer.serialize_str(v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Text(v) => serializer.serialize_str(v),
            Value::Raw(v) => serializer.serialize_bytes(v),
        }
    }
}

/// An optional sign followed by at least one ASCII digit.
fn is_integer_literal(text: &str) -> bool {
    let digits = text.strip_prefix(['+', '-']).unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn decode_key(key: &Bytes) -> Result<String> {
    String::from_utf8(key.to_vec())
        .map_err(|_| Error::Parse(format!("field name {key:?} is not valid UTF-8")))
}

/// Decodes the field names, leaving the values raw.
pub fn sanitize_keys(fields: &Fields) -> Result<Vec<(String, Bytes)>> {
    fields
        .iter()
        .map(|(k, v)| Ok((decode_key(k)?, v.clone())))
        .collect()
}

/// Coerces the values, leaving the field names raw.
pub fn sanitize_values(fields: &Fields) -> Vec<(Bytes, Value)> {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), Value::coerce(k, v)))
        .collect()
}

/// Decodes the names and coerces the values.
pub fn sanitize_all(fields: &Fields) -> Result<Sanitized> {
    fields
        .iter()
        .map(|(k, v)| Ok((decode_key(k)?, Value::coerce(k, v))))
        .collect::<Result<Vec<_>>>()
        .map(Sanitized)
}

/// Named, typed fields in record order. Serializes as a map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sanitized(Vec<(String, Value)>);

impl Sanitized {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Back to wire fields.
    pub fn encode(&self) -> Fields {
        self.0
            .iter()
            .map(|(k, v)| (Bytes::from(k.clone()), v.encode()))
            .collect()
    }

    pub fn into_inner(self) -> Vec<(String, Value)> {
        self.0
    }
}

impl Serialize for Sanitized {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// A fixed list of named fields a record must provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<String>,
}

impl Schema {
    pub fn new<F: Into<String>>(fields: impl IntoIterator<Item = F>) -> Result<Self> {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(Error::Config("schema without fields".to_string()));
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Maps the sanitized fields onto the schema, in schema order. Fields outside the schema are
    /// dropped; a schema field missing from the record is [Error::KeyAbsent].
    pub fn apply(&self, fields: &Fields) -> Result<SchemaRecord> {
        let mut sanitized = sanitize_all(fields)?.into_inner();
        let mut values = Vec::with_capacity(self.fields.len());
        for name in &self.fields {
            let Some(pos) = sanitized.iter().position(|(k, _)| k == name) else {
                return Err(Error::KeyAbsent(format!(
                    "field {name:?} is missing, record has {:?}",
                    sanitized.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>()
                )));
            };
            values.push(sanitized.swap_remove(pos));
        }
        Ok(SchemaRecord(Sanitized(values)))
    }
}

/// A record shaped by a [Schema].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaRecord(Sanitized);

impl SchemaRecord {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Values in schema order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().map(|(_, v)| v)
    }

    /// Builds any serde type with the schema's field names.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::to_value(&self.0)
            .and_then(serde_json::from_value)
            .map_err(|e| Error::Parse(format!("record does not fit the target type: {e}")))
    }
}
