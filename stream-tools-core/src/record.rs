//! Records flowing out of the logs and out of the aggregation filters.
//!
//! A [StreamRecord] is one immutable entry of an append-only stream, addressed by a [RecordId]
//! which is strictly increasing within its stream. Field values are kept as raw bytes; it is up
//! to the consumer to coerce them (see [crate::sanitize] and [crate::shared::parse_f64]).

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// Name of a stream. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(Arc<str>);

impl StreamId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for StreamId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(name: &str) -> Self {
        Self(name.into())
    }
}

impl From<String> for StreamId {
    fn from(name: String) -> Self {
        Self(name.into())
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(StreamId::from)
    }
}

/// Identifier of a record within its stream, `<millis>-<seq>` on the wire. Ordered by millis,
/// then by the per-millisecond sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub millis: u64,
    pub seq: u64,
}

impl RecordId {
    /// Sorts before every id a log can hand out, reading from it means "from the beginning".
    pub const ZERO: RecordId = RecordId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// The timestamp component as a wall-clock time.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(i64::try_from(self.millis).ok()?)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    /// Accepts `<millis>-<seq>` and the short form `<millis>` (sequence 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Parse(format!("invalid record id {s:?}"));
        let (millis, seq) = s.split_once('-').unwrap_or((s, "0"));
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Ordered field map of a record. Keys are unique; inserting an existing key replaces its value
/// in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(Vec<(Bytes, Bytes)>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Option<Bytes> {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&Bytes> {
        let key = key.as_ref();
        self.0
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.0.iter().map(|(k, _)| k)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Fields
where
    K: Into<Bytes>,
    V: Into<Bytes>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

impl IntoIterator for Fields {
    type Item = (Bytes, Bytes);
    type IntoIter = std::vec::IntoIter<(Bytes, Bytes)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Keys and values are written as (lossy) UTF-8 text.
impl Serialize for Fields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(&String::from_utf8_lossy(k), &String::from_utf8_lossy(v))?;
        }
        map.end()
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamRecord {
    pub stream: StreamId,
    pub id: RecordId,
    pub fields: Fields,
}

impl StreamRecord {
    pub fn new(stream: impl Into<StreamId>, id: RecordId, fields: Fields) -> Self {
        Self {
            stream: stream.into(),
            id,
            fields,
        }
    }
}

/// Output of an aggregation filter: a derived name, the id of the input record that produced
/// it, and the numeric values in output order.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedRecord {
    pub name: Arc<str>,
    pub id: RecordId,
    pub values: Vec<(Bytes, f64)>,
}

impl DerivedRecord {
    pub fn get(&self, field: impl AsRef<[u8]>) -> Option<f64> {
        let field = field.as_ref();
        self.values
            .iter()
            .find(|(k, _)| k.as_ref() == field)
            .map(|(_, v)| *v)
    }
}

struct NumericValues<'a>(&'a [(Bytes, f64)]);

impl Serialize for NumericValues<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in self.0 {
            map.serialize_entry(&String::from_utf8_lossy(k), v)?;
        }
        map.end()
    }
}

impl Serialize for DerivedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut record = serializer.serialize_struct("DerivedRecord", 3)?;
        record.serialize_field("name", &*self.name)?;
        record.serialize_field("id", &self.id)?;
        record.serialize_field("values", &NumericValues(&self.values))?;
        record.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_parses_both_forms() {
        assert_eq!(
            "1526919030474-55".parse::<RecordId>().unwrap(),
            RecordId::new(1526919030474, 55)
        );
        assert_eq!("42".parse::<RecordId>().unwrap(), RecordId::new(42, 0));
        assert!(matches!("abc-1".parse::<RecordId>(), Err(Error::Parse(_))));
        assert!(matches!("1-".parse::<RecordId>(), Err(Error::Parse(_))));
    }

    #[test]
    fn record_id_orders_numerically() {
        // "9-0" > "10-0" lexicographically but not numerically
        let nine: RecordId = "9-0".parse().unwrap();
        let ten: RecordId = "10-0".parse().unwrap();
        assert!(nine < ten);
        assert!(RecordId::new(10, 1) > ten);
        assert!(RecordId::ZERO < nine);
        assert_eq!(ten.to_string(), "10-0");
    }

    #[test]
    fn record_id_event_time() {
        let id = RecordId::new(1_700_000_000_123, 0);
        assert_eq!(id.event_time().unwrap().timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn fields_keep_insertion_order_and_replace_in_place() {
        let mut fields: Fields = [("b", "1"), ("a", "2")].into_iter().collect();
        assert_eq!(fields.insert("b", "3"), Some(Bytes::from_static(b"3")));
        fields.insert("c", "4");

        let keys: Vec<_> = fields.keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(fields.get("b").unwrap(), "3");
        assert_eq!(fields.len(), 3);
        assert!(fields.get(b"zzz").is_none());
    }

    #[test]
    fn records_serialize_as_text() {
        let record = StreamRecord::new(
            "s1",
            RecordId::new(5, 1),
            [("val", "10")].into_iter().collect(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"stream": "s1", "id": "5-1", "fields": {"val": "10"}})
        );

        let derived = DerivedRecord {
            name: "sum(s1)".into(),
            id: RecordId::new(5, 1),
            values: vec![(Bytes::from_static(b"x"), 11.0)],
        };
        assert_eq!(derived.get("x"), Some(11.0));
        assert_eq!(
            serde_json::to_value(&derived).unwrap(),
            serde_json::json!({"name": "sum(s1)", "id": "5-1", "values": {"x": 11.0}})
        );
    }
}
