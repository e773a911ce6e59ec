//! # Records
//!
//! The store's unit of persistence: a flat map of named fields ("bins")
//! plus the generation the store assigned at the last successful write.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use delivery_domain::Location;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    /// Geo point; the only kind a geo index can key on.
    Geo(Location),
    /// `[epoch_seconds, nanos]`
    Pair([i64; 2]),
}

/// Full field set of one record.
pub type Bins = BTreeMap<String, Value>;

/// A record as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub bins: Bins,
    pub generation: u32,
}

/// Why a field could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("missing")]
    Missing,
    #[error("expected {0}")]
    WrongType(&'static str),
}

impl Record {
    pub const fn new(bins: Bins, generation: u32) -> Self {
        Self { bins, generation }
    }

    pub fn int(&self, name: &str) -> Result<i64, FieldError> {
        match self.bins.get(name) {
            Some(Value::Int(v)) => Ok(*v),
            Some(_) => Err(FieldError::WrongType("int")),
            None => Err(FieldError::Missing),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, FieldError> {
        match self.bins.get(name) {
            Some(Value::Float(v)) => Ok(*v),
            Some(Value::Int(v)) => Ok(*v as f64),
            Some(_) => Err(FieldError::WrongType("float")),
            None => Err(FieldError::Missing),
        }
    }

    pub fn str(&self, name: &str) -> Result<&str, FieldError> {
        match self.bins.get(name) {
            Some(Value::Str(v)) => Ok(v.as_str()),
            Some(_) => Err(FieldError::WrongType("string")),
            None => Err(FieldError::Missing),
        }
    }

    /// Absent booleans read as `false`.
    pub fn bool(&self, name: &str) -> Result<bool, FieldError> {
        match self.bins.get(name) {
            Some(Value::Bool(v)) => Ok(*v),
            Some(_) => Err(FieldError::WrongType("bool")),
            None => Ok(false),
        }
    }

    pub fn geo(&self, name: &str) -> Result<Location, FieldError> {
        self.opt_geo(name)?.ok_or(FieldError::Missing)
    }

    pub fn opt_geo(&self, name: &str) -> Result<Option<Location>, FieldError> {
        match self.bins.get(name) {
            Some(Value::Geo(v)) => Ok(Some(*v)),
            Some(_) => Err(FieldError::WrongType("geo point")),
            None => Ok(None),
        }
    }

    pub fn timestamp(&self, name: &str) -> Result<Option<DateTime<Utc>>, FieldError> {
        match self.bins.get(name) {
            Some(Value::Pair(parts)) => Ok(pair_to_timestamp(*parts)),
            Some(_) => Err(FieldError::WrongType("timestamp pair")),
            None => Ok(None),
        }
    }
}

/// `[epoch_seconds, nanosecond remainder]`
pub fn timestamp_to_pair(ts: DateTime<Utc>) -> [i64; 2] {
    [ts.timestamp(), i64::from(ts.timestamp_subsec_nanos())]
}

pub fn pair_to_timestamp([secs, nanos]: [i64; 2]) -> Option<DateTime<Utc>> {
    let nanos = u32::try_from(nanos).ok()?;
    DateTime::from_timestamp(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_pair_keeps_nanos() {
        let ts = DateTime::from_timestamp(1_460_000_000, 123_456_789).unwrap();
        let pair = timestamp_to_pair(ts);
        assert_eq!(pair, [1_460_000_000, 123_456_789]);
        assert_eq!(pair_to_timestamp(pair), Some(ts));
        assert_eq!(pair_to_timestamp([0, -1]), None);
    }

    #[test]
    fn test_field_access() {
        let mut bins = Bins::new();
        bins.insert("id".into(), Value::Int(4));
        bins.insert("state".into(), Value::Str("Waiting".into()));
        let record = Record::new(bins, 2);

        assert_eq!(record.int("id"), Ok(4));
        assert_eq!(record.str("state"), Ok("Waiting"));
        assert_eq!(record.int("state"), Err(FieldError::WrongType("int")));
        assert_eq!(record.geo("location"), Err(FieldError::Missing));
        assert_eq!(record.bool("candidate"), Ok(false));
        assert_eq!(record.timestamp("pickedUp"), Ok(None));
    }

    #[test]
    fn test_field_error_messages() {
        assert_eq!(FieldError::Missing.to_string(), "missing");
        assert_eq!(FieldError::WrongType("geo point").to_string(), "expected geo point");
    }

    #[test]
    fn test_value_json_shape() {
        let json = serde_json::to_string(&Value::Geo(Location::new(1.5, -2.0))).unwrap();
        assert_eq!(json, r#"{"geo":{"x":1.5,"y":-2.0}}"#);
    }
}
