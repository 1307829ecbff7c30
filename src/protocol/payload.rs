//! Cloud payload model
//!
//! A payload is an ordered map of typed metrics plus an optional raw body,
//! timestamp and position. Both payload encodings map onto this one model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Typed metric value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Long(i64),
    Int(i32),
    Double(f64),
    Float(f32),
    String(String),
    Bytes(Vec<u8>),
}

impl MetricValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetricValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetricValue::Long(v) => Some(*v),
            MetricValue::Int(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetricValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Bool(v) => write!(f, "{v}"),
            MetricValue::Long(v) => write!(f, "{v}"),
            MetricValue::Int(v) => write!(f, "{v}"),
            MetricValue::Double(v) => write!(f, "{v}"),
            MetricValue::Float(v) => write!(f, "{v}"),
            MetricValue::String(v) => f.write_str(v),
            MetricValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Long(v)
    }
}

impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        MetricValue::Int(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Double(v)
    }
}

impl From<f32> for MetricValue {
    fn from(v: f32) -> Self {
        MetricValue::Float(v)
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::String(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::String(v.to_string())
    }
}

impl From<Vec<u8>> for MetricValue {
    fn from(v: Vec<u8>) -> Self {
        MetricValue::Bytes(v)
    }
}

/// Geographic position attached to a payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satellites: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude: Some(latitude),
            longitude: Some(longitude),
            ..Default::default()
        }
    }
}

/// Message payload exchanged with the cloud
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub timestamp: Option<DateTime<Utc>>,
    pub position: Option<Position>,
    pub metrics: BTreeMap<String, MetricValue>,
    pub body: Option<Vec<u8>>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload stamped with the current time
    pub fn now() -> Self {
        Self {
            timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Payload carrying only raw bytes
    pub fn from_body(body: Vec<u8>) -> Self {
        Self {
            body: Some(body),
            ..Default::default()
        }
    }

    pub fn with_metric<V: Into<MetricValue>>(mut self, name: &str, value: V) -> Self {
        self.add_metric(name, value);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn add_metric<V: Into<MetricValue>>(&mut self, name: &str, value: V) {
        self.metrics.insert(name.to_string(), value.into());
    }

    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }

    pub fn string_metric(&self, name: &str) -> Option<&str> {
        self.metric(name).and_then(MetricValue::as_str)
    }

    pub fn remove_metric(&mut self, name: &str) -> Option<MetricValue> {
        self.metrics.remove(name)
    }

    /// True when the payload carries neither metrics nor a body
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.body.as_ref().map_or(true, Vec::is_empty)
    }
}
