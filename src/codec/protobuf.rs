//! Binary payload in the Kura protobuf schema
//!
//! | message  | fields |
//! |----------|--------|
//! | payload  | `timestamp=1` (int64 ms), `position=2`, `metric=5000` (repeated), `body=5001` |
//! | metric   | `name=1`, `type=2`, then one of `double=3 float=4 long=5 int=6 bool=7 string=8 bytes=9` |
//! | position | `latitude=1 longitude=2 altitude=3 precision=4 heading=5 speed=6` (double), `timestamp=7` (int64 ms), `satellites=8 status=9` (int32) |

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;

use super::{CodecError, PayloadCodec};
use crate::protocol::{MetricValue, Payload, Position};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
enum ValueType {
    Double = 0,
    Float = 1,
    Int64 = 2,
    Int32 = 3,
    Bool = 4,
    String = 5,
    Bytes = 6,
}

impl ValueType {
    fn of(value: &MetricValue) -> Self {
        match value {
            MetricValue::Double(_) => ValueType::Double,
            MetricValue::Float(_) => ValueType::Float,
            MetricValue::Long(_) => ValueType::Int64,
            MetricValue::Int(_) => ValueType::Int32,
            MetricValue::Bool(_) => ValueType::Bool,
            MetricValue::String(_) => ValueType::String,
            MetricValue::Bytes(_) => ValueType::Bytes,
        }
    }
}

#[derive(Clone, PartialEq, Message)]
struct KuraPayload {
    #[prost(int64, optional, tag = "1")]
    timestamp: Option<i64>,
    #[prost(message, optional, tag = "2")]
    position: Option<KuraPosition>,
    #[prost(message, repeated, tag = "5000")]
    metric: Vec<KuraMetric>,
    #[prost(bytes = "vec", optional, tag = "5001")]
    body: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
struct KuraMetric {
    #[prost(string, required, tag = "1")]
    name: String,
    #[prost(enumeration = "ValueType", required, tag = "2")]
    r#type: i32,
    #[prost(double, optional, tag = "3")]
    double_value: Option<f64>,
    #[prost(float, optional, tag = "4")]
    float_value: Option<f32>,
    #[prost(int64, optional, tag = "5")]
    long_value: Option<i64>,
    #[prost(int32, optional, tag = "6")]
    int_value: Option<i32>,
    #[prost(bool, optional, tag = "7")]
    bool_value: Option<bool>,
    #[prost(string, optional, tag = "8")]
    string_value: Option<String>,
    #[prost(bytes = "vec", optional, tag = "9")]
    bytes_value: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
struct KuraPosition {
    #[prost(double, required, tag = "1")]
    latitude: f64,
    #[prost(double, required, tag = "2")]
    longitude: f64,
    #[prost(double, optional, tag = "3")]
    altitude: Option<f64>,
    #[prost(double, optional, tag = "4")]
    precision: Option<f64>,
    #[prost(double, optional, tag = "5")]
    heading: Option<f64>,
    #[prost(double, optional, tag = "6")]
    speed: Option<f64>,
    #[prost(int64, optional, tag = "7")]
    timestamp: Option<i64>,
    #[prost(int32, optional, tag = "8")]
    satellites: Option<i32>,
    #[prost(int32, optional, tag = "9")]
    status: Option<i32>,
}

/// Binary codec for the Kura protobuf payload schema
#[derive(Debug, Default, Clone, Copy)]
pub struct KuraProtobufCodec;

impl PayloadCodec for KuraProtobufCodec {
    fn name(&self) -> &'static str {
        "kura-protobuf"
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes, CodecError> {
        let message = KuraPayload {
            timestamp: payload.timestamp.map(|t| t.timestamp_millis()),
            position: payload.position.as_ref().map(KuraPosition::from),
            metric: payload
                .metrics
                .iter()
                .map(|(name, value)| KuraMetric::new(name, value))
                .collect(),
            body: payload.body.clone(),
        };
        Ok(Bytes::from(message.encode_to_vec()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError> {
        let message = KuraPayload::decode(bytes)?;

        let mut payload = Payload::new();
        payload.timestamp = message.timestamp.map(millis_to_datetime).transpose()?;
        payload.position = message.position.map(Position::try_from).transpose()?;
        for metric in message.metric {
            let (name, value) = metric.into_value()?;
            payload.metrics.insert(name, value);
        }
        payload.body = message.body;
        Ok(payload)
    }
}

impl KuraMetric {
    fn new(name: &str, value: &MetricValue) -> Self {
        let mut metric = KuraMetric {
            name: name.to_string(),
            r#type: ValueType::of(value) as i32,
            ..Default::default()
        };
        match value {
            MetricValue::Double(v) => metric.double_value = Some(*v),
            MetricValue::Float(v) => metric.float_value = Some(*v),
            MetricValue::Long(v) => metric.long_value = Some(*v),
            MetricValue::Int(v) => metric.int_value = Some(*v),
            MetricValue::Bool(v) => metric.bool_value = Some(*v),
            MetricValue::String(v) => metric.string_value = Some(v.clone()),
            MetricValue::Bytes(v) => metric.bytes_value = Some(v.clone()),
        }
        metric
    }

    /// The value carried in the slot the declared type selects
    fn into_value(self) -> Result<(String, MetricValue), CodecError> {
        let name = self.name;
        let declared = ValueType::try_from(self.r#type).map_err(|_| {
            CodecError::Malformed(format!("metric '{name}' has unknown type {}", self.r#type))
        })?;

        let value = match declared {
            ValueType::Double => self.double_value.map(MetricValue::Double),
            ValueType::Float => self.float_value.map(MetricValue::Float),
            ValueType::Int64 => self.long_value.map(MetricValue::Long),
            ValueType::Int32 => self.int_value.map(MetricValue::Int),
            ValueType::Bool => self.bool_value.map(MetricValue::Bool),
            ValueType::String => self.string_value.map(MetricValue::String),
            ValueType::Bytes => self.bytes_value.map(MetricValue::Bytes),
        };

        match value {
            Some(value) => Ok((name, value)),
            None => Err(CodecError::Malformed(format!(
                "metric '{name}' declares {declared:?} but carries no such value"
            ))),
        }
    }
}

impl From<&Position> for KuraPosition {
    fn from(position: &Position) -> Self {
        KuraPosition {
            // latitude and longitude are required by the schema
            latitude: position.latitude.unwrap_or_default(),
            longitude: position.longitude.unwrap_or_default(),
            altitude: position.altitude,
            precision: position.precision,
            heading: position.heading,
            speed: position.speed,
            timestamp: position.timestamp.map(|t| t.timestamp_millis()),
            satellites: position.satellites,
            status: position.status,
        }
    }
}

impl TryFrom<KuraPosition> for Position {
    type Error = CodecError;

    fn try_from(position: KuraPosition) -> Result<Self, Self::Error> {
        Ok(Position {
            latitude: Some(position.latitude),
            longitude: Some(position.longitude),
            altitude: position.altitude,
            precision: position.precision,
            heading: position.heading,
            speed: position.speed,
            timestamp: position.timestamp.map(millis_to_datetime).transpose()?,
            satellites: position.satellites,
            status: position.status,
        })
    }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, CodecError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| CodecError::Malformed(format!("timestamp {millis} out of range")))
}
