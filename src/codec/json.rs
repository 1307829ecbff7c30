//! Text payload: `{"sentOn": ms, "position": {..}, "metrics": {..}, "body": "<base64>"}`

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Number, Value};

use super::{CodecError, PayloadCodec};
use crate::protocol::{MetricValue, Payload, Position};

#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleJsonCodec;

impl PayloadCodec for SimpleJsonCodec {
    fn name(&self) -> &'static str {
        "simple-json"
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes, CodecError> {
        let mut root = Map::new();

        if let Some(timestamp) = payload.timestamp {
            root.insert("sentOn".into(), json!(timestamp.timestamp_millis()));
        }
        if let Some(position) = &payload.position {
            root.insert("position".into(), position_to_json(position));
        }
        if !payload.metrics.is_empty() {
            let metrics: Map<String, Value> = payload
                .metrics
                .iter()
                .map(|(name, value)| (name.clone(), metric_to_json(value)))
                .collect();
            root.insert("metrics".into(), Value::Object(metrics));
        }
        if let Some(body) = &payload.body {
            root.insert("body".into(), Value::String(STANDARD.encode(body)));
        }

        Ok(Bytes::from(serde_json::to_vec(&Value::Object(root))?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError> {
        let root: Map<String, Value> = serde_json::from_slice(bytes)?;
        let mut payload = Payload::new();

        if let Some(sent_on) = root.get("sentOn") {
            let millis = sent_on
                .as_i64()
                .ok_or_else(|| CodecError::Malformed("sentOn is not an integer".into()))?;
            payload.timestamp = Utc.timestamp_millis_opt(millis).single();
        }

        if let Some(position) = root.get("position") {
            payload.position = Some(position_from_json(position)?);
        }

        if let Some(metrics) = root.get("metrics") {
            let metrics = metrics
                .as_object()
                .ok_or_else(|| CodecError::Malformed("metrics is not an object".into()))?;
            for (name, value) in metrics {
                payload.metrics.insert(name.clone(), metric_from_json(name, value)?);
            }
        }

        if let Some(body) = root.get("body") {
            let encoded = body
                .as_str()
                .ok_or_else(|| CodecError::Malformed("body is not a string".into()))?;
            let decoded = STANDARD
                .decode(encoded)
                .map_err(|e| CodecError::Malformed(format!("body is not base64: {e}")))?;
            payload.body = Some(decoded);
        }

        Ok(payload)
    }
}

fn metric_to_json(value: &MetricValue) -> Value {
    match value {
        MetricValue::Bool(v) => Value::Bool(*v),
        MetricValue::Long(v) => json!(v),
        MetricValue::Int(v) => json!(v),
        MetricValue::Double(v) => Number::from_f64(*v).map_or(Value::Null, Value::Number),
        MetricValue::Float(v) => Number::from_f64(f64::from(*v)).map_or(Value::Null, Value::Number),
        MetricValue::String(v) => Value::String(v.clone()),
        MetricValue::Bytes(v) => Value::String(STANDARD.encode(v)),
    }
}

fn metric_from_json(name: &str, value: &Value) -> Result<MetricValue, CodecError> {
    match value {
        Value::Bool(v) => Ok(MetricValue::Bool(*v)),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(MetricValue::Long(v))
            } else {
                n.as_f64().map(MetricValue::Double).ok_or_else(|| {
                    CodecError::Malformed(format!("metric '{name}' is out of range"))
                })
            }
        }
        Value::String(v) => Ok(MetricValue::String(v.clone())),
        _ => Err(CodecError::Malformed(format!(
            "metric '{name}' has unsupported JSON type"
        ))),
    }
}

fn position_to_json(position: &Position) -> Value {
    let mut map = Map::new();
    for (key, value) in [
        ("latitude", position.latitude),
        ("longitude", position.longitude),
        ("altitude", position.altitude),
        ("precision", position.precision),
        ("heading", position.heading),
        ("speed", position.speed),
    ] {
        if let Some(number) = value.and_then(Number::from_f64) {
            map.insert(key.into(), Value::Number(number));
        }
    }
    if let Some(timestamp) = position.timestamp {
        map.insert("timestamp".into(), json!(timestamp.timestamp_millis()));
    }
    if let Some(satellites) = position.satellites {
        map.insert("satellites".into(), json!(satellites));
    }
    if let Some(status) = position.status {
        map.insert("status".into(), json!(status));
    }
    Value::Object(map)
}

fn position_from_json(value: &Value) -> Result<Position, CodecError> {
    let map = value
        .as_object()
        .ok_or_else(|| CodecError::Malformed("position is not an object".into()))?;
    let float = |key: &str| map.get(key).and_then(Value::as_f64);
    let int = |key: &str| {
        map.get(key)
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
    };

    Ok(Position {
        latitude: float("latitude"),
        longitude: float("longitude"),
        altitude: float("altitude"),
        precision: float("precision"),
        heading: float("heading"),
        speed: float("speed"),
        timestamp: map
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        satellites: int("satellites"),
        status: int("status"),
    })
}
