//! Payload codecs
//!
//! Outbound payloads are encoded with the codec selected by
//! [`PayloadEncoding`](crate::config::PayloadEncoding), optionally wrapped in gzip.
//! Inbound decoding never fails: anything that cannot be decoded is handed on as
//! the raw body of an otherwise empty payload.

mod gzip;
mod json;
mod protobuf;

pub use gzip::{is_gzip, GzipCodec};
pub use json::SimpleJsonCodec;
pub use protobuf::KuraProtobufCodec;

use crate::config::{ConnectionOptions, PayloadEncoding};
use crate::protocol::Payload;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

/// Payload encoding and decoding errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("gzip {operation} failed: {source}")]
    Gzip {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Protobuf payload error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("Malformed binary payload: {0}")]
    Malformed(String),
    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Converts a [`Payload`] to and from its wire representation
pub trait PayloadCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    /// Returns an error if the payload cannot be represented
    fn encode(&self, payload: &Payload) -> Result<Bytes, CodecError>;

    /// # Errors
    /// Returns an error if the bytes are not a valid payload
    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError>;
}

fn codec_for(encoding: PayloadEncoding) -> &'static dyn PayloadCodec {
    match encoding {
        PayloadEncoding::KuraProtobuf => &KuraProtobufCodec,
        PayloadEncoding::SimpleJson => &SimpleJsonCodec,
    }
}

/// Encode an outbound payload per the connection options
pub fn encode_payload(options: &ConnectionOptions, payload: &Payload) -> Result<Bytes, CodecError> {
    let encoded = codec_for(options.payload_encoding).encode(payload)?;
    if options.encode_gzip && options.payload_encoding == PayloadEncoding::KuraProtobuf {
        return GzipCodec::new().compress(&encoded);
    }
    Ok(encoded)
}

/// Decode an inbound payload; falls back to a raw-body payload on any failure
pub fn decode_payload(options: &ConnectionOptions, bytes: &[u8]) -> Payload {
    let codec = codec_for(options.payload_encoding);

    let inflated;
    let input = if is_gzip(bytes) {
        match GzipCodec::new().decompress(bytes) {
            Ok(data) => {
                inflated = data;
                &inflated[..]
            }
            Err(e) => {
                debug!(error = %e, "Inbound payload has gzip magic but does not inflate");
                bytes
            }
        }
    } else {
        bytes
    };

    match codec.decode(input) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(
                codec = codec.name(),
                error = %e,
                len = bytes.len(),
                "Could not decode inbound payload, passing raw bytes as body"
            );
            Payload::from_body(bytes.to_vec())
        }
    }
}
