use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::CodecError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// True when the bytes start with the gzip magic number
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= GZIP_MAGIC.len() && bytes[..GZIP_MAGIC.len()] == GZIP_MAGIC
}

pub struct GzipCodec {
    level: Compression,
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl GzipCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level);
        self
    }

    pub fn compress(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(payload)
            .map_err(|source| CodecError::Gzip {
                operation: "encode",
                source,
            })?;
        let compressed = encoder.finish().map_err(|source| CodecError::Gzip {
            operation: "finish",
            source,
        })?;
        Ok(Bytes::from(compressed))
    }

    pub fn decompress(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let mut decoder = GzDecoder::new(payload);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|source| CodecError::Gzip {
                operation: "decode",
                source,
            })?;
        Ok(Bytes::from(decompressed))
    }
}
