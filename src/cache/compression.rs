//! Payload Codec
//!
//! Values are serialized with serde_json. Payloads above a size threshold are
//! run through LZ4, and the compressed form is kept only when it saves at
//! least the configured fraction of space.
//!
//! # Example
//!
//! ```
//! use marketcache::cache::compression::PayloadCodec;
//!
//! let codec = PayloadCodec::new();
//! let payload = codec.encode(&vec![10.5_f64; 4]).unwrap();
//! let back: Vec<f64> = codec.decode(&payload).unwrap();
//! assert_eq!(back, vec![10.5; 4]);
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 - fast compression
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for payload compression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm applied to large payloads
    pub algorithm: CompressionAlgorithm,
    /// Minimum serialized size before compression is attempted
    pub min_size_bytes: usize,
    /// Required space saving (0.2 = compressed must be at least 20% smaller)
    pub min_savings: f64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            min_size_bytes: 1024,
            min_savings: 0.2,
            level: 4,
        }
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Encoded value bytes and the flag needed to decode them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Bytes,
    pub compressed: bool,
}

impl Payload {
    /// Uncompressed payload
    pub fn raw(bytes: Bytes) -> Self {
        Self {
            bytes,
            compressed: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// =============================================================================
// LZ4
// =============================================================================

/// LZ4 block compressor with size-prefixed frames
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Payload Codec
// =============================================================================

/// Serializes values and applies the compression policy
pub struct PayloadCodec {
    config: CompressionConfig,
    lz4: Lz4Compressor,
}

impl PayloadCodec {
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            config,
        }
    }

    /// Serialize a value and compress it when that pays off
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Payload> {
        let raw = serde_json::to_vec(value)?;
        Ok(self.compress(raw))
    }

    /// Apply the compression policy to already serialized bytes
    ///
    /// Compression failures are logged and fall back to the raw form.
    pub fn compress(&self, raw: Vec<u8>) -> Payload {
        if self.config.algorithm == CompressionAlgorithm::None
            || raw.len() <= self.config.min_size_bytes
        {
            return Payload::raw(Bytes::from(raw));
        }

        match self.lz4.compress(&raw) {
            Ok(compressed) if self.worth_keeping(raw.len(), compressed.len()) => Payload {
                bytes: Bytes::from(compressed),
                compressed: true,
            },
            Ok(_) => Payload::raw(Bytes::from(raw)),
            Err(e) => {
                tracing::warn!(error = %e, "Compression failed, storing uncompressed");
                Payload::raw(Bytes::from(raw))
            }
        }
    }

    /// Decompress (if flagged) and deserialize
    pub fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T> {
        if payload.compressed {
            let raw = self.lz4.decompress(&payload.bytes)?;
            Ok(serde_json::from_slice(&raw)?)
        } else {
            Ok(serde_json::from_slice(&payload.bytes)?)
        }
    }

    fn worth_keeping(&self, original: usize, compressed: usize) -> bool {
        (compressed as f64) <= (original as f64) * (1.0 - self.config.min_savings)
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new()
    }
}
