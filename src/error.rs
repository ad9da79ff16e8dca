//! Error types for the market data cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache subsystem
///
/// Most of these never reach a `get` caller: the coordinator absorbs tier
/// failures and reports them as misses or warnings.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Tier I/O Errors
    // =========================================================================
    /// A remote or persistent tier could not serve the request
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    /// Redis client error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Payload Errors
    // =========================================================================
    /// Payload could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Stored envelope is malformed
    #[error("Corrupt cache envelope for key {key}: {reason}")]
    CorruptEnvelope { key: String, reason: String },

    // =========================================================================
    // Origin / Calendar Errors
    // =========================================================================
    /// Caller-supplied origin fetch failed
    #[error("Origin fetch failed for {key}: {reason}")]
    OriginFailure { key: String, reason: String },

    /// Official calendar source could not be reached
    #[error("Calendar source unavailable for {year}: {reason}")]
    CalendarSourceUnavailable { year: i32, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a tier failure
    pub fn tier(tier: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Error::TierUnavailable {
            tier: tier.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_error_display() {
        let err = Error::tier("remote", "connection refused");
        assert_eq!(
            err.to_string(),
            "remote tier unavailable: connection refused"
        );
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
