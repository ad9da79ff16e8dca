//! Cache Key Generation
//!
//! Keys are `type|k1=v1|k2=v2` with parameters sorted by name, so the same
//! logical request always maps to the same key regardless of how the caller
//! assembled its parameters. Composites longer than [`MAX_KEY_LENGTH`] are
//! replaced by `type|hash:<digest>`.

use std::collections::BTreeMap;
use std::fmt;

use super::MAX_KEY_LENGTH;

/// Request parameters for a cached entity
///
/// Backed by an ordered map: insertion order never affects the generated key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheParams {
    pairs: BTreeMap<String, String>,
}

impl CacheParams {
    /// Empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a parameter
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.pairs.insert(name.into(), value.to_string());
        self
    }

    /// Add (or replace) a parameter in place
    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) {
        self.pairs.insert(name.into(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for CacheParams
where
    K: Into<String>,
    V: ToString,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = CacheParams::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for CacheParams
where
    K: Into<String>,
    V: ToString,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// Cache key - entity type plus canonical parameter composite
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    entity_type: String,
    key: String,
}

impl CacheKey {
    /// Generate the key for an entity request
    pub fn generate(entity_type: &str, params: &CacheParams) -> Self {
        let mut composite = String::with_capacity(entity_type.len() + 16 * params.pairs.len());
        composite.push_str(entity_type);
        for (name, value) in params.iter() {
            composite.push('|');
            composite.push_str(name);
            composite.push('=');
            composite.push_str(value);
        }

        let key = if composite.len() > MAX_KEY_LENGTH {
            format!("{}|hash:{}", entity_type, digest(composite.as_bytes()))
        } else {
            composite
        };

        Self {
            entity_type: entity_type.to_string(),
            key,
        }
    }

    /// Wrap an already generated key string
    ///
    /// The entity type is recovered from the text before the first `|`.
    pub fn from_raw(key: impl Into<String>) -> Self {
        let key = key.into();
        let entity_type = key.split('|').next().unwrap_or_default().to_string();
        Self { entity_type, key }
    }

    #[inline]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Prefix shared by every key of an entity type that has parameters
    pub fn entity_prefix(entity_type: &str) -> String {
        format!("{}|", entity_type)
    }

    /// True if `key` was generated for `entity_type`
    ///
    /// Covers the bare `type` key produced for an empty parameter set.
    pub fn is_of_type(key: &str, entity_type: &str) -> bool {
        match key.strip_prefix(entity_type) {
            Some(rest) => rest.is_empty() || rest.starts_with('|'),
            None => false,
        }
    }

    /// True if the key was shortened to a digest
    pub fn is_hashed(&self) -> bool {
        self.key[self.entity_type.len()..].starts_with("|hash:")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

/// 128-bit digest from two FxHash passes with distinct seeds
fn digest(bytes: &[u8]) -> String {
    let hi = fx_hash(bytes, 0x517cc1b727220a95);
    let lo = fx_hash(bytes, 0x9e3779b97f4a7c15);
    format!("{:016x}{:016x}", hi, lo)
}

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
fn fx_hash(bytes: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(seed);
    }
    hash
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let params = CacheParams::new().with("code", "000001").with("adjust", "qfq");
        let key = CacheKey::generate("price_history", &params);
        assert_eq!(key.as_str(), "price_history|adjust=qfq|code=000001");
        assert_eq!(key.entity_type(), "price_history");
        assert!(!key.is_hashed());
    }

    #[test]
    fn test_key_is_order_independent() {
        let a = CacheParams::from([("b", "2"), ("a", "1"), ("c", "3")]);
        let b = CacheParams::from([("c", "3"), ("a", "1"), ("b", "2")]);
        assert_eq!(
            CacheKey::generate("quote", &a),
            CacheKey::generate("quote", &b)
        );
    }

    #[test]
    fn test_key_without_params() {
        let key = CacheKey::generate("market_scan", &CacheParams::new());
        assert_eq!(key.as_str(), "market_scan");
        assert!(CacheKey::is_of_type(key.as_str(), "market_scan"));
    }

    #[test]
    fn test_is_of_type() {
        assert!(CacheKey::is_of_type("quote|code=1", "quote"));
        assert!(CacheKey::is_of_type("quote", "quote"));
        assert!(!CacheKey::is_of_type("quotes|code=1", "quote"));
        assert!(!CacheKey::is_of_type("quot", "quote"));
        assert!(!CacheKey::is_of_type("basic_info|code=1", "quote"));
    }

    #[test]
    fn test_long_key_is_hashed() {
        let codes: Vec<String> = (0..60).map(|i| format!("{:06}", i)).collect();
        let params = CacheParams::new().with("codes", codes.join(","));
        let key = CacheKey::generate("batch_quote", &params);

        assert!(key.is_hashed());
        assert!(key.as_str().starts_with("batch_quote|hash:"));
        assert_eq!(key.as_str().len(), "batch_quote|hash:".len() + 32);
        assert!(key.as_str().starts_with(&CacheKey::entity_prefix("batch_quote")));

        // Deterministic
        let again = CacheKey::generate("batch_quote", &params);
        assert_eq!(key, again);
    }

    #[test]
    fn test_distinct_long_keys_differ() {
        let long_a = "x".repeat(250);
        let long_b = format!("{}y", "x".repeat(249));
        let a = CacheKey::generate("t", &CacheParams::new().with("p", long_a));
        let b = CacheKey::generate("t", &CacheParams::new().with("p", long_b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_raw_recovers_entity_type() {
        let key = CacheKey::from_raw("quote|code=000001");
        assert_eq!(key.entity_type(), "quote");
        assert_eq!(key.to_string(), "quote|code=000001");
    }
}
