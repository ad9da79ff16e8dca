//! Cache Entry Types
//!
//! An entry carries its encoded payload together with the bookkeeping the
//! eviction engine and the TTL checks need. Entries leaving the process are
//! framed into a small binary envelope so that creation time, TTL and the
//! compression flag survive the round trip through remote and persistent
//! tiers.

use std::fmt;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use super::compression::Payload;
use super::key::CacheKey;
use crate::error::{Error, Result};

/// Envelope magic byte
const ENVELOPE_MAGIC: u8 = 0xCE;

/// Envelope header: magic + flags + created_at millis + ttl millis
const ENVELOPE_HEADER_LEN: usize = 1 + 1 + 8 + 8;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Cache tier enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// In-process memory table
    Memory,
    /// Shared remote key-value service
    Remote,
    /// Durable keyed store
    Persistent,
}

impl CacheTier {
    /// Short label used in logs and metric labels
    pub fn label(&self) -> &'static str {
        match self {
            CacheTier::Memory => "memory",
            CacheTier::Remote => "remote",
            CacheTier::Persistent => "persistent",
        }
    }

    pub fn all() -> [CacheTier; 3] {
        [CacheTier::Memory, CacheTier::Remote, CacheTier::Persistent]
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Cached value plus access bookkeeping
#[derive(Clone)]
pub struct CacheEntry {
    key: CacheKey,
    payload: Payload,
    created_at: DateTime<Utc>,
    ttl: Duration,
    access_count: u64,
    last_access_at: DateTime<Utc>,
    tier: CacheTier,
}

impl CacheEntry {
    /// Create a fresh entry
    pub fn new(key: CacheKey, payload: Payload, ttl: Duration, tier: CacheTier) -> Self {
        let now = crate::clock::now_utc();
        Self {
            key,
            payload,
            created_at: now,
            ttl,
            access_count: 1,
            last_access_at: now,
            tier,
        }
    }

    /// Rebuild an entry with an explicit creation time (tier transfers)
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        if self.last_access_at < created_at {
            self.last_access_at = created_at;
        }
        self
    }

    /// Copy of this entry placed in another tier
    pub fn in_tier(&self, tier: CacheTier) -> Self {
        let mut copy = self.clone();
        copy.tier = tier;
        copy
    }

    #[inline]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[inline]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    #[inline]
    pub fn last_access_at(&self) -> DateTime<Utc> {
        self.last_access_at
    }

    #[inline]
    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.payload.compressed
    }

    /// Payload size in bytes
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    /// Age of the entry at `now`
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Expired once its age strictly exceeds the TTL
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.age_at(now) > self.ttl
    }

    /// Valid for a caller asking for data no older than `max_age`
    pub fn is_fresh_for(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        let age = self.age_at(now);
        age <= self.ttl && age <= max_age
    }

    /// Record a read hit
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.touch(now);
    }

    /// Refresh recency without counting an access
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_access_at {
            self.last_access_at = now;
        }
    }

    /// Carry the access count of the entry this one overwrites
    pub fn inherit_access(&mut self, previous: &CacheEntry) {
        self.access_count = self.access_count.max(previous.access_count);
    }

    /// Seconds since the last access, never negative
    pub fn idle_secs_at(&self, now: DateTime<Utc>) -> f64 {
        let idle = (now - self.last_access_at).num_milliseconds().max(0);
        idle as f64 / 1000.0
    }

    // =========================================================================
    // Envelope framing
    // =========================================================================

    /// Frame the entry for a remote or persistent tier
    pub fn to_envelope(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + self.payload.len());
        buf.put_u8(ENVELOPE_MAGIC);
        buf.put_u8(if self.payload.compressed {
            FLAG_COMPRESSED
        } else {
            0
        });
        buf.put_i64(self.created_at.timestamp_millis());
        buf.put_u64(u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX));
        buf.put_slice(&self.payload.bytes);
        buf.freeze()
    }

    /// Parse an envelope read back from `tier`
    pub fn from_envelope(key: CacheKey, mut data: Bytes, tier: CacheTier) -> Result<Self> {
        if data.len() < ENVELOPE_HEADER_LEN {
            return Err(Error::CorruptEnvelope {
                key: key.to_string(),
                reason: format!("{} bytes is shorter than the header", data.len()),
            });
        }
        let magic = data.get_u8();
        if magic != ENVELOPE_MAGIC {
            return Err(Error::CorruptEnvelope {
                key: key.to_string(),
                reason: format!("bad magic byte {:#04x}", magic),
            });
        }
        let flags = data.get_u8();
        let created_millis = data.get_i64();
        let ttl = Duration::from_millis(data.get_u64());
        let created_at = Utc
            .timestamp_millis_opt(created_millis)
            .single()
            .ok_or_else(|| Error::CorruptEnvelope {
                key: key.to_string(),
                reason: format!("invalid timestamp {}", created_millis),
            })?;

        let payload = Payload {
            bytes: data,
            compressed: flags & FLAG_COMPRESSED != 0,
        };

        Ok(CacheEntry::new(key, payload, ttl, tier).with_created_at(created_at))
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key.as_str())
            .field("tier", &self.tier)
            .field("size", &self.size_bytes())
            .field("compressed", &self.payload.compressed)
            .field("access_count", &self.access_count)
            .field("ttl", &self.ttl)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
