//! Tiered Market Data Cache
//!
//! Lookups fall through progressively slower tiers until one of them, or the
//! caller's origin fetch, produces a value:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        TieredCache                         │
//! ├────────────────────────────────────────────────────────────┤
//! │  Memory      bounded table, LRU / LFU / Adaptive eviction  │
//! │     │                                                      │
//! │     ▼                                                      │
//! │  Remote      shared key-value service (Redis)              │
//! │     │                                                      │
//! │     ▼                                                      │
//! │  Persistent  durable keyed store, batch reads and writes   │
//! │     │                                                      │
//! │     ▼                                                      │
//! │  Origin      caller-supplied fetch                         │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! A hit in a slower tier is written back into every faster one. Writes go
//! through all enabled tiers; only the memory write must succeed.
//!
//! The [`MaintenanceScheduler`] sweeps expired entries and keeps the hot-key
//! set that biases eviction.

pub mod compression;
pub mod entry;
pub mod hot;
pub mod key;
pub mod maintenance;
pub mod manager;
pub mod metrics;
pub mod persistent;
pub mod policy;
pub mod remote;
pub mod store;

#[cfg(test)]
mod proptest;

pub use compression::{CompressionAlgorithm, CompressionConfig, Payload, PayloadCodec};
pub use entry::{CacheEntry, CacheTier};
pub use hot::{AccessLog, HotKeySet};
pub use key::{CacheKey, CacheParams};
pub use maintenance::{AnalysisReport, MaintenanceConfig, MaintenanceScheduler, SchedulerStats};
pub use manager::{
    CacheConfig, HitSource, Invalidation, InvalidationOutcome, Lookup, PreloadReport, SetOutcome,
    TierWarning, TieredCache, DEFAULT_TTL,
};
pub use metrics::{CacheMetrics, CacheStats, TierStats};
pub use persistent::{
    InMemoryPersistentStore, PersistentAdapter, PersistentStore, QueryStats, RowFilter, StoredRow,
};
pub use policy::{EvictionPolicy, EvictionStrategy};
pub use remote::{InMemoryRemoteCache, RedisConfig, RedisRemoteCache, RemoteCache};
pub use store::{MemoryConfig, MemoryStore};

/// Composite keys longer than this are hashed
pub const MAX_KEY_LENGTH: usize = 200;

/// Default memory tier capacity (entries)
pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
