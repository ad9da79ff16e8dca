//! Property-Based Tests for the Cache Tiers
//!
//! # Test Properties
//!
//! 1. **Key order independence**: parameter insertion order never changes a key
//! 2. **Eviction bound**: the memory tier never holds more than `capacity` entries
//! 3. **Hot retention**: hot keys survive while non-hot victims remain
//! 4. **Write-through completeness**: `set` then `get` finds the value in memory

#![cfg(test)]

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use proptest::prelude::*;

use super::entry::{CacheEntry, CacheTier};
use super::hot::HotKeySet;
use super::key::{CacheKey, CacheParams};
use super::manager::{CacheConfig, HitSource, Lookup, TieredCache};
use super::policy::{EvictionPolicy, EvictionStrategy};
use super::store::{MemoryConfig, MemoryStore};
use super::{Payload, MAX_KEY_LENGTH};

// =============================================================================
// Property Strategies
// =============================================================================

/// Distinct parameter names with arbitrary printable values
fn params_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::btree_map("[a-z_]{1,12}", "[ -~]{0,40}", 0..12)
        .prop_map(|m: BTreeMap<String, String>| m.into_iter().collect())
}

fn strategy_strategy() -> impl Strategy<Value = EvictionStrategy> {
    prop_oneof![
        Just(EvictionStrategy::Lru),
        Just(EvictionStrategy::Lfu),
        Just(EvictionStrategy::Adaptive),
    ]
}

fn entry(key: &str) -> CacheEntry {
    CacheEntry::new(
        CacheKey::from_raw(key),
        Payload::raw(bytes::Bytes::from_static(b"1")),
        Duration::from_secs(3600),
        CacheTier::Memory,
    )
}

// =============================================================================
// Key Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: shuffling parameter order yields the identical key
    #[test]
    fn prop_key_order_independent(
        pairs in params_strategy(),
        seed in any::<u64>(),
    ) {
        let forward: CacheParams = pairs.iter().cloned().collect();

        let mut shuffled = pairs.clone();
        let len = shuffled.len().max(1);
        shuffled.rotate_left((seed as usize) % len);
        shuffled.reverse();
        let backward: CacheParams = shuffled.into_iter().collect();

        let a = CacheKey::generate("quote", &forward);
        let b = CacheKey::generate("quote", &backward);
        prop_assert_eq!(a.as_str(), b.as_str());
    }

    /// Property: keys are bounded and keep their entity type prefix
    #[test]
    fn prop_key_bounded_and_prefixed(pairs in params_strategy()) {
        let params: CacheParams = pairs.into_iter().collect();
        let key = CacheKey::generate("price_history", &params);

        prop_assert!(key.as_str().starts_with("price_history|") || params.is_empty());
        if key.is_hashed() {
            prop_assert!(key.as_str().len() < MAX_KEY_LENGTH);
        } else {
            prop_assert!(key.as_str().len() <= MAX_KEY_LENGTH);
        }
        prop_assert_eq!(key.entity_type(), "price_history");
    }
}

// =============================================================================
// Eviction Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: after any sequence of inserts and reads the tier is within capacity
    #[test]
    fn prop_eviction_bound(
        strategy in strategy_strategy(),
        capacity in 1usize..64,
        ops in prop::collection::vec((0u16..200, any::<bool>()), 1..400),
    ) {
        let store = MemoryStore::with_config(MemoryConfig {
            capacity,
            policy: EvictionPolicy::with_strategy(strategy),
        });
        let now = crate::clock::now_utc();

        for (id, read) in ops {
            let key = format!("k|id={}", id);
            if read {
                let _ = store.get(&key, Duration::from_secs(3600), now);
            } else {
                store.insert(entry(&key));
            }
            prop_assert!(store.len() <= capacity);
        }
    }

    /// Property: no hot key is evicted while a non-hot key is resident
    #[test]
    fn prop_hot_keys_retained(
        strategy in strategy_strategy(),
        hot_ids in prop::collection::hash_set(0u16..20, 1..5),
        extra in 20u16..120,
    ) {
        let hot_keys = HotKeySet::new();
        hot_keys.replace(hot_ids.iter().map(|id| format!("k|id={}", id)).collect());

        let capacity = 20;
        let store = MemoryStore::with_hot_keys(
            MemoryConfig {
                capacity,
                policy: EvictionPolicy::with_strategy(strategy),
            },
            hot_keys,
        );

        for id in 0..extra {
            store.insert(entry(&format!("k|id={}", id)));
        }

        let resident: HashSet<String> = store.keys().into_iter().collect();
        for id in &hot_ids {
            let key = format!("k|id={}", id);
            prop_assert!(resident.contains(&key));
        }
    }
}

// =============================================================================
// Coordinator Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: a value written through the coordinator is read back from memory
    #[test]
    fn prop_write_through_completeness(
        pairs in params_strategy(),
        value in prop::collection::vec(any::<i64>(), 0..300),
    ) {
        let cache = TieredCache::new(CacheConfig::default());
        let params: CacheParams = pairs.into_iter().collect();
        let ttl = Duration::from_secs(300);

        let found: Lookup<Vec<i64>> = tokio_test::block_on(async {
            let outcome = cache.set("quote", &params, &value, ttl).await;
            assert!(outcome.is_clean());
            cache.get("quote", &params, ttl).await
        });

        prop_assert_eq!(found.source(), Some(HitSource::Tier(CacheTier::Memory)));
        prop_assert_eq!(found.into_value(), Some(value));
    }
}
