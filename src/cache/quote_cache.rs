//! Per-symbol TTL cache for provider snapshots

use crate::clock::Clock;
use crate::providers::types::{OptionContract, Quote};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// A cached value with the time it was written
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub updated_at: DateTime<Utc>,
}

/// Thread-safe snapshot cache keyed by upper-case ticker.
///
/// Entries are never evicted; a write replaces the previous value and resets
/// its freshness clock. Reading a stale entry through [`TtlCache::get_stale`]
/// leaves it untouched.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

/// Underlying quote snapshots
pub type QuoteCache = TtlCache<Quote>;

/// Option chains per underlying
pub type ChainCache = TtlCache<Vec<OptionContract>>;

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Value for `symbol` if it was written within the TTL
    pub fn get(&self, symbol: &str) -> Option<V> {
        let now = self.clock.now();
        self.entries
            .get(&Self::key(symbol))
            .filter(|entry| now - entry.updated_at <= self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Last known value for `symbol`, regardless of age
    pub fn get_stale(&self, symbol: &str) -> Option<V> {
        self.entries
            .get(&Self::key(symbol))
            .map(|entry| entry.value.clone())
    }

    /// Age of the cached value, if any
    pub fn age(&self, symbol: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .get(&Self::key(symbol))
            .map(|entry| now - entry.updated_at)
    }

    pub fn set(&self, symbol: &str, value: V) {
        self.entries.insert(
            Self::key(symbol),
            CacheEntry {
                value,
                updated_at: self.clock.now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(symbol: &str) -> String {
        symbol.trim().to_ascii_uppercase()
    }
}
