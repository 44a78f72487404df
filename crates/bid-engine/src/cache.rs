//! Bid cache keyed by placement.
//!
//! Lookups enforce the validity rules and evict lazily; there is no
//! background sweep.
//!
//! - TTL == 0: servable exactly once. The lookup that returns it also removes
//!   it (pop semantics).
//! - TTL > 0: servable repeatedly while `now - downloaded_at < ttl`. The first
//!   lookup at or past expiry removes it and reports a miss.
//!
//! The check and the eviction run under the DashMap shard lock for the key,
//! so two concurrent readers can never both pop the same zero-TTL bid.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bid_common::{CdbSlot, CreativePayload, PlacementKey};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tracing::debug;

use crate::clock::Clock;

/// A bid held in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBid {
    /// Impression id the bid was requested under.
    pub impression_id: String,
    /// Creative to render.
    pub payload: CreativePayload,
    /// Price signal. Zero means "no bid".
    pub cpm: Decimal,
    /// Time-to-live in seconds. Zero means single use.
    pub ttl_secs: u64,
    /// Download timestamp (ms since epoch).
    pub downloaded_at_ms: i64,
}

impl CachedBid {
    /// Build a cache entry from a decoded response slot.
    pub fn from_slot(slot: CdbSlot, impression_id: String, downloaded_at_ms: i64) -> Self {
        Self {
            impression_id: slot.imp_id.unwrap_or(impression_id),
            payload: slot.payload,
            cpm: slot.cpm,
            ttl_secs: slot.ttl_secs,
            downloaded_at_ms,
        }
    }

    /// A zero-CPM bid is the backend saying "no bid".
    #[inline]
    pub fn is_no_bid(&self) -> bool {
        self.cpm.is_zero()
    }

    #[inline]
    pub fn is_single_use(&self) -> bool {
        self.ttl_secs == 0
    }

    /// Expiry timestamp for positive-TTL bids.
    pub fn expires_at_ms(&self) -> Option<i64> {
        (self.ttl_secs > 0).then(|| {
            let ttl_ms = i64::try_from(self.ttl_secs)
                .unwrap_or(i64::MAX)
                .saturating_mul(1000);
            self.downloaded_at_ms.saturating_add(ttl_ms)
        })
    }

    /// True once a positive-TTL bid has outlived its TTL.
    #[inline]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms().is_some_and(|expires| now_ms >= expires)
    }
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups that returned a bid.
    pub hits: AtomicU64,
    /// Lookups that found nothing servable.
    pub misses: AtomicU64,
    /// Positive-TTL entries removed on expiry.
    pub expired: AtomicU64,
    /// Zero-TTL entries popped by a lookup.
    pub consumed: AtomicU64,
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub consumed: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
        }
    }
}

/// Process-lifetime bid cache.
pub struct BidCache {
    entries: DashMap<PlacementKey, CachedBid>,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

impl BidCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            stats: CacheStats::default(),
        }
    }

    /// Look up a servable bid, evicting expired or single-use entries.
    pub fn get(&self, key: &PlacementKey) -> Option<CachedBid> {
        let now_ms = self.clock.now_ms();

        let found = match self.entries.entry(key.clone()) {
            Entry::Vacant(_) => None,
            Entry::Occupied(entry) => {
                let bid = entry.get();
                if bid.is_single_use() {
                    self.stats.consumed.fetch_add(1, Ordering::Relaxed);
                    Some(entry.remove())
                } else if bid.is_expired(now_ms) {
                    self.stats.expired.fetch_add(1, Ordering::Relaxed);
                    entry.remove();
                    debug!(placement = %key, "Evicted expired bid");
                    None
                } else {
                    Some(bid.clone())
                }
            }
        };

        match found {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Whether a lookup would return a bid right now. Consumes nothing.
    pub fn is_servable(&self, key: &PlacementKey) -> bool {
        let now_ms = self.clock.now_ms();
        self.entries
            .get(key)
            .is_some_and(|bid| !bid.is_expired(now_ms))
    }

    /// Store a bid, replacing any previous entry for the key.
    pub fn put(&self, key: PlacementKey, bid: CachedBid) {
        self.entries.insert(key, bid);
    }

    /// Remove an entry regardless of validity.
    pub fn remove(&self, key: &PlacementKey) -> Option<CachedBid> {
        self.entries.remove(key).map(|(_, bid)| bid)
    }

    /// Whether an entry is physically present, valid or not.
    pub fn contains(&self, key: &PlacementKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for BidCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BidCache")
            .field("entries", &self.entries.len())
            .field("stats", &self.stats)
            .finish()
    }
}
