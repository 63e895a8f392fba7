//! Real-time price cache
//!
//! Feed to latest aggregated price, sharded by feed hash to keep write
//! contention off the read path. Each shard is LRU-bounded and grows
//! toward the configured maximum when its fill ratio crosses the resize
//! threshold. Hit and miss accounting is atomic.

use lru::LruCache;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::CacheConfig;
use crate::models::{AggregatedPrice, FeedId};

/// One cached consensus value
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The aggregated price, including contributing sources and confidence
    pub value: AggregatedPrice,
    /// When the entry was written, ms epoch
    pub stored_at_ms: i64,
}

impl CacheEntry {
    /// Entry age at `now_ms`
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.stored_at_ms
    }

    /// Freshness predicate against an arbitrary bound
    pub fn is_fresh(&self, now_ms: i64, freshness_ms: i64) -> bool {
        self.age_ms(now_ms) <= freshness_ms
    }
}

/// Cache accounting snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    /// Requests served from cache
    pub hits: u64,
    /// Requests that missed or hit a stale entry
    pub misses: u64,
    /// Live entries across all shards
    pub entries: usize,
    /// hits / (hits + misses), 0 when empty
    pub hit_rate: f64,
    /// Rough memory footprint of live entries
    pub estimated_bytes: usize,
}

/// Sharded LRU cache of the latest aggregated price per feed
pub struct RealTimeCache {
    shards: Vec<RwLock<LruCache<FeedId, CacheEntry>>>,
    config: CacheConfig,
    max_per_shard: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RealTimeCache {
    pub fn new(config: CacheConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        let initial_per_shard = (config.initial_entries / shard_count).max(4);
        let max_per_shard = (config.max_entries / shard_count).max(initial_per_shard);

        let shards = (0..shard_count)
            .map(|_| {
                RwLock::new(LruCache::new(
                    NonZeroUsize::new(initial_per_shard).expect("shard capacity is non-zero"),
                ))
            })
            .collect();

        Self {
            shards,
            config,
            max_per_shard,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a feed's entry, counting a hit only when it is fresh enough
    /// to serve. Stale entries are dropped on the way out.
    pub fn get_price(&self, feed: &FeedId, now_ms: i64) -> Option<CacheEntry> {
        let mut shard = self.shard(feed).write();
        match shard.get(feed) {
            Some(entry) if entry.is_fresh(now_ms, self.config.serve_freshness_ms) => {
                let entry = entry.clone();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(_) => {
                shard.pop(feed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write a feed's entry; the aggregator is authoritative, so older
    /// timestamps are not rejected.
    pub fn set_price(&self, feed: &FeedId, value: AggregatedPrice, now_ms: i64) {
        let mut shard = self.shard(feed).write();

        let capacity = shard.cap().get();
        let fill = (shard.len() + 1) as f64 / capacity as f64;
        if fill > self.config.resize_fill_ratio && capacity < self.max_per_shard {
            let grown = (capacity * 2).min(self.max_per_shard);
            shard.resize(NonZeroUsize::new(grown).expect("grown capacity is non-zero"));
            tracing::debug!(capacity = grown, "Cache shard resized");
        }

        shard.put(
            feed.clone(),
            CacheEntry {
                value,
                stored_at_ms: now_ms,
            },
        );
    }

    /// Drop a feed's entry so the next read repopulates from aggregation
    pub fn invalidate_on_price_update(&self, feed: &FeedId) {
        self.shard(feed).write().pop(feed);
    }

    /// Freshness probe that does not touch hit/miss accounting; used by the
    /// warmer to decide whether a warm would be a no-op.
    pub fn is_fresh_for_warm(&self, feed: &FeedId, now_ms: i64) -> bool {
        self.shard(feed)
            .read()
            .peek(feed)
            .is_some_and(|entry| entry.is_fresh(now_ms, self.config.warm_freshness_ms))
    }

    /// Accounting snapshot
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let entries: usize = self.shards.iter().map(|s| s.read().len()).sum();
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        // Entry struct plus the symbol and source strings it owns
        let per_entry = std::mem::size_of::<CacheEntry>() + 96;

        CacheStats {
            hits,
            misses,
            entries,
            hit_rate,
            estimated_bytes: entries * per_entry,
        }
    }

    /// Drop all entries; counters are preserved
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }

    fn shard(&self, feed: &FeedId) -> &RwLock<LruCache<FeedId, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        feed.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }
}
