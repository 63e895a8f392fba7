//! Consensus aggregator
//!
//! Computes a weighted-median consensus price per feed from recent
//! per-exchange updates:
//! - Two-pass validation: strict, then a lenient fallback when strict
//!   retains nothing
//! - Per-update weight: source base weight x tier multiplier x exponential
//!   time decay x update confidence
//! - IQR outlier trim for larger input sets
//! - Consensus and confidence scoring
//! - A short-TTL result cache keyed by a fingerprint of the input set

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::AggregatorConfig;
use crate::constants::{self, LENIENT_MIN_CONFIDENCE, STRICT_MIN_CONFIDENCE};
use crate::error::{FeedError, FeedResult};
use crate::models::{AggregatedPrice, FeedId, PriceUpdate};

/// Chance that an insert triggers an expired-entry sweep of the result cache
const EVICTION_SWEEP_PROBABILITY: f64 = 0.1;

/// Runtime weighting record for one source
#[derive(Debug, Clone)]
pub struct SourceStats {
    /// Relative base weight from the baseline table
    pub base_weight: f64,
    /// Reliability tier
    pub tier: u8,
    /// Tier weight multiplier
    pub tier_multiplier: f64,
    /// Observed reliability in [0.5, 1.0], maintained by the weight sweep
    pub reliability: f64,
    /// Last sweep touch, ms epoch
    pub last_updated_ms: i64,
    accepted: u64,
    rejected: u64,
}

impl SourceStats {
    fn for_source(source: &str, now_ms: i64) -> Self {
        let baseline = constants::source_weight(source);
        Self {
            base_weight: baseline.base_weight,
            tier: baseline.tier,
            tier_multiplier: baseline.tier_multiplier,
            reliability: 1.0,
            last_updated_ms: now_ms,
            accepted: 0,
            rejected: 0,
        }
    }
}

struct CachedResult {
    price: AggregatedPrice,
    stored_at_ms: i64,
}

/// Aggregation counters for health reporting
#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    /// Successful aggregations
    pub success_count: u64,
    /// Failed aggregations
    pub error_count: u64,
    /// Result cache hits
    pub cache_hits: u64,
    /// Result cache misses
    pub cache_misses: u64,
}

/// Weighted-median consensus engine
pub struct ConsensusAggregator {
    config: AggregatorConfig,
    source_stats: RwLock<HashMap<String, SourceStats>>,
    result_cache: Mutex<LruCache<u64, CachedResult>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
}

impl ConsensusAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let capacity = NonZeroUsize::new(config.result_cache_capacity.max(1))
            .expect("result cache capacity is non-zero");
        Self {
            config,
            source_stats: RwLock::new(HashMap::new()),
            result_cache: Mutex::new(LruCache::new(capacity)),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    /// Structural and staleness validation applied at ingest
    pub fn validate_update(&self, update: &PriceUpdate, now_ms: i64) -> bool {
        update.is_well_formed() && update.age_ms(now_ms) <= self.config.max_staleness_ms
    }

    /// Compute the consensus price for one feed
    pub fn aggregate(
        &self,
        feed: &FeedId,
        updates: &[PriceUpdate],
        now_ms: i64,
    ) -> FeedResult<AggregatedPrice> {
        if updates.is_empty() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return Err(FeedError::NoUpdates(feed.to_string()));
        }

        let fingerprint = fingerprint(updates);
        if let Some(cached) = self.cache_lookup(fingerprint, now_ms) {
            return Ok(cached);
        }

        let retained = match self.validate(feed, updates, now_ms) {
            Ok(retained) => retained,
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let retained = trim_outliers(retained);

        let weighted: Vec<(f64, f64, f64)> = {
            let mut stats = self.source_stats.write();
            retained
                .iter()
                .map(|u| {
                    let entry = stats
                        .entry(u.source.clone())
                        .or_insert_with(|| SourceStats::for_source(&u.source, now_ms));
                    entry.accepted += 1;
                    let age = u.age_ms(now_ms).max(0) as f64;
                    let time_weight = (-self.config.decay_lambda * age).exp();
                    let weight =
                        entry.base_weight * entry.tier_multiplier * time_weight * u.confidence;
                    (u.price, weight, u.confidence)
                })
                .collect()
        };

        let sources: Vec<String> = retained
            .iter()
            .map(|u| u.source.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let median = weighted_median(&weighted);
        let (consensus_score, confidence) = self.score(&weighted, median, sources.len());

        let result = AggregatedPrice {
            symbol: feed.name.clone(),
            price: median,
            timestamp_ms: now_ms,
            sources,
            confidence,
            consensus_score,
        };

        self.cache_insert(fingerprint, result.clone(), now_ms);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Two-pass validation
    ///
    /// Strict keeps updates within the staleness bound and confidence floor.
    /// The lenient fallback (doubled staleness cap, lower floor) engages
    /// only when strict retains nothing, and then still demands the source
    /// quorum: second-class data does not get to speak alone.
    fn validate<'a>(
        &self,
        feed: &FeedId,
        updates: &'a [PriceUpdate],
        now_ms: i64,
    ) -> FeedResult<Vec<&'a PriceUpdate>> {
        let strict: Vec<&PriceUpdate> = updates
            .iter()
            .filter(|u| {
                u.is_well_formed()
                    && u.confidence >= STRICT_MIN_CONFIDENCE
                    && u.age_ms(now_ms) <= self.config.max_staleness_ms
            })
            .collect();

        if !strict.is_empty() {
            if strict.len() < self.config.min_sources {
                tracing::warn!(
                    feed = %feed,
                    retained = strict.len(),
                    required = self.config.min_sources,
                    "Consensus below source quorum"
                );
            }
            self.record_rejections(updates, &strict, now_ms);
            return Ok(strict);
        }

        let lenient: Vec<&PriceUpdate> = updates
            .iter()
            .filter(|u| {
                u.is_well_formed()
                    && u.confidence >= LENIENT_MIN_CONFIDENCE
                    && u.age_ms(now_ms) <= 2 * self.config.max_staleness_ms
            })
            .collect();

        if lenient.is_empty() {
            return Err(FeedError::NoValidData(feed.to_string()));
        }
        if lenient.len() < self.config.min_sources {
            tracing::warn!(
                feed = %feed,
                available = lenient.len(),
                required = self.config.min_sources,
                "Insufficient sources after lenient validation"
            );
            return Err(FeedError::InsufficientSources {
                feed: feed.to_string(),
                available: lenient.len(),
                required: self.config.min_sources,
            });
        }

        tracing::info!(
            feed = %feed,
            retained = lenient.len(),
            "Lenient validation pass engaged"
        );
        self.record_rejections(updates, &lenient, now_ms);
        Ok(lenient)
    }

    fn record_rejections(&self, all: &[PriceUpdate], kept: &[&PriceUpdate], now_ms: i64) {
        if all.len() == kept.len() {
            return;
        }
        let kept_sources: BTreeSet<&str> = kept.iter().map(|u| u.source.as_str()).collect();
        let mut stats = self.source_stats.write();
        for update in all {
            if !kept_sources.contains(update.source.as_str()) {
                stats
                    .entry(update.source.clone())
                    .or_insert_with(|| SourceStats::for_source(&update.source, now_ms))
                    .rejected += 1;
            }
        }
    }

    fn score(&self, weighted: &[(f64, f64, f64)], median: f64, source_count: usize) -> (f64, f64) {
        let total_weight: f64 = weighted.iter().map(|(_, w, _)| w).sum();

        let (consensus_score, weighted_confidence) = if total_weight > 0.0 && median > 0.0 {
            let dispersion: f64 = weighted
                .iter()
                .map(|(p, w, _)| w * (p - median).abs() / median)
                .sum::<f64>()
                / total_weight;
            let score = (1.0 - dispersion / self.config.outlier_threshold).max(0.0);
            let avg_conf = weighted
                .iter()
                .map(|(_, w, c)| w * c)
                .sum::<f64>()
                / total_weight;
            (score, avg_conf)
        } else {
            (0.0, 0.0)
        };

        // Bonus scales with distinct contributing sources, not update rows
        let count_bonus = (0.04 * source_count as f64).min(0.2);
        let confidence =
            (0.7 * weighted_confidence + 0.3 * consensus_score + count_bonus).clamp(0.0, 1.0);
        (consensus_score, confidence)
    }

    fn cache_lookup(&self, fingerprint: u64, now_ms: i64) -> Option<AggregatedPrice> {
        let mut cache = self.result_cache.lock();
        if let Some(cached) = cache.get(&fingerprint) {
            if now_ms - cached.stored_at_ms <= self.config.result_cache_ttl_ms {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Some(cached.price.clone());
            }
            cache.pop(&fingerprint);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn cache_insert(&self, fingerprint: u64, price: AggregatedPrice, now_ms: i64) {
        let mut cache = self.result_cache.lock();
        cache.put(
            fingerprint,
            CachedResult {
                price,
                stored_at_ms: now_ms,
            },
        );

        if rand::random::<f64>() < EVICTION_SWEEP_PROBABILITY {
            let cutoff = now_ms - 2 * self.config.result_cache_ttl_ms;
            let expired: Vec<u64> = cache
                .iter()
                .filter(|(_, v)| v.stored_at_ms < cutoff)
                .map(|(k, _)| *k)
                .collect();
            for key in expired {
                cache.pop(&key);
            }
        }
    }

    /// Weight optimization sweep
    ///
    /// Refreshes per-source reliability from observed accept/reject counts.
    /// Reliability is reporting-only; the consensus weight formula stays
    /// fixed to base x tier x decay x confidence.
    pub fn run_weight_sweep(&self, now_ms: i64) {
        let mut stats = self.source_stats.write();
        for (source, entry) in stats.iter_mut() {
            let attempts = entry.accepted + entry.rejected;
            if attempts > 0 {
                entry.reliability =
                    (0.5 + 0.5 * entry.accepted as f64 / attempts as f64).clamp(0.5, 1.0);
            }
            entry.last_updated_ms = now_ms;
            tracing::debug!(
                source = %source,
                reliability = entry.reliability,
                accepted = entry.accepted,
                rejected = entry.rejected,
                "Weight sweep"
            );
        }
    }

    /// Snapshot of one source's weighting record
    pub fn source_stats(&self, source: &str) -> Option<SourceStats> {
        self.source_stats.read().get(source).cloned()
    }

    /// Aggregation counters
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            success_count: self.success_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// Fingerprint of an input set: 64-bit hash over the sorted
/// (source, price-in-cents, second-bucket) triples
fn fingerprint(updates: &[PriceUpdate]) -> u64 {
    let mut rows: Vec<(String, i64, i64)> = updates
        .iter()
        .map(|u| {
            (
                u.source.clone(),
                (u.price * 100.0).round() as i64,
                u.timestamp_ms.div_euclid(1_000),
            )
        })
        .collect();
    rows.sort();

    let mut hasher = DefaultHasher::new();
    rows.hash(&mut hasher);
    hasher.finish()
}

/// IQR trim, applied only when the set is large enough to estimate spread
fn trim_outliers(updates: Vec<&PriceUpdate>) -> Vec<&PriceUpdate> {
    let n = updates.len();
    if n <= 4 {
        return updates;
    }

    let mut prices: Vec<f64> = updates.iter().map(|u| u.price).collect();
    prices.sort_by(|a, b| a.total_cmp(b));

    let q1 = prices[n / 4];
    let q3 = prices[3 * n / 4];
    let iqr = q3 - q1;
    let low = q1 - 1.5 * iqr;
    let high = q3 + 1.5 * iqr;

    updates
        .into_iter()
        .filter(|u| u.price >= low && u.price <= high)
        .collect()
}

/// Weighted median over (price, weight, confidence) rows
///
/// First price whose cumulative weight crosses half the total wins.
/// Degenerate zero-weight sets fall back to the plain median.
fn weighted_median(rows: &[(f64, f64, f64)]) -> f64 {
    let mut sorted: Vec<(f64, f64)> = rows.iter().map(|(p, w, _)| (*p, *w)).collect();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total: f64 = sorted.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return sorted[sorted.len() / 2].0;
    }

    let half = total / 2.0;
    let mut cumulative = 0.0;
    for (price, weight) in &sorted {
        cumulative += weight;
        if cumulative >= half {
            return *price;
        }
    }
    sorted[sorted.len() - 1].0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_ms;

    fn feed() -> FeedId {
        FeedId::crypto("BTC/USD").unwrap()
    }

    fn update(source: &str, price: f64, confidence: f64, age_ms: i64, now: i64) -> PriceUpdate {
        PriceUpdate {
            symbol: "BTC/USD".to_string(),
            price,
            timestamp_ms: now - age_ms,
            source: source.to_string(),
            confidence,
            volume: None,
        }
    }

    fn aggregator() -> ConsensusAggregator {
        ConsensusAggregator::new(AggregatorConfig::default())
    }

    #[test]
    fn test_happy_path_three_sources() {
        let now = now_ms();
        let agg = aggregator();
        let updates = vec![
            update("binance", 50_000.0, 0.9, 500, now),
            update("coinbase", 50_100.0, 0.85, 500, now),
            update("kraken", 49_950.0, 0.8, 500, now),
        ];

        let result = agg.aggregate(&feed(), &updates, now).unwrap();
        assert!(result.price >= 49_950.0 && result.price <= 50_100.0);
        assert_eq!(
            result.sources,
            vec!["binance".to_string(), "coinbase".to_string(), "kraken".to_string()]
        );
        assert!(result.consensus_score > 0.9);
        assert!(result.confidence > 0.85);
    }

    #[test]
    fn test_tier_advantage() {
        let now = now_ms();
        let agg = aggregator();
        let updates = vec![
            update("binance", 50_000.0, 0.9, 100, now),
            update("bitmart", 50_200.0, 0.9, 100, now),
        ];

        let result = agg.aggregate(&feed(), &updates, now).unwrap();
        assert!((result.price - 50_000.0).abs() < (result.price - 50_200.0).abs());
    }

    #[test]
    fn test_stale_update_rejected() {
        let now = now_ms();
        let agg = aggregator();
        let updates = vec![
            update("binance", 50_000.0, 0.9, 500, now),
            update("coinbase", 60_000.0, 0.9, 3_000, now),
        ];

        let result = agg.aggregate(&feed(), &updates, now).unwrap();
        assert_eq!(result.sources, vec!["binance".to_string()]);
        assert_eq!(result.price, 50_000.0);
    }

    #[test]
    fn test_outlier_trimmed() {
        let now = now_ms();
        let agg = aggregator();
        let updates: Vec<PriceUpdate> = [49_900.0, 49_950.0, 50_000.0, 50_050.0, 50_100.0, 60_000.0]
            .iter()
            .enumerate()
            .map(|(i, p)| update(&format!("source{}", i), *p, 0.9, 100, now))
            .collect();

        let result = agg.aggregate(&feed(), &updates, now).unwrap();
        assert!(result.price >= 49_900.0 && result.price <= 50_100.0);
        assert_eq!(result.sources.len(), 5);
        assert!(!result.sources.contains(&"source5".to_string()));
    }

    #[test]
    fn test_price_bounded_by_retained_inputs() {
        let now = now_ms();
        let agg = aggregator();
        let updates = vec![
            update("binance", 49_800.0, 0.9, 900, now),
            update("coinbase", 50_400.0, 0.7, 300, now),
            update("kraken", 50_050.0, 0.95, 1_200, now),
            update("gemini", 49_990.0, 0.6, 700, now),
        ];

        let result = agg.aggregate(&feed(), &updates, now).unwrap();
        assert!(result.price >= 49_800.0);
        assert!(result.price <= 50_400.0);
    }

    #[test]
    fn test_time_decay_favors_fresh() {
        let config = AggregatorConfig::default();
        let fresh_age = 100.0;
        let stale_age = 1_900.0;
        let fresh_weight = (-config.decay_lambda * fresh_age).exp();
        let stale_weight = (-config.decay_lambda * stale_age).exp();
        assert!(fresh_weight > stale_weight);
    }

    #[test]
    fn test_no_updates_error() {
        let agg = aggregator();
        assert!(matches!(
            agg.aggregate(&feed(), &[], now_ms()),
            Err(FeedError::NoUpdates(_))
        ));
    }

    #[test]
    fn test_no_valid_data_error() {
        let now = now_ms();
        let agg = aggregator();
        // Beyond even the doubled lenient staleness cap
        let updates = vec![update("binance", 50_000.0, 0.9, 10_000, now)];
        assert!(matches!(
            agg.aggregate(&feed(), &updates, now),
            Err(FeedError::NoValidData(_))
        ));
    }

    #[test]
    fn test_lenient_pass_requires_quorum() {
        let now = now_ms();
        let agg = aggregator();
        // Stale enough to fail strict, fresh enough for lenient, but alone
        let updates = vec![update("binance", 50_000.0, 0.9, 3_000, now)];
        assert!(matches!(
            agg.aggregate(&feed(), &updates, now),
            Err(FeedError::InsufficientSources { .. })
        ));

        // With quorum the lenient set aggregates
        let updates = vec![
            update("binance", 50_000.0, 0.9, 3_000, now),
            update("coinbase", 50_050.0, 0.9, 3_100, now),
            update("kraken", 49_990.0, 0.9, 3_200, now),
        ];
        let result = agg.aggregate(&feed(), &updates, now).unwrap();
        assert_eq!(result.sources.len(), 3);
    }

    #[test]
    fn test_low_confidence_rejected_strictly() {
        let now = now_ms();
        let agg = aggregator();
        let updates = vec![
            update("binance", 50_000.0, 0.9, 100, now),
            update("coinbase", 50_100.0, 0.05, 100, now),
        ];
        let result = agg.aggregate(&feed(), &updates, now).unwrap();
        assert_eq!(result.sources, vec!["binance".to_string()]);
    }

    #[test]
    fn test_count_bonus_uses_distinct_sources() {
        let now = now_ms();
        let agg = aggregator();
        // Three rows from a single venue: the count bonus reflects one
        // source, not three rows
        let updates = vec![
            update("binance", 50_000.0, 0.9, 100, now),
            update("binance", 50_000.0, 0.9, 200, now),
            update("binance", 50_000.0, 0.9, 300, now),
        ];

        let result = agg.aggregate(&feed(), &updates, now).unwrap();
        assert_eq!(result.sources, vec!["binance".to_string()]);
        // Identical prices: consensus 1.0, weighted confidence 0.9, so
        // 0.7 * 0.9 + 0.3 + 0.04 * 1
        assert!((result.confidence - 0.97).abs() < 1e-9);
    }

    #[test]
    fn test_result_cache_hit() {
        let now = now_ms();
        let agg = aggregator();
        let updates = vec![
            update("binance", 50_000.0, 0.9, 500, now),
            update("coinbase", 50_100.0, 0.85, 500, now),
            update("kraken", 49_950.0, 0.8, 500, now),
        ];

        let first = agg.aggregate(&feed(), &updates, now).unwrap();
        let second = agg.aggregate(&feed(), &updates, now + 100).unwrap();
        assert_eq!(first, second);
        assert_eq!(agg.stats().cache_hits, 1);

        // Past the TTL the entry no longer serves
        let third = agg.aggregate(&feed(), &updates, now + 700).unwrap();
        assert_eq!(agg.stats().cache_hits, 1);
        assert_eq!(third.timestamp_ms, now + 700);
    }

    #[test]
    fn test_fingerprint_order_independent() {
        let now = 1_700_000_000_000;
        let a = update("binance", 50_000.0, 0.9, 100, now);
        let b = update("coinbase", 50_100.0, 0.9, 100, now);
        assert_eq!(
            fingerprint(&[a.clone(), b.clone()]),
            fingerprint(&[b, a])
        );
    }

    #[test]
    fn test_weighted_median_tie_break() {
        // Equal weights: first crossing of half the total wins
        let rows = vec![(10.0, 1.0, 0.9), (20.0, 1.0, 0.9)];
        assert_eq!(weighted_median(&rows), 10.0);
    }

    #[test]
    fn test_weighted_median_degenerate_weights() {
        let rows = vec![(10.0, 0.0, 0.9), (20.0, 0.0, 0.9), (30.0, 0.0, 0.9)];
        assert_eq!(weighted_median(&rows), 20.0);
    }

    #[test]
    fn test_weight_sweep_updates_reliability() {
        let now = now_ms();
        let agg = aggregator();
        let updates = vec![
            update("binance", 50_000.0, 0.9, 100, now),
            update("coinbase", 60_000.0, 0.9, 5_000, now),
        ];
        agg.aggregate(&feed(), &updates, now).unwrap();
        agg.run_weight_sweep(now + 1);

        let binance = agg.source_stats("binance").unwrap();
        assert_eq!(binance.reliability, 1.0);
        assert_eq!(binance.last_updated_ms, now + 1);

        let coinbase = agg.source_stats("coinbase").unwrap();
        assert!(coinbase.reliability < 1.0);
    }
}
