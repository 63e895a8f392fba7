//! Baseline exchange weight table and aggregation tuning constants
//!
//! The weight table is the only process-wide shared table; it is immutable.
//! Per-source reliability on top of these baselines is maintained at runtime
//! by the aggregator's weight sweep.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Maximum accepted update age under strict validation, ms
pub const MAX_STALENESS_MS: i64 = 2_000;
/// Confidence floor under strict validation
pub const STRICT_MIN_CONFIDENCE: f64 = 0.1;
/// Confidence floor under the lenient fallback pass
pub const LENIENT_MIN_CONFIDENCE: f64 = 0.05;
/// Exponential time-decay constant, per ms
pub const TIME_DECAY_LAMBDA: f64 = 5e-5;
/// Normalizer for the consensus dispersion score
pub const OUTLIER_THRESHOLD: f64 = 0.1;
/// Weight multiplier for tier-1 exchanges
pub const TIER1_MULTIPLIER: f64 = 1.2;
/// Weight multiplier for tier-2 exchanges
pub const TIER2_MULTIPLIER: f64 = 1.0;
/// Base weight assigned to sources missing from the table
pub const UNKNOWN_SOURCE_BASE_WEIGHT: f64 = 0.05;

/// Baseline weighting record for one exchange
#[derive(Debug, Clone, Copy)]
pub struct SourceWeight {
    /// Relative base weight
    pub base_weight: f64,
    /// Reliability tier, 1 is highest
    pub tier: u8,
    /// Tier weight multiplier
    pub tier_multiplier: f64,
}

/// Baseline exchange weights
///
/// Tier 1 holds the top venues by observed liquidity and uptime.
pub static EXCHANGE_WEIGHTS: Lazy<HashMap<&'static str, SourceWeight>> = Lazy::new(|| {
    let mut table = HashMap::new();
    let tier1 = |base_weight| SourceWeight {
        base_weight,
        tier: 1,
        tier_multiplier: TIER1_MULTIPLIER,
    };
    let tier2 = |base_weight| SourceWeight {
        base_weight,
        tier: 2,
        tier_multiplier: TIER2_MULTIPLIER,
    };

    table.insert("binance", tier1(0.25));
    table.insert("coinbase", tier1(0.22));
    table.insert("kraken", tier1(0.20));
    table.insert("bitstamp", tier2(0.12));
    table.insert("gemini", tier2(0.10));
    table.insert("okx", tier2(0.10));
    table.insert("bybit", tier2(0.08));
    table.insert("bitmart", tier2(0.06));
    table
});

/// Look up a source's baseline weight, defaulting for unknown venues
pub fn source_weight(source: &str) -> SourceWeight {
    EXCHANGE_WEIGHTS
        .get(source)
        .copied()
        .unwrap_or(SourceWeight {
            base_weight: UNKNOWN_SOURCE_BASE_WEIGHT,
            tier: 2,
            tier_multiplier: TIER2_MULTIPLIER,
        })
}
