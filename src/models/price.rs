//! Price update and aggregation result types

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current wall clock as millisecond epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A normalized price observation from one exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Pair name, e.g. `BTC/USD`
    pub symbol: String,
    /// Observed price, positive and finite
    pub price: f64,
    /// Exchange-reported event time, ms epoch
    pub timestamp_ms: i64,
    /// Source exchange id, e.g. `binance`
    pub source: String,
    /// Source-assigned confidence in [0, 1]
    pub confidence: f64,
    /// Traded volume for this observation, if the source reports it
    pub volume: Option<f64>,
}

impl PriceUpdate {
    /// Structural validity: price positive and finite, confidence in range,
    /// volume non-negative when present. Staleness is checked separately
    /// against the caller's bound.
    pub fn is_well_formed(&self) -> bool {
        self.price > 0.0
            && self.price.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
            && self.volume.map_or(true, |v| v >= 0.0 && v.is_finite())
    }

    /// Age of this update at `now_ms`, in milliseconds
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.timestamp_ms
    }
}

/// Consensus output for one feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPrice {
    /// Pair name, e.g. `BTC/USD`
    pub symbol: String,
    /// Weighted-median consensus price
    pub price: f64,
    /// Time of aggregation, ms epoch
    pub timestamp_ms: i64,
    /// Sources that contributed to the consensus, sorted, never empty
    pub sources: Vec<String>,
    /// Derived confidence in [0, 1]
    pub confidence: f64,
    /// Normalized agreement among sources in [0, 1]
    pub consensus_score: f64,
}

/// Health classification of one data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// Connected and delivering fresh updates
    Healthy,
    /// Connected but slow or partially failing
    Degraded,
    /// Disconnected or failing
    Unhealthy,
    /// Reconnected after a failure, pending stability
    Recovered,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Unhealthy => write!(f, "UNHEALTHY"),
            Self::Recovered => write!(f, "RECOVERED"),
        }
    }
}

/// Health snapshot for one data source
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    /// Current status
    pub status: SourceStatus,
    /// Total errors observed
    pub error_count: u64,
    /// Total successful recoveries
    pub recovery_count: u64,
    /// Propagation latency of the last update, ms
    pub last_latency_ms: Option<i64>,
    /// Age of the last update, ms
    pub last_update_age_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(price: f64, confidence: f64) -> PriceUpdate {
        PriceUpdate {
            symbol: "BTC/USD".to_string(),
            price,
            timestamp_ms: now_ms(),
            source: "binance".to_string(),
            confidence,
            volume: None,
        }
    }

    #[test]
    fn test_well_formed_bounds() {
        assert!(update(50_000.0, 0.9).is_well_formed());
        assert!(!update(0.0, 0.9).is_well_formed());
        assert!(!update(-1.0, 0.9).is_well_formed());
        assert!(!update(f64::NAN, 0.9).is_well_formed());
        assert!(!update(f64::INFINITY, 0.9).is_well_formed());
        assert!(!update(50_000.0, 1.1).is_well_formed());
        assert!(!update(50_000.0, -0.1).is_well_formed());
    }

    #[test]
    fn test_negative_volume_rejected() {
        let mut u = update(50_000.0, 0.9);
        u.volume = Some(-5.0);
        assert!(!u.is_well_formed());
        u.volume = Some(12.5);
        assert!(u.is_well_formed());
    }

    #[test]
    fn test_age() {
        let mut u = update(50_000.0, 0.9);
        u.timestamp_ms = 1_000;
        assert_eq!(u.age_ms(3_500), 2_500);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SourceStatus::Healthy.to_string(), "HEALTHY");
        assert_eq!(SourceStatus::Recovered.to_string(), "RECOVERED");
    }
}
