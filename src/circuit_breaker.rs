//! Per-source circuit breakers
//!
//! Each data source gets a breaker gating outbound calls:
//! - Closed: calls allowed; failures accumulate in a rolling window
//! - Open: calls rejected until the open timeout elapses
//! - HalfOpen: a single probe at a time; enough consecutive successes
//!   close the circuit, any failure reopens it
//!
//! All transitions are published on a broadcast channel for health
//! reporting and alerting.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::ResilienceConfig;
use crate::error::{FeedError, FeedResult};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls allowed
    Closed,
    /// Calls rejected
    Open,
    /// Probing; one call in flight at a time
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// A state transition, published for health and alerting
#[derive(Debug, Clone)]
pub struct BreakerTransition {
    /// Source whose breaker transitioned
    pub source: String,
    /// Previous state
    pub from: BreakerState,
    /// New state
    pub to: BreakerState,
    /// Transition time, ms epoch
    pub at_ms: i64,
}

/// Breaker tuning derived from the resilience config
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Rolling failure window, ms
    pub failure_window_ms: i64,
    /// Time an open circuit rejects calls before allowing a probe, ms
    pub open_timeout_ms: i64,
}

impl From<&ResilienceConfig> for BreakerSettings {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            failure_window_ms: config.failure_window_ms,
            open_timeout_ms: config.open_timeout_ms,
        }
    }
}

/// Breaker internal state
struct BreakerInner {
    state: BreakerState,
    /// Failure timestamps within the rolling window
    failures: VecDeque<i64>,
    opened_at_ms: Option<i64>,
    successes_since_half_open: u32,
    probe_in_flight: bool,
}

/// Status snapshot for health reporting
#[derive(Debug, Clone)]
pub struct BreakerStatus {
    /// Source id
    pub source: String,
    /// Current state
    pub state: BreakerState,
    /// Failures within the current window
    pub recent_failures: usize,
    /// When the circuit opened, ms epoch
    pub opened_at_ms: Option<i64>,
}

/// Circuit breaker for one data source
pub struct SourceBreaker {
    source: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl SourceBreaker {
    fn new(
        source: String,
        settings: BreakerSettings,
        transitions: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        Self {
            source,
            settings,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at_ms: None,
                successes_since_half_open: 0,
                probe_in_flight: false,
            }),
            transitions,
        }
    }

    /// Ask permission to dispatch a call to this source
    ///
    /// Open circuits reject until the open timeout elapses, then admit a
    /// single probe and move to half-open. Half-open admits one probe at
    /// a time.
    pub fn try_acquire(&self, now_ms: i64) -> FeedResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = inner.opened_at_ms.unwrap_or(now_ms);
                if now_ms - opened_at >= self.settings.open_timeout_ms {
                    self.transition(&mut inner, BreakerState::HalfOpen, now_ms);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(FeedError::CircuitOpen(self.source.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(FeedError::CircuitOpen(self.source.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self, now_ms: i64) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures.clear();
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.successes_since_half_open += 1;
                if inner.successes_since_half_open >= self.settings.success_threshold {
                    inner.failures.clear();
                    self.transition(&mut inner, BreakerState::Closed, now_ms);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, now_ms: i64) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures.push_back(now_ms);
                let window_start = now_ms - self.settings.failure_window_ms;
                while inner.failures.front().is_some_and(|&t| t < window_start) {
                    inner.failures.pop_front();
                }
                if inner.failures.len() as u32 >= self.settings.failure_threshold {
                    inner.opened_at_ms = Some(now_ms);
                    self.transition(&mut inner, BreakerState::Open, now_ms);
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.successes_since_half_open = 0;
                inner.opened_at_ms = Some(now_ms);
                self.transition(&mut inner, BreakerState::Open, now_ms);
            }
            BreakerState::Open => {}
        }
    }

    /// Current state
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Status snapshot
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        BreakerStatus {
            source: self.source.clone(),
            state: inner.state,
            recent_failures: inner.failures.len(),
            opened_at_ms: inner.opened_at_ms,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState, now_ms: i64) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        if to == BreakerState::Closed {
            inner.opened_at_ms = None;
            inner.successes_since_half_open = 0;
            inner.probe_in_flight = false;
        }
        if to == BreakerState::HalfOpen {
            inner.successes_since_half_open = 0;
        }

        tracing::info!(
            source = %self.source,
            from = %from,
            to = %to,
            "Circuit breaker transition"
        );

        let _ = self.transitions.send(BreakerTransition {
            source: self.source.clone(),
            from,
            to,
            at_ms: now_ms,
        });
    }
}

/// Registry of per-source breakers sharing settings and a transition channel
pub struct CircuitRegistry {
    settings: BreakerSettings,
    breakers: RwLock<HashMap<String, Arc<SourceBreaker>>>,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl CircuitRegistry {
    /// Create a registry from the resilience config
    pub fn new(config: &ResilienceConfig) -> Self {
        let (transitions, _) = broadcast::channel(256);
        Self {
            settings: BreakerSettings::from(config),
            breakers: RwLock::new(HashMap::new()),
            transitions,
        }
    }

    /// Get or create the breaker for a source
    pub fn breaker(&self, source: &str) -> Arc<SourceBreaker> {
        if let Some(breaker) = self.breakers.read().get(source) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(source.to_string())
            .or_insert_with(|| {
                Arc::new(SourceBreaker::new(
                    source.to_string(),
                    self.settings,
                    self.transitions.clone(),
                ))
            })
            .clone()
    }

    /// Subscribe to breaker transitions
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Number of sources currently open
    pub fn open_count(&self) -> usize {
        self.breakers
            .read()
            .values()
            .filter(|b| b.state() == BreakerState::Open)
            .count()
    }

    /// Status snapshots for all known sources
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        self.breakers.read().values().map(|b| b.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 5,
            success_threshold: 2,
            failure_window_ms: 60_000,
            open_timeout_ms: 30_000,
        }
    }

    fn breaker() -> SourceBreaker {
        let (tx, _) = broadcast::channel(16);
        SourceBreaker::new("binance".to_string(), settings(), tx)
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker();
        for i in 0..4 {
            b.record_failure(1_000 + i);
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.record_failure(1_005);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn test_open_rejects_until_timeout() {
        let b = breaker();
        for i in 0..5 {
            b.record_failure(1_000 + i);
        }
        // Within the timeout every dispatch is rejected
        for offset in [0, 1_000, 29_000] {
            assert!(matches!(
                b.try_acquire(1_005 + offset),
                Err(FeedError::CircuitOpen(_))
            ));
        }
        // After the timeout exactly one probe is admitted
        assert!(b.try_acquire(1_005 + 30_000).is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(matches!(
            b.try_acquire(1_005 + 30_001),
            Err(FeedError::CircuitOpen(_))
        ));
    }

    #[test]
    fn test_half_open_closes_on_successes() {
        let b = breaker();
        for i in 0..5 {
            b.record_failure(1_000 + i);
        }
        assert!(b.try_acquire(40_000).is_ok());
        b.record_success(40_010);
        assert_eq!(b.state(), BreakerState::HalfOpen);

        assert!(b.try_acquire(40_020).is_ok());
        b.record_success(40_030);
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.try_acquire(40_040).is_ok());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker();
        for i in 0..5 {
            b.record_failure(1_000 + i);
        }
        assert!(b.try_acquire(40_000).is_ok());
        b.record_failure(40_010);
        assert_eq!(b.state(), BreakerState::Open);
        // The new open period starts from the probe failure
        assert!(b.try_acquire(40_020).is_err());
        assert!(b.try_acquire(40_010 + 30_000).is_ok());
    }

    #[test]
    fn test_window_prunes_old_failures() {
        let b = breaker();
        for i in 0..4 {
            b.record_failure(1_000 + i);
        }
        // A failure far outside the window does not trip the breaker
        b.record_failure(120_000);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_success_clears_window() {
        let b = breaker();
        for i in 0..4 {
            b.record_failure(1_000 + i);
        }
        b.record_success(1_010);
        for i in 0..4 {
            b.record_failure(2_000 + i);
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_registry_transitions_emitted() {
        let registry = CircuitRegistry::new(&ResilienceConfig::default());
        let mut rx = registry.subscribe();
        let b = registry.breaker("kraken");
        for i in 0..5 {
            b.record_failure(1_000 + i);
        }
        let event = rx.try_recv().unwrap();
        assert_eq!(event.source, "kraken");
        assert_eq!(event.to, BreakerState::Open);
        assert_eq!(registry.open_count(), 1);
    }
}
