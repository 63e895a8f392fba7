//! Fault injection and resilience tests
//!
//! Covers breaker trip/probe behavior at the dispatch boundary, failover
//! to backup sources, and recovery after reconnection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use feed_provider::adapters::MockAdapter;
use feed_provider::circuit_breaker::CircuitRegistry;
use feed_provider::config::{AppConfig, FeedDecl, FeedSources, ResilienceConfig};
use feed_provider::models::{now_ms, FeedCategory, FeedId, PriceUpdate};
use feed_provider::service::FeedIntegrationService;
use feed_provider::{ExchangeAdapter, FeedError, RecoveryEvent};

/// Mock downstream dependency that counts dispatched calls
struct CountingDispatcher {
    calls: AtomicU32,
    failures_remaining: AtomicU32,
}

impl CountingDispatcher {
    fn new(failures: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures_remaining: AtomicU32::new(failures),
        }
    }

    fn call(&self) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures_remaining.load(Ordering::SeqCst) > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            Err("connection refused".to_string())
        } else {
            Ok(())
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[test]
fn circuit_trips_then_admits_single_probe() {
    let config = ResilienceConfig::default();
    let registry = CircuitRegistry::new(&config);
    let breaker = registry.breaker("binance");
    let dispatcher = CountingDispatcher::new(u32::MAX);

    let t0 = 1_000_000;

    // Five consecutive failures within the window trip the circuit
    for i in 0..5 {
        let now = t0 + i;
        breaker.try_acquire(now).unwrap();
        dispatcher.call().unwrap_err();
        breaker.record_failure(now);
    }
    let calls_at_trip = dispatcher.call_count();
    assert_eq!(calls_at_trip, 5);

    // Ten dispatch attempts inside the open timeout all fail fast without
    // touching the dispatcher
    for i in 0..10 {
        let now = t0 + 100 + i;
        assert!(matches!(
            breaker.try_acquire(now),
            Err(FeedError::CircuitOpen(_))
        ));
    }
    assert_eq!(dispatcher.call_count(), calls_at_trip);

    // After the timeout exactly one probe is admitted
    let after_timeout = t0 + 4 + config.open_timeout_ms;
    breaker.try_acquire(after_timeout).unwrap();
    dispatcher.call().unwrap_err();
    assert!(matches!(
        breaker.try_acquire(after_timeout + 1),
        Err(FeedError::CircuitOpen(_))
    ));
    assert_eq!(dispatcher.call_count(), calls_at_trip + 1);
}

#[test]
fn circuit_recloses_after_successful_probes() {
    let config = ResilienceConfig::default();
    let registry = CircuitRegistry::new(&config);
    let breaker = registry.breaker("binance");
    let dispatcher = CountingDispatcher::new(5);

    let t0 = 1_000_000;
    for i in 0..5 {
        breaker.try_acquire(t0 + i).unwrap();
        dispatcher.call().unwrap_err();
        breaker.record_failure(t0 + i);
    }

    // Two successful probes close the circuit again
    let mut now = t0 + 4 + config.open_timeout_ms;
    for _ in 0..config.success_threshold {
        breaker.try_acquire(now).unwrap();
        dispatcher.call().unwrap();
        breaker.record_success(now);
        now += 10;
    }
    assert_eq!(
        breaker.state(),
        feed_provider::BreakerState::Closed
    );
    assert!(breaker.try_acquire(now).is_ok());
}

fn failover_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.feeds.declared = vec![FeedDecl {
        category: FeedCategory::Crypto,
        name: "BTC/USD".to_string(),
    }];
    config.aggregation.batch_tick_ms = 20;
    config.resilience.backoff_base_ms = 50;
    config.resilience.backoff_cap_ms = 200;
    config.resilience.stability_check_interval_ms = 50;
    config.resilience.feed_sources.insert(
        "BTC/USD".to_string(),
        FeedSources {
            primary: vec!["binance".to_string()],
            backup: vec!["rest_backup".to_string()],
        },
    );
    config
}

fn update(source: &str, price: f64) -> PriceUpdate {
    PriceUpdate {
        symbol: "BTC/USD".to_string(),
        price,
        timestamp_ms: now_ms(),
        source: source.to_string(),
        confidence: 0.9,
        volume: None,
    }
}

#[tokio::test]
async fn backup_source_serves_through_primary_outage() {
    let primary = Arc::new(MockAdapter::new("binance"));
    let backup = Arc::new(MockAdapter::new("rest_backup"));

    let service = FeedIntegrationService::start_with_adapters(
        failover_config(),
        vec![
            primary.clone() as Arc<dyn ExchangeAdapter>,
            backup.clone() as Arc<dyn ExchangeAdapter>,
        ],
    )
    .await
    .unwrap();

    // Backup sits idle until needed
    backup.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut events = service.recovery_events();
    primary.set_fail_connect(true);
    primary.emit_disconnect("socket reset");

    let mut failover = None;
    for _ in 0..5 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(event @ RecoveryEvent::FailoverCompleted { .. })) => {
                failover = Some(event);
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    match failover.expect("failover event") {
        RecoveryEvent::FailoverCompleted {
            source,
            success,
            activated_sources,
            ..
        } => {
            assert_eq!(source, "binance");
            assert!(success);
            assert_eq!(activated_sources, vec!["rest_backup".to_string()]);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(backup.is_connected());

    // The activated backup carries the feed alone
    backup.push_update(update("rest_backup", 50_000.0));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let feed = FeedId::crypto("BTC/USD").unwrap();
    let price = service.get_value(&feed).await.unwrap();
    assert_eq!(price.sources, vec!["rest_backup".to_string()]);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn primary_restoration_emits_event() {
    let primary = Arc::new(MockAdapter::new("binance"));
    let backup = Arc::new(MockAdapter::new("rest_backup"));

    let service = FeedIntegrationService::start_with_adapters(
        failover_config(),
        vec![
            primary.clone() as Arc<dyn ExchangeAdapter>,
            backup.clone() as Arc<dyn ExchangeAdapter>,
        ],
    )
    .await
    .unwrap();

    let mut events = service.recovery_events();
    primary.emit_disconnect("socket reset");

    let mut restored = false;
    for _ in 0..3 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(RecoveryEvent::ConnectionRestored { source })) => {
                assert_eq!(source, "binance");
                restored = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert!(restored);
    assert!(primary.is_connected());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn manual_failover_trigger_reaches_recovery() {
    let primary = Arc::new(MockAdapter::new("binance"));
    let backup = Arc::new(MockAdapter::new("rest_backup"));

    let service = FeedIntegrationService::start_with_adapters(
        failover_config(),
        vec![
            primary.clone() as Arc<dyn ExchangeAdapter>,
            backup.clone() as Arc<dyn ExchangeAdapter>,
        ],
    )
    .await
    .unwrap();
    backup.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut events = service.recovery_events();
    service.trigger_source_failover("binance", "operator request");

    let mut failed_over = false;
    for _ in 0..5 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(RecoveryEvent::FailoverCompleted { source, .. })) => {
                assert_eq!(source, "binance");
                failed_over = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert!(failed_over);

    service.shutdown().await.unwrap();
}
