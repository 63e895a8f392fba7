//! Data manager
//!
//! Fan-in hub over the adapter fleet. Owns every adapter, consumes their
//! event streams on per-source routing tasks, gates updates through
//! validation and the source's circuit breaker, tracks health, freshness,
//! and rolling trade-volume windows, and forwards accepted updates to the
//! aggregation service tagged by feed.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::{AdapterEvent, ExchangeAdapter};
use crate::aggregation::AggregationService;
use crate::circuit_breaker::{BreakerState, CircuitRegistry};
use crate::error::{FeedError, FeedResult};
use crate::metrics::MetricsState;
use crate::models::{now_ms, FeedId, PriceUpdate, SourceHealth, SourceStatus};

/// Volume observations older than this are pruned from the windows
const VOLUME_RETENTION_MS: i64 = 24 * 3_600_000;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Hub-level events consumed by the recovery layer and monitors
#[derive(Debug, Clone)]
pub enum DataManagerEvent {
    /// A source's transport came up
    SourceConnected { source: String },
    /// A source's transport went down
    SourceDisconnected { source: String, reason: String },
}

struct HealthState {
    status: SourceStatus,
    error_count: u64,
    recovery_count: u64,
    last_latency_ms: Option<i64>,
    last_update_ms: Option<i64>,
}

struct SourceEntry {
    adapter: Arc<dyn ExchangeAdapter>,
    health: Mutex<HealthState>,
    routing_task: Mutex<Option<JoinHandle<()>>>,
}

type VolumeListener = Arc<dyn Fn(&FeedId, f64) + Send + Sync>;

/// Adapter fleet owner and update router
pub struct DataManager {
    sources: RwLock<HashMap<String, Arc<SourceEntry>>>,
    /// Pair name to declared feed, the routing index
    feeds: RwLock<HashMap<String, FeedId>>,
    feed_last_update: RwLock<HashMap<FeedId, i64>>,
    volumes: RwLock<HashMap<FeedId, HashMap<String, VecDeque<(i64, f64)>>>>,
    aggregation: Arc<AggregationService>,
    breakers: Arc<CircuitRegistry>,
    events: broadcast::Sender<DataManagerEvent>,
    volume_listener: RwLock<Option<VolumeListener>>,
    metrics: Arc<MetricsState>,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl DataManager {
    pub fn new(
        aggregation: Arc<AggregationService>,
        breakers: Arc<CircuitRegistry>,
        metrics: Arc<MetricsState>,
        call_timeout_ms: u64,
        cancel: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sources: RwLock::new(HashMap::new()),
            feeds: RwLock::new(HashMap::new()),
            feed_last_update: RwLock::new(HashMap::new()),
            volumes: RwLock::new(HashMap::new()),
            aggregation,
            breakers,
            events,
            volume_listener: RwLock::new(None),
            metrics,
            call_timeout: Duration::from_millis(call_timeout_ms),
            cancel,
        }
    }

    /// Route observed trade volume to the cache warmer
    pub fn set_volume_listener(&self, listener: VolumeListener) {
        *self.volume_listener.write() = Some(listener);
    }

    /// Hub event stream
    pub fn events(&self) -> broadcast::Receiver<DataManagerEvent> {
        self.events.subscribe()
    }

    /// Register an adapter and start routing its events
    ///
    /// A failed initial connect still registers the source; the disconnect
    /// event hands it to the recovery layer.
    pub async fn add_data_source(self: &Arc<Self>, adapter: Arc<dyn ExchangeAdapter>) -> FeedResult<()> {
        let name = adapter.name().to_string();
        if self.sources.read().contains_key(&name) {
            return Err(FeedError::Config(format!(
                "data source already registered: {}",
                name
            )));
        }

        // Degraded until the first connect lands; a reconnect after a real
        // failure is what counts as a recovery
        let entry = Arc::new(SourceEntry {
            adapter: adapter.clone(),
            health: Mutex::new(HealthState {
                status: SourceStatus::Degraded,
                error_count: 0,
                recovery_count: 0,
                last_latency_ms: None,
                last_update_ms: None,
            }),
            routing_task: Mutex::new(None),
        });
        self.sources.write().insert(name.clone(), entry.clone());

        let task = self.spawn_routing_task(name.clone(), adapter.events());
        *entry.routing_task.lock() = Some(task);

        match self.guarded_connect(&name, &adapter).await {
            Ok(()) => {
                tracing::info!(source = %name, "Data source connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(source = %name, error = %e, "Initial connect failed, deferring to recovery");
                {
                    let mut health = entry.health.lock();
                    health.status = SourceStatus::Unhealthy;
                    health.error_count += 1;
                }
                let _ = self.events.send(DataManagerEvent::SourceDisconnected {
                    source: name,
                    reason: e.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Disconnect and forget a source
    pub async fn remove_data_source(&self, source: &str) -> FeedResult<()> {
        let entry = self
            .sources
            .write()
            .remove(source)
            .ok_or_else(|| FeedError::Config(format!("unknown data source: {}", source)))?;

        if let Some(task) = entry.routing_task.lock().take() {
            task.abort();
        }
        let _ = tokio::time::timeout(self.call_timeout, entry.adapter.disconnect()).await;
        Ok(())
    }

    /// Declare a feed and subscribe every capable connected source to it
    pub async fn subscribe_to_feed(&self, feed: &FeedId) -> FeedResult<()> {
        self.feeds.write().insert(feed.name.clone(), feed.clone());

        let sources: Vec<(String, Arc<SourceEntry>)> = self
            .sources
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        for (name, entry) in sources {
            if !entry
                .adapter
                .capabilities()
                .categories
                .contains(&feed.category)
            {
                continue;
            }
            if !entry.adapter.is_connected() {
                continue;
            }
            if let Err(e) = self
                .guarded_call(&name, entry.adapter.subscribe(&[feed.name.clone()]))
                .await
            {
                tracing::warn!(source = %name, feed = %feed, error = %e, "Feed subscription failed");
            }
        }
        Ok(())
    }

    /// Drop a feed from the routing index and from every source
    pub async fn unsubscribe_from_feed(&self, feed: &FeedId) -> FeedResult<()> {
        self.feeds.write().remove(&feed.name);

        let sources: Vec<(String, Arc<SourceEntry>)> = self
            .sources
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        for (name, entry) in sources {
            if entry.adapter.is_connected() {
                if let Err(e) = self
                    .guarded_call(&name, entry.adapter.unsubscribe(&[feed.name.clone()]))
                    .await
                {
                    tracing::debug!(source = %name, feed = %feed, error = %e, "Unsubscribe failed");
                }
            }
        }
        Ok(())
    }

    /// Reconnect a registered source and re-establish its feed subscriptions
    pub async fn connect_source(&self, source: &str) -> FeedResult<()> {
        let entry = self
            .sources
            .read()
            .get(source)
            .cloned()
            .ok_or_else(|| FeedError::Config(format!("unknown data source: {}", source)))?;

        self.guarded_connect(source, &entry.adapter).await?;

        let feed_names: Vec<String> = {
            let feeds = self.feeds.read();
            feeds
                .values()
                .filter(|feed| {
                    entry
                        .adapter
                        .capabilities()
                        .categories
                        .contains(&feed.category)
                })
                .map(|feed| feed.name.clone())
                .collect()
        };
        if !feed_names.is_empty() {
            self.guarded_call(source, entry.adapter.subscribe(&feed_names))
                .await?;
        }
        Ok(())
    }

    /// Disconnect a source without forgetting it
    pub async fn disconnect_source(&self, source: &str) -> FeedResult<()> {
        let entry = self
            .sources
            .read()
            .get(source)
            .cloned()
            .ok_or_else(|| FeedError::Config(format!("unknown data source: {}", source)))?;
        let _ = tokio::time::timeout(self.call_timeout, entry.adapter.disconnect()).await;
        Ok(())
    }

    /// Force a source into the failover path
    pub fn trigger_source_failover(&self, source: &str, reason: &str) {
        if let Some(entry) = self.sources.read().get(source) {
            let mut health = entry.health.lock();
            health.status = SourceStatus::Unhealthy;
            health.error_count += 1;
        }
        tracing::warn!(source = %source, reason = %reason, "Source failover triggered");
        let _ = self.events.send(DataManagerEvent::SourceDisconnected {
            source: source.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Health snapshot per source
    pub fn connection_health(&self) -> HashMap<String, SourceHealth> {
        let now = now_ms();
        self.sources
            .read()
            .iter()
            .map(|(name, entry)| {
                let health = entry.health.lock();
                (
                    name.clone(),
                    SourceHealth {
                        status: health.status,
                        error_count: health.error_count,
                        recovery_count: health.recovery_count,
                        last_latency_ms: health.last_latency_ms,
                        last_update_age_ms: health.last_update_ms.map(|t| now - t),
                    },
                )
            })
            .collect()
    }

    /// Age of the newest update routed for a feed
    pub fn data_freshness(&self, feed: &FeedId) -> Option<i64> {
        let last = *self.feed_last_update.read().get(feed)?;
        Some(now_ms() - last)
    }

    /// Exchange volume sums within the window for one feed
    pub fn volumes(&self, feed: &FeedId, window_ms: i64) -> HashMap<String, f64> {
        let cutoff = now_ms() - window_ms;
        self.volumes
            .read()
            .get(feed)
            .map(|by_source| {
                by_source
                    .iter()
                    .map(|(source, window)| {
                        let sum: f64 = window
                            .iter()
                            .filter(|(at, _)| *at >= cutoff)
                            .map(|(_, v)| v)
                            .sum();
                        (source.clone(), sum)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Adapter lookup for the recovery layer
    pub fn adapter(&self, source: &str) -> Option<Arc<dyn ExchangeAdapter>> {
        self.sources.read().get(source).map(|e| e.adapter.clone())
    }

    /// Registered source names
    pub fn source_names(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    /// Disconnect every adapter
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<SourceEntry>> = self.sources.read().values().cloned().collect();
        for entry in entries {
            let _ = tokio::time::timeout(self.call_timeout, entry.adapter.disconnect()).await;
            if let Some(task) = entry.routing_task.lock().take() {
                task.abort();
            }
        }
        self.metrics.active_sources.set(0);
    }

    fn spawn_routing_task(
        self: &Arc<Self>,
        source: String,
        mut events: broadcast::Receiver<AdapterEvent>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) => manager.handle_adapter_event(&source, event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Per-source overflow: oldest events were dropped
                            manager.metrics.updates_dropped.inc_by(n);
                            tracing::warn!(source = %source, dropped = n, "Routing lagged, dropped oldest updates");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        })
    }

    fn handle_adapter_event(&self, source: &str, event: AdapterEvent) {
        match event {
            AdapterEvent::PriceUpdate(update) => self.ingest(source, update),
            AdapterEvent::Connected { source } => {
                if let Some(entry) = self.sources.read().get(&source) {
                    let mut health = entry.health.lock();
                    health.status = if health.status == SourceStatus::Unhealthy {
                        health.recovery_count += 1;
                        SourceStatus::Recovered
                    } else {
                        SourceStatus::Healthy
                    };
                }
                self.metrics.active_sources.inc();
                let _ = self
                    .events
                    .send(DataManagerEvent::SourceConnected { source });
            }
            AdapterEvent::Disconnected { source, reason } => {
                if let Some(entry) = self.sources.read().get(&source) {
                    let mut health = entry.health.lock();
                    health.status = SourceStatus::Unhealthy;
                    health.error_count += 1;
                }
                self.metrics.active_sources.dec();
                tracing::warn!(source = %source, reason = %reason, "Source disconnected");
                let _ = self
                    .events
                    .send(DataManagerEvent::SourceDisconnected { source, reason });
            }
            AdapterEvent::SubscriptionDropped {
                source,
                symbol,
                reason,
            } => {
                tracing::warn!(source = %source, symbol = %symbol, reason = %reason, "Subscription dropped by venue");
            }
        }
    }

    /// Validate, gate, account, and route one update
    fn ingest(&self, source: &str, update: PriceUpdate) {
        let now = now_ms();

        if !update.is_well_formed() {
            self.metrics.updates_dropped.inc();
            tracing::debug!(source = %source, symbol = %update.symbol, "Malformed update dropped");
            return;
        }

        if self.breakers.breaker(source).state() == BreakerState::Open {
            self.metrics.updates_dropped.inc();
            tracing::debug!(source = %source, "Update dropped, circuit open");
            return;
        }

        if let Some(entry) = self.sources.read().get(source) {
            let mut health = entry.health.lock();
            health.last_update_ms = Some(now);
            health.last_latency_ms = Some(update.age_ms(now).max(0));
        }

        let feed = match self.feeds.read().get(&update.symbol) {
            Some(feed) => feed.clone(),
            None => {
                self.metrics.updates_dropped.inc();
                tracing::debug!(source = %source, symbol = %update.symbol, "Update for undeclared feed dropped");
                return;
            }
        };

        if let Some(volume) = update.volume {
            self.record_volume(&feed, source, volume, now);
        }

        if self.aggregation.add_price_update(&feed, update, now) {
            self.feed_last_update.write().insert(feed, now);
            self.metrics.updates_received.inc();
        } else {
            self.metrics.updates_dropped.inc();
        }
    }

    fn record_volume(&self, feed: &FeedId, source: &str, volume: f64, now: i64) {
        {
            let mut volumes = self.volumes.write();
            let window = volumes
                .entry(feed.clone())
                .or_default()
                .entry(source.to_string())
                .or_default();
            window.push_back((now, volume));
            let cutoff = now - VOLUME_RETENTION_MS;
            while window.front().is_some_and(|(at, _)| *at < cutoff) {
                window.pop_front();
            }
        }
        if let Some(listener) = self.volume_listener.read().as_ref() {
            listener(feed, volume);
        }
    }

    async fn guarded_connect(&self, source: &str, adapter: &Arc<dyn ExchangeAdapter>) -> FeedResult<()> {
        self.guarded_call(source, adapter.connect()).await
    }

    /// Run one adapter call under the source's circuit and timeout
    async fn guarded_call<F>(&self, source: &str, call: F) -> FeedResult<()>
    where
        F: std::future::Future<Output = FeedResult<()>>,
    {
        let breaker = self.breakers.breaker(source);
        breaker.try_acquire(now_ms())?;

        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::SourceTransient {
                source_name: source.to_string(),
                reason: format!("call timed out after {:?}", self.call_timeout),
            }),
        };

        match &result {
            Ok(()) => breaker.record_success(now_ms()),
            Err(_) => breaker.record_failure(now_ms()),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::aggregator::ConsensusAggregator;
    use crate::config::{AggregationConfig, AggregatorConfig, ResilienceConfig};

    fn build() -> (Arc<DataManager>, Arc<AggregationService>, Arc<CircuitRegistry>) {
        let metrics = Arc::new(MetricsState::new());
        let aggregation = Arc::new(AggregationService::new(
            Arc::new(ConsensusAggregator::new(AggregatorConfig::default())),
            AggregationConfig::default(),
            2_000,
            metrics.clone(),
        ));
        let breakers = Arc::new(CircuitRegistry::new(&ResilienceConfig::default()));
        let manager = Arc::new(DataManager::new(
            aggregation.clone(),
            breakers.clone(),
            metrics,
            1_000,
            CancellationToken::new(),
        ));
        (manager, aggregation, breakers)
    }

    fn update(source: &str, symbol: &str, price: f64) -> PriceUpdate {
        PriceUpdate {
            symbol: symbol.to_string(),
            price,
            timestamp_ms: now_ms(),
            source: source.to_string(),
            confidence: 0.9,
            volume: Some(1.5),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_routes_updates_to_aggregation() {
        let (manager, aggregation, _) = build();
        let feed = FeedId::crypto("BTC/USD").unwrap();
        manager.subscribe_to_feed(&feed).await.unwrap();

        let adapter = Arc::new(MockAdapter::new("binance"));
        manager.add_data_source(adapter.clone()).await.unwrap();

        adapter.push_update(update("binance", "BTC/USD", 50_000.0));
        adapter.push_update(update("coinbase", "BTC/USD", 50_010.0));
        adapter.push_update(update("kraken", "BTC/USD", 49_990.0));
        settle().await;

        let result = aggregation.get_aggregated_price(&feed, now_ms());
        assert!(result.is_some());
        assert_eq!(result.unwrap().sources.len(), 3);
    }

    #[tokio::test]
    async fn test_undeclared_feed_dropped() {
        let (manager, aggregation, _) = build();
        let adapter = Arc::new(MockAdapter::new("binance"));
        manager.add_data_source(adapter.clone()).await.unwrap();

        adapter.push_update(update("binance", "DOGE/USD", 0.1));
        settle().await;

        let feed = FeedId::crypto("DOGE/USD").unwrap();
        assert!(aggregation.get_aggregated_price(&feed, now_ms()).is_none());
    }

    #[tokio::test]
    async fn test_subscribes_connected_sources() {
        let (manager, _, _) = build();
        let adapter = Arc::new(MockAdapter::new("binance"));
        manager.add_data_source(adapter.clone()).await.unwrap();

        let feed = FeedId::crypto("BTC/USD").unwrap();
        manager.subscribe_to_feed(&feed).await.unwrap();
        assert_eq!(adapter.subscribed_symbols(), vec!["BTC/USD".to_string()]);

        manager.unsubscribe_from_feed(&feed).await.unwrap();
        assert!(adapter.subscribed_symbols().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_surfaces_event_and_health() {
        let (manager, _, _) = build();
        let adapter = Arc::new(MockAdapter::new("binance"));
        manager.add_data_source(adapter.clone()).await.unwrap();
        let mut events = manager.events();
        // Drain the initial connect event
        while let Ok(event) = events.try_recv() {
            drop(event);
        }

        adapter.emit_disconnect("socket reset");
        settle().await;

        let health = manager.connection_health();
        assert_eq!(health["binance"].status, SourceStatus::Unhealthy);
        assert_eq!(health["binance"].error_count, 1);

        let event = events.try_recv().unwrap();
        assert!(matches!(event, DataManagerEvent::SourceDisconnected { .. }));
    }

    #[tokio::test]
    async fn test_reconnect_marks_recovered() {
        let (manager, _, _) = build();
        let adapter = Arc::new(MockAdapter::new("binance"));
        manager.add_data_source(adapter.clone()).await.unwrap();

        adapter.emit_disconnect("socket reset");
        settle().await;
        adapter.connect().await.unwrap();
        settle().await;

        let health = manager.connection_health();
        assert_eq!(health["binance"].status, SourceStatus::Recovered);
        assert_eq!(health["binance"].recovery_count, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_drops_updates() {
        let (manager, aggregation, breakers) = build();
        let feed = FeedId::crypto("BTC/USD").unwrap();
        manager.subscribe_to_feed(&feed).await.unwrap();

        let adapter = Arc::new(MockAdapter::new("binance"));
        manager.add_data_source(adapter.clone()).await.unwrap();

        let breaker = breakers.breaker("binance");
        let now = now_ms();
        for i in 0..5 {
            breaker.record_failure(now + i);
        }

        adapter.push_update(update("binance", "BTC/USD", 50_000.0));
        settle().await;

        assert!(aggregation.get_aggregated_price(&feed, now_ms()).is_none());
    }

    #[tokio::test]
    async fn test_volume_windows() {
        let (manager, _, _) = build();
        let feed = FeedId::crypto("BTC/USD").unwrap();
        manager.subscribe_to_feed(&feed).await.unwrap();

        let adapter = Arc::new(MockAdapter::new("binance"));
        manager.add_data_source(adapter.clone()).await.unwrap();

        adapter.push_update(update("binance", "BTC/USD", 50_000.0));
        adapter.push_update(update("binance", "BTC/USD", 50_001.0));
        settle().await;

        let volumes = manager.volumes(&feed, 60_000);
        assert_eq!(volumes["binance"], 3.0);

        let other = FeedId::crypto("ETH/USD").unwrap();
        assert!(manager.volumes(&other, 60_000).is_empty());
    }

    #[tokio::test]
    async fn test_freshness_tracks_latest_update() {
        let (manager, _, _) = build();
        let feed = FeedId::crypto("BTC/USD").unwrap();
        manager.subscribe_to_feed(&feed).await.unwrap();
        assert!(manager.data_freshness(&feed).is_none());

        let adapter = Arc::new(MockAdapter::new("binance"));
        manager.add_data_source(adapter.clone()).await.unwrap();
        adapter.push_update(update("binance", "BTC/USD", 50_000.0));
        settle().await;

        let freshness = manager.data_freshness(&feed).unwrap();
        assert!(freshness >= 0 && freshness < 5_000);
    }

    #[tokio::test]
    async fn test_failed_initial_connect_defers_to_recovery() {
        let (manager, _, _) = build();
        let mut events = manager.events();

        let adapter = Arc::new(MockAdapter::new("binance"));
        adapter.set_fail_connect(true);
        manager.add_data_source(adapter).await.unwrap();

        let event = events.try_recv().unwrap();
        assert!(matches!(event, DataManagerEvent::SourceDisconnected { .. }));
        assert!(manager.source_names().contains(&"binance".to_string()));
    }
}
