//! Integration service
//!
//! Wires adapters, data manager, aggregation, cache, warmer, recovery, and
//! breakers into one running system and exposes the in-process API the
//! controller layer consumes: current values, volumes, health, and a
//! price-ready stream.

use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::{build_adapter, ExchangeAdapter};
use crate::aggregation::{AggregationService, SubscriptionHandle};
use crate::aggregator::ConsensusAggregator;
use crate::cache::{CacheStats, RealTimeCache};
use crate::circuit_breaker::CircuitRegistry;
use crate::config::AppConfig;
use crate::data_manager::DataManager;
use crate::error::{FeedError, FeedResult};
use crate::metrics::MetricsState;
use crate::models::{now_ms, AggregatedPrice, FeedId, SourceHealth, SourceStatus};
use crate::recovery::ConnectionRecovery;
use crate::warmer::{CacheWarmer, WarmSource};

const PRICE_READY_CHANNEL_CAPACITY: usize = 1_024;

/// Overall system status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All sources serving
    Healthy,
    /// Some sources failing or circuits open
    Degraded,
    /// No source serving
    Unhealthy,
}

/// Aggregation health counters
#[derive(Debug, Clone, Serialize)]
pub struct AggregationHealth {
    /// Successful aggregations over all attempts
    pub success_rate: f64,
    /// Failed aggregations
    pub error_count: u64,
}

/// Health snapshot returned to the controller layer
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// Overall status rollup
    pub status: HealthStatus,
    /// Per-source breakdown
    pub sources: HashMap<String, SourceHealth>,
    /// Aggregation counters
    pub aggregation: AggregationHealth,
    /// Cache counters
    pub cache: CacheStats,
}

/// Running feed provider
pub struct FeedIntegrationService {
    config: AppConfig,
    metrics: Arc<MetricsState>,
    aggregator: Arc<ConsensusAggregator>,
    aggregation: Arc<AggregationService>,
    cache: Arc<RealTimeCache>,
    warmer: Arc<CacheWarmer>,
    data_manager: Arc<DataManager>,
    recovery: Arc<ConnectionRecovery>,
    breakers: Arc<CircuitRegistry>,
    price_ready: broadcast::Sender<Arc<AggregatedPrice>>,
    /// Declared feeds indexed by pair name, for routing results back to feeds
    declared: HashMap<String, FeedId>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FeedIntegrationService {
    /// Build and start the full system with adapters from the registry
    pub async fn start(config: AppConfig) -> FeedResult<Arc<Self>> {
        let mut adapters: Vec<Arc<dyn ExchangeAdapter>> = Vec::new();
        for name in &config.adapters.enabled {
            adapters.push(build_adapter(name, &config.adapters)?);
        }
        if config.adapters.rest_fallback.enabled
            && !config.adapters.enabled.iter().any(|n| n == "rest_fallback")
        {
            adapters.push(build_adapter("rest_fallback", &config.adapters)?);
        }
        Self::start_with_adapters(config, adapters).await
    }

    /// Build and start with a caller-provided adapter fleet
    pub async fn start_with_adapters(
        config: AppConfig,
        adapters: Vec<Arc<dyn ExchangeAdapter>>,
    ) -> FeedResult<Arc<Self>> {
        if adapters.is_empty() {
            return Err(FeedError::Fatal("no data sources configured".to_string()));
        }

        let declared: Vec<FeedId> = config
            .feeds
            .declared
            .iter()
            .map(|decl| FeedId::new(decl.category, decl.name.clone()))
            .collect::<FeedResult<_>>()?;

        let cancel = CancellationToken::new();
        let metrics = Arc::new(MetricsState::new());
        let aggregator = Arc::new(ConsensusAggregator::new(config.aggregator.clone()));
        let aggregation = Arc::new(AggregationService::new(
            aggregator.clone(),
            config.aggregation.clone(),
            config.aggregator.max_staleness_ms,
            metrics.clone(),
        ));
        let cache = Arc::new(RealTimeCache::new(config.cache.clone()));
        let breakers = Arc::new(CircuitRegistry::new(&config.resilience));
        let data_manager = Arc::new(DataManager::new(
            aggregation.clone(),
            breakers.clone(),
            metrics.clone(),
            config.adapters.call_timeout_ms,
            cancel.clone(),
        ));
        let recovery = Arc::new(ConnectionRecovery::new(
            data_manager.clone(),
            config.resilience.clone(),
        ));

        // The warm path re-enters aggregation, bounded by the warm timeout
        let warm_aggregation = aggregation.clone();
        let warm_source: WarmSource = Arc::new(move |feed: FeedId| {
            let aggregation = warm_aggregation.clone();
            async move { aggregation.get_aggregated_price(&feed, now_ms()) }.boxed()
        });
        let warmer = Arc::new(CacheWarmer::new(
            config.warmer.clone(),
            cache.clone(),
            warm_source,
            metrics.clone(),
        ));

        // Updates count as feed touches for the warming patterns
        let access_warmer = warmer.clone();
        aggregation.set_access_listener(Arc::new(move |feed: &FeedId| {
            access_warmer.track_feed_access(feed, now_ms());
        }));
        let volume_warmer = warmer.clone();
        data_manager.set_volume_listener(Arc::new(move |feed: &FeedId, volume: f64| {
            volume_warmer.note_feed_volume(feed, volume);
        }));

        let (price_ready, _) = broadcast::channel(PRICE_READY_CHANNEL_CAPACITY);

        let service = Arc::new(Self {
            config,
            metrics,
            aggregator,
            aggregation,
            cache,
            warmer,
            data_manager,
            recovery,
            breakers,
            price_ready,
            declared: declared
                .iter()
                .map(|feed| (feed.name.clone(), feed.clone()))
                .collect(),
            cancel,
            tasks: Mutex::new(Vec::new()),
        });

        service.wire_background_tasks();

        for adapter in adapters {
            service.data_manager.add_data_source(adapter).await?;
        }
        for feed in &declared {
            service.data_manager.subscribe_to_feed(feed).await?;
        }

        tracing::info!(
            feeds = declared.len(),
            sources = service.data_manager.source_names().len(),
            "Feed provider initialized"
        );
        Ok(service)
    }

    /// Current consensus value for one feed, cache-first
    pub async fn get_value(&self, feed: &FeedId) -> FeedResult<AggregatedPrice> {
        if self.cancel.is_cancelled() {
            return Err(FeedError::Cancelled);
        }
        let started = Instant::now();
        let now = now_ms();

        self.warmer.track_feed_access(feed, now);

        if let Some(entry) = self.cache.get_price(feed, now) {
            self.metrics.cache_hits.inc();
            self.observe_response(started);
            return Ok(entry.value);
        }
        self.metrics.cache_misses.inc();

        match self.aggregation.get_aggregated_price(feed, now) {
            Some(price) => {
                self.cache.set_price(feed, price.clone(), now);
                self.observe_response(started);
                Ok(price)
            }
            None => {
                self.observe_response(started);
                Err(FeedError::NoValidData(feed.to_string()))
            }
        }
    }

    /// Fan-out over several feeds; partial results allowed
    pub async fn get_values(&self, feeds: &[FeedId]) -> Vec<FeedResult<AggregatedPrice>> {
        join_all(feeds.iter().map(|feed| self.get_value(feed))).await
    }

    /// Per-feed exchange volume sums within the window
    pub fn get_volumes(
        &self,
        feeds: &[FeedId],
        window_ms: i64,
    ) -> Vec<(FeedId, HashMap<String, f64>)> {
        feeds
            .iter()
            .map(|feed| (feed.clone(), self.data_manager.volumes(feed, window_ms)))
            .collect()
    }

    /// Aggregate health rollup
    pub fn get_system_health(&self) -> SystemHealth {
        let sources = self.data_manager.connection_health();
        let open_circuits = self.breakers.open_count();
        self.metrics.open_circuits.set(open_circuits as i64);

        let serving = sources
            .values()
            .filter(|h| matches!(h.status, SourceStatus::Healthy | SourceStatus::Recovered))
            .count();
        let status = if serving == 0 {
            HealthStatus::Unhealthy
        } else if serving < sources.len() || open_circuits > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let stats = self.aggregator.stats();
        let attempts = stats.success_count + stats.error_count;
        let success_rate = if attempts > 0 {
            stats.success_count as f64 / attempts as f64
        } else {
            1.0
        };

        SystemHealth {
            status,
            sources,
            aggregation: AggregationHealth {
                success_rate,
                error_count: stats.error_count,
            },
            cache: self.cache.stats(),
        }
    }

    /// Push delivery of aggregation results for one feed
    pub fn subscribe(
        &self,
        feed: &FeedId,
        callback: Arc<dyn Fn(Arc<AggregatedPrice>) + Send + Sync>,
    ) -> SubscriptionHandle {
        self.aggregation.subscribe(feed, callback)
    }

    /// Every aggregated price the system produces
    pub fn price_ready(&self) -> broadcast::Receiver<Arc<AggregatedPrice>> {
        self.price_ready.subscribe()
    }

    /// Force a source into the failover path
    pub fn trigger_source_failover(&self, source: &str, reason: &str) {
        self.data_manager.trigger_source_failover(source, reason);
    }

    /// Prometheus text exposition of all counters
    pub fn metrics_text(&self) -> String {
        self.metrics.render()
    }

    /// Recovery event stream
    pub fn recovery_events(&self) -> broadcast::Receiver<crate::recovery::RecoveryEvent> {
        self.recovery.events()
    }

    /// Stop loops, disconnect adapters, and drain within the grace period
    pub async fn shutdown(&self) -> FeedResult<()> {
        tracing::info!("Shutting down feed provider");
        self.cancel.cancel();
        self.data_manager.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let grace = Duration::from_millis(self.config.shutdown.grace_ms);
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        match tokio::time::timeout(grace, drain).await {
            Ok(()) => {
                tracing::info!("Shutdown complete");
                Ok(())
            }
            Err(_) => Err(FeedError::Fatal(format!(
                "shutdown grace of {:?} exceeded",
                grace
            ))),
        }
    }

    fn wire_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        tasks.push(self.aggregation.spawn(self.cancel.clone()));
        tasks.extend(self.warmer.run(self.cancel.clone()));
        tasks.push(self.recovery.run(self.cancel.clone()));

        // Every successful aggregation lands in the cache and on the
        // price-ready stream
        {
            let cache = self.cache.clone();
            let price_ready = self.price_ready.clone();
            let declared = self.declared.clone();
            let mut results = self.aggregation.results();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = results.recv() => match result {
                            Ok(price) => {
                                if let Some(feed) = declared.get(&price.symbol) {
                                    cache.set_price(feed, (*price).clone(), now_ms());
                                }
                                let _ = price_ready.send(price);
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }));
        }

        // Periodic weight optimization sweep
        {
            let aggregator = self.aggregator.clone();
            let interval_secs = self.config.aggregator.weight_update_interval_secs;
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tick.tick() => aggregator.run_weight_sweep(now_ms()),
                    }
                }
            }));
        }

        // Breaker transitions feed the gauge and the log
        {
            let breakers = self.breakers.clone();
            let metrics = self.metrics.clone();
            let mut transitions = self.breakers.subscribe();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        transition = transitions.recv() => match transition {
                            Ok(_) => metrics.open_circuits.set(breakers.open_count() as i64),
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }));
        }
    }

    fn observe_response(&self, started: Instant) {
        self.metrics
            .response_latency
            .observe(started.elapsed().as_secs_f64() * 1_000.0);
    }
}
