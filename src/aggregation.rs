//! Aggregation service
//!
//! Sits between the data manager and the consensus engine. Buffers updates
//! per feed in a latest-wins per-source map, consolidates bursts on a batch
//! tick so each feed aggregates at most once per tick, keeps a short result
//! cache, and notifies subscribers after successful aggregations.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::ConsensusAggregator;
use crate::config::AggregationConfig;
use crate::metrics::MetricsState;
use crate::models::{now_ms, AggregatedPrice, FeedId, PriceUpdate};

const RESULTS_CHANNEL_CAPACITY: usize = 1_024;

type SubscriberCallback = Arc<dyn Fn(Arc<AggregatedPrice>) + Send + Sync>;
type AccessListener = Arc<dyn Fn(&FeedId) + Send + Sync>;

struct FeedState {
    /// Latest update per source; feeding N updates from one source between
    /// aggregations is equivalent to feeding only the last
    latest_by_source: HashMap<String, PriceUpdate>,
    dirty: bool,
    cached: Option<(AggregatedPrice, i64)>,
}

impl FeedState {
    fn new() -> Self {
        Self {
            latest_by_source: HashMap::new(),
            dirty: false,
            cached: None,
        }
    }
}

/// Subscription handle; dropping or cancelling removes the subscriber
/// synchronously.
pub struct SubscriptionHandle {
    feed: FeedId,
    id: u64,
    service: Weak<AggregationService>,
}

impl SubscriptionHandle {
    /// Remove the subscription now
    pub fn cancel(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(service) = self.service.upgrade() {
            service.remove_subscriber(&self.feed, self.id);
        }
    }
}

/// Update buffering, batching, and subscriber fan-out for all feeds
pub struct AggregationService {
    aggregator: Arc<ConsensusAggregator>,
    config: AggregationConfig,
    max_staleness_ms: i64,
    feeds: RwLock<HashMap<FeedId, Arc<Mutex<FeedState>>>>,
    subscribers: RwLock<HashMap<FeedId, Vec<(u64, SubscriberCallback)>>>,
    next_subscriber_id: AtomicU64,
    results: broadcast::Sender<Arc<AggregatedPrice>>,
    access_listener: RwLock<Option<AccessListener>>,
    metrics: Arc<MetricsState>,
}

impl AggregationService {
    pub fn new(
        aggregator: Arc<ConsensusAggregator>,
        config: AggregationConfig,
        max_staleness_ms: i64,
        metrics: Arc<MetricsState>,
    ) -> Self {
        let (results, _) = broadcast::channel(RESULTS_CHANNEL_CAPACITY);
        Self {
            aggregator,
            config,
            max_staleness_ms,
            feeds: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            results,
            access_listener: RwLock::new(None),
            metrics,
        }
    }

    /// Route feed touches to the cache warmer
    pub fn set_access_listener(&self, listener: AccessListener) {
        *self.access_listener.write() = Some(listener);
    }

    /// Buffer one update; returns whether it was accepted
    pub fn add_price_update(&self, feed: &FeedId, update: PriceUpdate, now_ms: i64) -> bool {
        if !self.aggregator.validate_update(&update, now_ms) {
            tracing::debug!(feed = %feed, source = %update.source, "Update rejected by validator");
            return false;
        }

        let state = self.feed_state(feed);
        {
            let mut state = state.lock();
            state.latest_by_source.insert(update.source.clone(), update);
            state.dirty = true;
            state.cached = None;
        }

        if let Some(listener) = self.access_listener.read().as_ref() {
            listener(feed);
        }
        true
    }

    /// Compute or serve the current aggregated price for a feed
    ///
    /// Errors are logged and flattened to `None`; the caller decides how to
    /// degrade.
    pub fn get_aggregated_price(&self, feed: &FeedId, now_ms: i64) -> Option<AggregatedPrice> {
        let state = self.feeds.read().get(feed)?.clone();
        let mut state = state.lock();

        if !state.dirty {
            if let Some((cached, stored_at)) = &state.cached {
                if now_ms - stored_at <= self.config.result_cache_ttl_ms {
                    return Some(cached.clone());
                }
            }
        }

        self.aggregate_locked(feed, &mut state, now_ms)
    }

    /// Subscribe to aggregation results for one feed
    pub fn subscribe(
        self: &Arc<Self>,
        feed: &FeedId,
        callback: SubscriberCallback,
    ) -> SubscriptionHandle {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(feed.clone())
            .or_default()
            .push((id, callback));
        SubscriptionHandle {
            feed: feed.clone(),
            id,
            service: Arc::downgrade(self),
        }
    }

    /// Broadcast stream of every successful aggregation
    pub fn results(&self) -> broadcast::Receiver<Arc<AggregatedPrice>> {
        self.results.subscribe()
    }

    /// Feeds currently holding buffered updates
    pub fn buffered_feed_count(&self) -> usize {
        self.feeds.read().len()
    }

    /// Start the batch tick; one aggregate call per dirty feed per tick
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(service.config.batch_tick_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Aggregation batch loop stopped");
                        return;
                    }
                    _ = tick.tick() => {}
                }
                service.process_batch(now_ms());
            }
        })
    }

    fn process_batch(&self, now_ms: i64) {
        let dirty: Vec<(FeedId, Arc<Mutex<FeedState>>)> = self
            .feeds
            .read()
            .iter()
            .filter(|(_, state)| state.lock().dirty)
            .map(|(feed, state)| (feed.clone(), state.clone()))
            .collect();

        for (feed, state) in dirty {
            let result = {
                let mut state = state.lock();
                self.aggregate_locked(&feed, &mut state, now_ms)
            };
            if let Some(result) = result {
                self.publish(&feed, Arc::new(result));
            }
        }
    }

    fn aggregate_locked(
        &self,
        feed: &FeedId,
        state: &mut FeedState,
        now_ms: i64,
    ) -> Option<AggregatedPrice> {
        let fresh: Vec<PriceUpdate> = state
            .latest_by_source
            .values()
            .filter(|u| u.age_ms(now_ms) <= self.max_staleness_ms)
            .cloned()
            .collect();

        state.dirty = false;

        let started = Instant::now();
        match self.aggregator.aggregate(feed, &fresh, now_ms) {
            Ok(result) => {
                self.metrics
                    .aggregation_latency
                    .observe(started.elapsed().as_secs_f64() * 1_000.0);
                self.metrics.aggregations_total.inc();
                state.cached = Some((result.clone(), now_ms));
                Some(result)
            }
            Err(e) => {
                self.metrics.aggregation_errors.inc();
                tracing::debug!(feed = %feed, error = %e, "Aggregation yielded no result");
                None
            }
        }
    }

    fn publish(&self, feed: &FeedId, result: Arc<AggregatedPrice>) {
        let _ = self.results.send(result.clone());

        let callbacks: Vec<SubscriberCallback> = self
            .subscribers
            .read()
            .get(feed)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        // Each callback runs on its own task; one panicking subscriber
        // cannot block delivery to the rest.
        for callback in callbacks {
            let result = result.clone();
            tokio::spawn(async move {
                callback(result);
            });
        }
    }

    fn feed_state(&self, feed: &FeedId) -> Arc<Mutex<FeedState>> {
        if let Some(state) = self.feeds.read().get(feed) {
            return state.clone();
        }
        self.feeds
            .write()
            .entry(feed.clone())
            .or_insert_with(|| Arc::new(Mutex::new(FeedState::new())))
            .clone()
    }

    fn remove_subscriber(&self, feed: &FeedId, id: u64) {
        let mut subscribers = self.subscribers.write();
        if let Some(subs) = subscribers.get_mut(feed) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                subscribers.remove(feed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ConsensusAggregator;
    use crate::config::AggregatorConfig;

    fn service() -> Arc<AggregationService> {
        Arc::new(AggregationService::new(
            Arc::new(ConsensusAggregator::new(AggregatorConfig::default())),
            AggregationConfig::default(),
            2_000,
            Arc::new(MetricsState::new()),
        ))
    }

    fn feed() -> FeedId {
        FeedId::crypto("BTC/USD").unwrap()
    }

    fn update(source: &str, price: f64, now: i64) -> PriceUpdate {
        PriceUpdate {
            symbol: "BTC/USD".to_string(),
            price,
            timestamp_ms: now,
            source: source.to_string(),
            confidence: 0.9,
            volume: None,
        }
    }

    #[test]
    fn test_latest_wins_per_source() {
        let svc = service();
        let f = feed();
        let now = now_ms();

        // Three prints from one source plus two other venues
        svc.add_price_update(&f, update("binance", 49_000.0, now - 300), now);
        svc.add_price_update(&f, update("binance", 49_500.0, now - 200), now);
        svc.add_price_update(&f, update("binance", 50_000.0, now - 100), now);
        svc.add_price_update(&f, update("coinbase", 50_010.0, now - 100), now);
        svc.add_price_update(&f, update("kraken", 49_990.0, now - 100), now);

        let result = svc.get_aggregated_price(&f, now).unwrap();
        assert_eq!(result.sources.len(), 3);
        // Only binance's last print participates
        assert!(result.price >= 49_990.0 && result.price <= 50_010.0);
    }

    #[test]
    fn test_rejects_malformed_updates() {
        let svc = service();
        let f = feed();
        let now = now_ms();

        let mut bad = update("binance", 50_000.0, now);
        bad.price = -1.0;
        assert!(!svc.add_price_update(&f, bad, now));

        let stale = update("binance", 50_000.0, now - 5_000);
        assert!(!svc.add_price_update(&f, stale, now));
    }

    #[test]
    fn test_result_cache_serves_until_dirty() {
        let svc = service();
        let f = feed();
        let now = now_ms();

        svc.add_price_update(&f, update("binance", 50_000.0, now), now);
        svc.add_price_update(&f, update("coinbase", 50_010.0, now), now);
        svc.add_price_update(&f, update("kraken", 49_990.0, now), now);

        let first = svc.get_aggregated_price(&f, now).unwrap();
        // Clean and within TTL: the cached result is returned verbatim
        let second = svc.get_aggregated_price(&f, now + 200).unwrap();
        assert_eq!(first, second);

        // A new update dirties the buffer and recomputes
        svc.add_price_update(&f, update("binance", 51_000.0, now + 300), now + 300);
        let third = svc.get_aggregated_price(&f, now + 300).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn test_unknown_feed_returns_none() {
        let svc = service();
        assert!(svc.get_aggregated_price(&feed(), now_ms()).is_none());
    }

    #[test]
    fn test_stale_buffer_filtered_at_aggregation() {
        let svc = service();
        let f = feed();
        let now = now_ms();

        svc.add_price_update(&f, update("binance", 50_000.0, now), now);
        // Much later every buffered update is stale; no result
        assert!(svc.get_aggregated_price(&f, now + 60_000).is_none());
    }

    #[tokio::test]
    async fn test_subscriber_notified_on_batch() {
        let svc = service();
        let f = feed();
        let now = now_ms();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let _handle = svc.subscribe(
            &f,
            Arc::new(move |price: Arc<AggregatedPrice>| {
                let _ = tx.send(price.price);
            }),
        );

        svc.add_price_update(&f, update("binance", 50_000.0, now), now);
        svc.add_price_update(&f, update("coinbase", 50_010.0, now), now);
        svc.add_price_update(&f, update("kraken", 49_990.0, now), now);
        svc.process_batch(now);

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(delivered >= 49_990.0 && delivered <= 50_010.0);
    }

    #[tokio::test]
    async fn test_throwing_subscriber_is_isolated() {
        let svc = service();
        let f = feed();
        let now = now_ms();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let _bad = svc.subscribe(
            &f,
            Arc::new(|_: Arc<AggregatedPrice>| panic!("subscriber bug")),
        );
        let _good = svc.subscribe(
            &f,
            Arc::new(move |price: Arc<AggregatedPrice>| {
                let _ = tx.send(price.price);
            }),
        );

        svc.add_price_update(&f, update("binance", 50_000.0, now), now);
        svc.add_price_update(&f, update("coinbase", 50_010.0, now), now);
        svc.add_price_update(&f, update("kraken", 49_990.0, now), now);
        svc.process_batch(now);

        // The healthy subscriber still hears the result
        assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_synchronous() {
        let svc = service();
        let f = feed();
        let now = now_ms();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = svc.subscribe(
            &f,
            Arc::new(move |price: Arc<AggregatedPrice>| {
                let _ = tx.send(price.price);
            }),
        );
        handle.cancel();

        svc.add_price_update(&f, update("binance", 50_000.0, now), now);
        svc.add_price_update(&f, update("coinbase", 50_010.0, now), now);
        svc.add_price_update(&f, update("kraken", 49_990.0, now), now);
        svc.process_batch(now);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batch_loop_respects_cancellation() {
        let svc = service();
        let cancel = CancellationToken::new();
        let handle = svc.spawn(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits on cancel")
            .unwrap();
    }
}
