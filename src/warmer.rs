//! Predictive cache warmer
//!
//! Learns per-feed access patterns and refreshes the real-time cache ahead
//! of predicted reads. Three strategies run on independent schedules with
//! independent worker bounds:
//! - Aggressive: hot feeds, accessed within 5 minutes at least 5 times
//! - Predictive: feeds whose predicted next access is within a minute
//! - Maintenance: anything accessed within the hour; also sweeps patterns
//!   idle past the expiry
//!
//! Warm failures are collected and counted, never fatal to a batch.

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::cache::RealTimeCache;
use crate::config::WarmerConfig;
use crate::metrics::MetricsState;
use crate::models::{now_ms, AggregatedPrice, FeedId};

/// Callback into the aggregation path used to produce a fresh value
pub type WarmSource =
    Arc<dyn Fn(FeedId) -> BoxFuture<'static, Option<AggregatedPrice>> + Send + Sync>;

/// Observed access behavior for one feed
#[derive(Debug, Clone)]
pub struct FeedAccessPattern {
    /// Total recorded accesses
    pub access_count: u64,
    /// Last access, ms epoch
    pub last_accessed_ms: i64,
    /// Rolling average gap between accesses, ms
    pub average_interval_ms: f64,
    /// Predicted next access, ms epoch
    pub predicted_next_access_ms: i64,
    /// Warm attempts that produced a value
    pub warming_success: u64,
    /// Warm attempts that did not
    pub warming_failures: u64,
    /// Composite priority in [0.05, 100]
    pub priority: f64,
    /// Last observed traded volume, used as a priority boost
    pub recent_volume: f64,
}

impl FeedAccessPattern {
    fn first_touch(now_ms: i64) -> Self {
        let mut pattern = Self {
            access_count: 1,
            last_accessed_ms: now_ms,
            average_interval_ms: 0.0,
            predicted_next_access_ms: now_ms,
            warming_success: 0,
            warming_failures: 0,
            priority: 0.0,
            recent_volume: 0.0,
        };
        pattern.priority = priority(&pattern, now_ms);
        pattern
    }
}

/// Warmer accounting snapshot
#[derive(Debug, Clone, Default)]
pub struct WarmerStats {
    /// Feeds with a live access pattern
    pub tracked_patterns: usize,
    /// Total successful warms
    pub warming_success: u64,
    /// Total failed warms
    pub warming_failures: u64,
}

/// Access-pattern driven cache warmer
pub struct CacheWarmer {
    config: WarmerConfig,
    cache: Arc<RealTimeCache>,
    source: WarmSource,
    patterns: RwLock<HashMap<FeedId, FeedAccessPattern>>,
    immediate_tx: mpsc::UnboundedSender<FeedId>,
    immediate_rx: Mutex<Option<mpsc::UnboundedReceiver<FeedId>>>,
    metrics: Arc<MetricsState>,
}

impl CacheWarmer {
    pub fn new(
        config: WarmerConfig,
        cache: Arc<RealTimeCache>,
        source: WarmSource,
        metrics: Arc<MetricsState>,
    ) -> Self {
        let (immediate_tx, immediate_rx) = mpsc::unbounded_channel();
        Self {
            config,
            cache,
            source,
            patterns: RwLock::new(HashMap::new()),
            immediate_tx,
            immediate_rx: Mutex::new(Some(immediate_rx)),
            metrics,
        }
    }

    /// Record one access and update the feed's pattern
    ///
    /// First touches, frequently accessed feeds, and tight access intervals
    /// schedule an immediate warm.
    pub fn track_feed_access(&self, feed: &FeedId, now_ms: i64) {
        let warm_now = {
            let mut patterns = self.patterns.write();
            match patterns.get_mut(feed) {
                Some(pattern) => {
                    let interval = (now_ms - pattern.last_accessed_ms).max(0) as f64;
                    pattern.average_interval_ms =
                        (pattern.average_interval_ms + interval) / 2.0;
                    pattern.access_count += 1;
                    pattern.last_accessed_ms = now_ms;
                    pattern.predicted_next_access_ms =
                        now_ms + pattern.average_interval_ms as i64;
                    pattern.priority = priority(pattern, now_ms);

                    pattern.access_count >= 3
                        || (pattern.average_interval_ms > 0.0
                            && pattern.average_interval_ms < 30_000.0)
                }
                None => {
                    patterns.insert(feed.clone(), FeedAccessPattern::first_touch(now_ms));
                    true
                }
            }
        };

        if warm_now {
            let _ = self.immediate_tx.send(feed.clone());
        }
    }

    /// Feed the volume boost from observed trade volume
    pub fn note_feed_volume(&self, feed: &FeedId, volume: f64) {
        if let Some(pattern) = self.patterns.write().get_mut(feed) {
            pattern.recent_volume = volume;
        }
    }

    /// Warm one feed's cache entry
    ///
    /// No-op when the entry is already fresh by the warm rule; otherwise
    /// pulls a value through the injected source and stores it.
    pub async fn warm_feed_cache(&self, feed: &FeedId) -> bool {
        let now = now_ms();
        if self.cache.is_fresh_for_warm(feed, now) {
            return true;
        }

        let produced = tokio::time::timeout(
            Duration::from_millis(self.config.warm_call_timeout_ms),
            (self.source)(feed.clone()),
        )
        .await
        .ok()
        .flatten();

        let mut patterns = self.patterns.write();
        let pattern = patterns
            .entry(feed.clone())
            .or_insert_with(|| FeedAccessPattern::first_touch(now));

        match produced {
            Some(price) => {
                self.cache.set_price(feed, price, now_ms());
                pattern.warming_success += 1;
                self.metrics.warm_success.inc();
                true
            }
            None => {
                pattern.warming_failures += 1;
                self.metrics.warm_failures.inc();
                tracing::debug!(feed = %feed, "Warm produced no value");
                false
            }
        }
    }

    /// Pattern snapshot for one feed
    pub fn pattern(&self, feed: &FeedId) -> Option<FeedAccessPattern> {
        self.patterns.read().get(feed).cloned()
    }

    /// Accounting snapshot
    pub fn stats(&self) -> WarmerStats {
        let patterns = self.patterns.read();
        WarmerStats {
            tracked_patterns: patterns.len(),
            warming_success: patterns.values().map(|p| p.warming_success).sum(),
            warming_failures: patterns.values().map(|p| p.warming_failures).sum(),
        }
    }

    /// Start the immediate-warm consumer and the three strategy loops
    pub fn run(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(mut rx) = self.immediate_rx.lock().take() {
            let warmer = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        feed = rx.recv() => match feed {
                            Some(feed) => {
                                warmer.warm_feed_cache(&feed).await;
                            }
                            None => return,
                        }
                    }
                }
            }));
        }

        handles.push(self.spawn_strategy(
            "aggressive",
            self.config.aggressive_interval_ms,
            self.config.aggressive_concurrency,
            cancel.clone(),
            |pattern, now_ms| {
                now_ms - pattern.last_accessed_ms <= 5 * 60_000 && pattern.access_count >= 5
            },
        ));
        handles.push(self.spawn_strategy(
            "predictive",
            self.config.predictive_interval_ms,
            self.config.predictive_concurrency,
            cancel.clone(),
            |pattern, now_ms| {
                let lead = pattern.predicted_next_access_ms - now_ms;
                lead > 0 && lead <= 60_000
            },
        ));
        handles.push(self.spawn_strategy(
            "maintenance",
            self.config.maintenance_interval_ms,
            self.config.maintenance_concurrency,
            cancel,
            |pattern, now_ms| now_ms - pattern.last_accessed_ms <= 60 * 60_000,
        ));

        handles
    }

    fn spawn_strategy(
        self: &Arc<Self>,
        name: &'static str,
        interval_ms: u64,
        concurrency: usize,
        cancel: CancellationToken,
        selector: fn(&FeedAccessPattern, i64) -> bool,
    ) -> JoinHandle<()> {
        let warmer = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(strategy = name, "Warming strategy stopped");
                        return;
                    }
                    _ = tick.tick() => {}
                }

                let now = now_ms();
                if name == "maintenance" {
                    warmer.sweep_stale_patterns(now);
                }

                let mut selected: Vec<(FeedId, f64)> = warmer
                    .patterns
                    .read()
                    .iter()
                    .filter(|(_, pattern)| selector(pattern, now))
                    .map(|(feed, pattern)| (feed.clone(), pattern.priority))
                    .collect();
                selected.sort_by(|a, b| b.1.total_cmp(&a.1));

                warmer
                    .warm_batch(selected.into_iter().map(|(feed, _)| feed), concurrency)
                    .await;
            }
        })
    }

    /// Warm a batch through a bounded worker pool, collect-and-continue
    async fn warm_batch(self: &Arc<Self>, feeds: impl Iterator<Item = FeedId>, concurrency: usize) {
        let mut workers: JoinSet<()> = JoinSet::new();
        for feed in feeds {
            if workers.len() >= concurrency.max(1) {
                workers.join_next().await;
            }
            let warmer = self.clone();
            workers.spawn(async move {
                warmer.warm_feed_cache(&feed).await;
            });
        }
        while workers.join_next().await.is_some() {}
    }

    fn sweep_stale_patterns(&self, now_ms: i64) {
        let expiry_ms = self.config.pattern_idle_expiry_hours * 3_600_000;
        let mut patterns = self.patterns.write();
        let before = patterns.len();
        patterns.retain(|_, pattern| now_ms - pattern.last_accessed_ms <= expiry_ms);
        let removed = before - patterns.len();
        if removed > 0 {
            tracing::debug!(removed, "Swept stale access patterns");
        }
    }
}

/// Composite priority score
///
/// Combines access volume, recency, access frequency, warm success rate, an
/// idle decay over an adaptive half-life, and a traded-volume boost.
fn priority(pattern: &FeedAccessPattern, now_ms: i64) -> f64 {
    let base = (1.0 + pattern.access_count as f64).ln();

    let idle_ms = (now_ms - pattern.last_accessed_ms).max(0) as f64;
    let recency = if idle_ms < 30.0 * 60_000.0 {
        3.0
    } else if idle_ms < 2.0 * 3_600_000.0 {
        2.2
    } else if idle_ms < 8.0 * 3_600_000.0 {
        1.6
    } else {
        1.0
    };

    let frequency = if pattern.average_interval_ms > 0.0 && pattern.average_interval_ms < 15_000.0 {
        2.2
    } else if pattern.average_interval_ms > 0.0 && pattern.average_interval_ms < 60_000.0 {
        1.8
    } else {
        1.0
    };

    let attempts = pattern.warming_success + pattern.warming_failures;
    let success_factor = if attempts > 0 {
        0.3 + 1.4 * pattern.warming_success as f64 / attempts as f64
    } else {
        1.0
    };

    // Heavily accessed feeds decay over a longer half-life
    let half_life_hours = (12.0 + (pattern.access_count as f64).ln() * 6.0).clamp(12.0, 48.0);
    let idle_decay = 0.5_f64.powf(idle_ms / 3_600_000.0 / half_life_hours);

    let volume_boost = if pattern.recent_volume > 1.0 {
        (1.0 + pattern.recent_volume.log10() * 0.08).min(1.5)
    } else {
        1.0
    };

    (base * recency * frequency * success_factor * idle_decay * volume_boost).clamp(0.05, 100.0)
}
