//! Connection recovery and failover
//!
//! Watches the data manager for source disconnects. On a disconnect the
//! next viable backup source for each affected feed is activated and the
//! failed source is scheduled for reconnection with jittered exponential
//! backoff. Once a recovered primary stays healthy for enough consecutive
//! checks, its temporary backups are released.

use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ResilienceConfig;
use crate::data_manager::{DataManager, DataManagerEvent};
use crate::models::SourceStatus;

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Events emitted by the recovery layer
#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    /// Backup activation finished for a failed source
    FailoverCompleted {
        source: String,
        success: bool,
        activated_sources: Vec<String>,
        failover_time_ms: u64,
    },
    /// A failed source reconnected
    ConnectionRestored { source: String },
}

/// Failover coordinator and reconnect scheduler
pub struct ConnectionRecovery {
    data_manager: Arc<DataManager>,
    config: ResilienceConfig,
    /// Backups currently serving in place of a failed primary
    active_backups: RwLock<HashSet<String>>,
    /// Consecutive healthy checks per recovering primary
    stable_checks: RwLock<HashMap<String, u32>>,
    /// Sources with a reconnect task in flight
    reconnecting: RwLock<HashSet<String>>,
    events: broadcast::Sender<RecoveryEvent>,
}

impl ConnectionRecovery {
    pub fn new(data_manager: Arc<DataManager>, config: ResilienceConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            data_manager,
            config,
            active_backups: RwLock::new(HashSet::new()),
            stable_checks: RwLock::new(HashMap::new()),
            reconnecting: RwLock::new(HashSet::new()),
            events,
        }
    }

    /// Recovery event stream
    pub fn events(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    /// Backups currently active
    pub fn active_backups(&self) -> Vec<String> {
        self.active_backups.read().iter().cloned().collect()
    }

    /// Start the recovery loop
    pub fn run(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let recovery = self.clone();
        let mut events = self.data_manager.events();
        tokio::spawn(async move {
            let mut stability = tokio::time::interval(Duration::from_millis(
                recovery.config.stability_check_interval_ms,
            ));
            stability.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Recovery loop stopped");
                        return;
                    }
                    event = events.recv() => match event {
                        Ok(DataManagerEvent::SourceDisconnected { source, reason }) => {
                            tracing::info!(source = %source, reason = %reason, "Recovery handling disconnect");
                            recovery.handle_disconnect(&source, &cancel).await;
                        }
                        Ok(DataManagerEvent::SourceConnected { source }) => {
                            recovery.stable_checks.write().entry(source).or_insert(0);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = stability.tick() => recovery.stability_check().await,
                }
            }
        })
    }

    async fn handle_disconnect(self: &Arc<Self>, source: &str, cancel: &CancellationToken) {
        let started = Instant::now();
        self.stable_checks.write().remove(source);

        // Activate the next viable backup for every feed this source fed
        let mut activated = Vec::new();
        let mut referenced = false;
        for (feed_name, plan) in &self.config.feed_sources {
            if !plan.primary.iter().any(|p| p == source) {
                continue;
            }
            referenced = true;

            let candidate = plan
                .backup
                .iter()
                .find(|b| b.as_str() != source && !self.active_backups.read().contains(*b));
            let Some(backup) = candidate else {
                tracing::warn!(feed = %feed_name, source = %source, "No viable backup available");
                continue;
            };

            match self.data_manager.connect_source(backup).await {
                Ok(()) => {
                    tracing::info!(feed = %feed_name, backup = %backup, "Backup source activated");
                    self.active_backups.write().insert(backup.clone());
                    activated.push(backup.clone());
                }
                Err(e) => {
                    tracing::warn!(feed = %feed_name, backup = %backup, error = %e, "Backup activation failed");
                }
            }
        }

        if referenced {
            let _ = self.events.send(RecoveryEvent::FailoverCompleted {
                source: source.to_string(),
                success: !activated.is_empty(),
                activated_sources: activated,
                failover_time_ms: started.elapsed().as_millis() as u64,
            });
        }

        if self.reconnecting.write().insert(source.to_string()) {
            self.spawn_reconnect(source.to_string(), cancel.clone());
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, source: String, cancel: CancellationToken) {
        let recovery = self.clone();
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let delay = recovery.backoff_delay(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        recovery.reconnecting.write().remove(&source);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                match recovery.data_manager.connect_source(&source).await {
                    Ok(()) => {
                        tracing::info!(source = %source, attempts = attempt + 1, "Connection restored");
                        recovery.reconnecting.write().remove(&source);
                        recovery.stable_checks.write().insert(source.clone(), 0);
                        let _ = recovery
                            .events
                            .send(RecoveryEvent::ConnectionRestored { source });
                        return;
                    }
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        tracing::warn!(
                            source = %source,
                            attempt = attempt,
                            error = %e,
                            "Reconnect attempt failed"
                        );
                    }
                }
            }
        });
    }

    /// Exponential backoff with jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_ms as f64;
        let cap = self.config.backoff_cap_ms as f64;
        let exp = base * 2_f64.powi(attempt.min(16) as i32);
        let capped = exp.min(cap);
        let jitter = 1.0 + rand::thread_rng().gen_range(-self.config.backoff_jitter..=self.config.backoff_jitter);
        Duration::from_millis((capped * jitter).max(0.0) as u64)
    }

    /// Count consecutive healthy checks for recovering primaries and release
    /// their temporary backups once stable.
    async fn stability_check(&self) {
        let health = self.data_manager.connection_health();

        let stable: Vec<String> = {
            let mut checks = self.stable_checks.write();
            let mut stable = Vec::new();
            for (source, count) in checks.iter_mut() {
                let healthy = health
                    .get(source)
                    .map(|h| {
                        matches!(h.status, SourceStatus::Healthy | SourceStatus::Recovered)
                    })
                    .unwrap_or(false);
                if healthy {
                    *count += 1;
                    if *count >= self.config.primary_stable_checks {
                        stable.push(source.clone());
                    }
                } else {
                    *count = 0;
                }
            }
            for source in &stable {
                checks.remove(source);
            }
            stable
        };

        for primary in stable {
            let backups: Vec<String> = self
                .config
                .feed_sources
                .values()
                .filter(|plan| plan.primary.iter().any(|p| p == &primary))
                .flat_map(|plan| plan.backup.iter().cloned())
                .collect();

            for backup in backups {
                if self.active_backups.write().remove(&backup) {
                    tracing::info!(primary = %primary, backup = %backup, "Primary stable, releasing backup");
                    if let Err(e) = self.data_manager.disconnect_source(&backup).await {
                        tracing::debug!(backup = %backup, error = %e, "Backup release failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ExchangeAdapter, MockAdapter};
    use crate::aggregation::AggregationService;
    use crate::aggregator::ConsensusAggregator;
    use crate::circuit_breaker::CircuitRegistry;
    use crate::config::{AggregationConfig, AggregatorConfig, FeedSources};
    use crate::metrics::MetricsState;

    fn manager() -> Arc<DataManager> {
        let metrics = Arc::new(MetricsState::new());
        let aggregation = Arc::new(AggregationService::new(
            Arc::new(ConsensusAggregator::new(AggregatorConfig::default())),
            AggregationConfig::default(),
            2_000,
            metrics.clone(),
        ));
        let breakers = Arc::new(CircuitRegistry::new(&ResilienceConfig::default()));
        Arc::new(DataManager::new(
            aggregation,
            breakers,
            metrics,
            1_000,
            CancellationToken::new(),
        ))
    }

    fn config_with_plan() -> ResilienceConfig {
        let mut config = ResilienceConfig {
            backoff_base_ms: 10,
            backoff_cap_ms: 50,
            stability_check_interval_ms: 20,
            primary_stable_checks: 2,
            ..ResilienceConfig::default()
        };
        config.feed_sources.insert(
            "BTC/USD".to_string(),
            FeedSources {
                primary: vec!["binance".to_string()],
                backup: vec!["rest_backup".to_string()],
            },
        );
        config
    }

    #[test]
    fn test_backoff_growth_and_jitter_bounds() {
        let recovery = ConnectionRecovery::new(manager(), ResilienceConfig::default());

        for attempt in 0..5 {
            let nominal = (1_000 * (1 << attempt)).min(60_000) as f64;
            let delay = recovery.backoff_delay(attempt).as_millis() as f64;
            assert!(delay >= nominal * 0.8 - 1.0, "attempt {}: {} too small", attempt, delay);
            assert!(delay <= nominal * 1.2 + 1.0, "attempt {}: {} too large", attempt, delay);
        }

        // Capped at the configured maximum plus jitter
        let delay = recovery.backoff_delay(30).as_millis() as f64;
        assert!(delay <= 60_000.0 * 1.2 + 1.0);
    }

    #[tokio::test]
    async fn test_failover_activates_backup() {
        let manager = manager();
        let primary = Arc::new(MockAdapter::new("binance"));
        let backup = Arc::new(MockAdapter::new("rest_backup"));
        manager.add_data_source(primary.clone()).await.unwrap();
        manager.add_data_source(backup.clone()).await.unwrap();
        backup.disconnect().await.unwrap();

        let recovery = Arc::new(ConnectionRecovery::new(manager.clone(), config_with_plan()));
        let mut events = recovery.events();
        let cancel = CancellationToken::new();

        // Keep the primary down so reconnect attempts do not interfere
        primary.set_fail_connect(true);
        let handle = recovery.run(cancel.clone());
        primary.emit_disconnect("socket reset");

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
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

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_reconnect_emits_restored() {
        let manager = manager();
        let primary = Arc::new(MockAdapter::new("binance"));
        manager.add_data_source(primary.clone()).await.unwrap();

        let recovery = Arc::new(ConnectionRecovery::new(manager.clone(), config_with_plan()));
        let mut events = recovery.events();
        let cancel = CancellationToken::new();
        let handle = recovery.run(cancel.clone());

        primary.emit_disconnect("socket reset");

        // First event is the failover, then the reconnect lands
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

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_stable_primary_releases_backup() {
        let manager = manager();
        let primary = Arc::new(MockAdapter::new("binance"));
        let backup = Arc::new(MockAdapter::new("rest_backup"));
        manager.add_data_source(primary.clone()).await.unwrap();
        manager.add_data_source(backup.clone()).await.unwrap();

        let recovery = Arc::new(ConnectionRecovery::new(manager.clone(), config_with_plan()));
        let cancel = CancellationToken::new();
        let handle = recovery.run(cancel.clone());

        primary.emit_disconnect("socket reset");

        // Reconnect succeeds quickly, then stability checks release the backup
        let mut released = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if recovery.active_backups().is_empty() && primary.is_connected() {
                released = true;
                break;
            }
        }
        assert!(released);

        cancel.cancel();
        let _ = handle.await;
    }
}
