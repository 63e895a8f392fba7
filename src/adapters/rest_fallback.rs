//! REST fallback adapter
//!
//! Polls a spot-price endpoint for each subscribed feed. Used as a backup
//! source when streaming adapters fail; confidence is lower than venue
//! trade prints because spot quotes lag the book.

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::RestFallbackConfig;
use crate::error::{FeedError, FeedResult};
use crate::models::{now_ms, FeedCategory, PriceUpdate};

use super::{AdapterCapabilities, AdapterEvent, ExchangeAdapter};

const SOURCE: &str = "rest_fallback";
/// Spot quotes lag the book; weight them below streaming prints
const SPOT_CONFIDENCE: f64 = 0.7;
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Consecutive all-fail poll cycles treated as a transport loss
const MAX_FAILED_CYCLES: u32 = 3;

#[derive(Debug, Deserialize)]
struct SpotResponse {
    data: SpotData,
}

#[derive(Debug, Deserialize)]
struct SpotData {
    amount: String,
}

struct Inner {
    config: RestFallbackConfig,
    client: reqwest::Client,
    connected: AtomicBool,
    events: broadcast::Sender<AdapterEvent>,
    feeds: RwLock<BTreeSet<String>>,
}

/// Polling driver over a spot-price REST endpoint
pub struct RestFallbackAdapter {
    inner: Arc<Inner>,
    poll_cancel: Mutex<Option<CancellationToken>>,
}

impl RestFallbackAdapter {
    pub fn new(config: RestFallbackConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(Inner {
                config,
                client,
                connected: AtomicBool::new(false),
                events,
                feeds: RwLock::new(BTreeSet::new()),
            }),
            poll_cancel: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for RestFallbackAdapter {
    fn name(&self) -> &str {
        SOURCE
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: false,
            rest: true,
            volume: false,
            categories: vec![FeedCategory::Crypto, FeedCategory::Forex],
        }
    }

    async fn connect(&self) -> FeedResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *self.poll_cancel.lock() = Some(cancel.clone());
        self.inner.connected.store(true, Ordering::Release);
        let _ = self.inner.events.send(AdapterEvent::Connected {
            source: SOURCE.to_string(),
        });
        tokio::spawn(poll_loop(self.inner.clone(), cancel));
        Ok(())
    }

    async fn disconnect(&self) -> FeedResult<()> {
        if let Some(cancel) = self.poll_cancel.lock().take() {
            cancel.cancel();
        }
        if self.inner.connected.swap(false, Ordering::AcqRel) {
            let _ = self.inner.events.send(AdapterEvent::Disconnected {
                source: SOURCE.to_string(),
                reason: "client disconnect".to_string(),
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    async fn subscribe(&self, symbols: &[String]) -> FeedResult<()> {
        let mut feeds = self.inner.feeds.write();
        for symbol in symbols {
            feeds.insert(symbol.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> FeedResult<()> {
        let mut feeds = self.inner.feeds.write();
        for symbol in symbols {
            feeds.remove(symbol);
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.events.subscribe()
    }
}

async fn poll_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_millis(inner.config.poll_interval_ms));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut failed_cycles = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }

        let feeds: Vec<String> = inner.feeds.read().iter().cloned().collect();
        if feeds.is_empty() {
            continue;
        }

        let mut any_success = false;
        for pair in &feeds {
            match fetch_spot(&inner, pair).await {
                Ok(update) => {
                    any_success = true;
                    let _ = inner.events.send(AdapterEvent::PriceUpdate(update));
                }
                Err(e) => {
                    tracing::debug!(source = SOURCE, pair = %pair, error = %e, "Spot poll failed");
                }
            }
        }

        if any_success {
            failed_cycles = 0;
        } else {
            failed_cycles += 1;
            if failed_cycles >= MAX_FAILED_CYCLES {
                tracing::warn!(
                    source = SOURCE,
                    cycles = failed_cycles,
                    "All spot polls failing, reporting disconnect"
                );
                inner.connected.store(false, Ordering::Release);
                let _ = inner.events.send(AdapterEvent::Disconnected {
                    source: SOURCE.to_string(),
                    reason: "spot endpoint unreachable".to_string(),
                });
                return;
            }
        }
    }
}

async fn fetch_spot(inner: &Arc<Inner>, pair: &str) -> FeedResult<PriceUpdate> {
    let url = inner
        .config
        .endpoint
        .replace("{pair}", &pair.replace('/', "-"));

    let response = inner
        .client
        .get(&url)
        .send()
        .await
        .map_err(|e| FeedError::SourceTransient {
            source_name: SOURCE.to_string(),
            reason: e.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(FeedError::SourceTransient {
            source_name: SOURCE.to_string(),
            reason: format!("spot endpoint returned {}", response.status()),
        });
    }

    let body: SpotResponse = response
        .json()
        .await
        .map_err(|e| FeedError::SourceTransient {
            source_name: SOURCE.to_string(),
            reason: format!("malformed spot response: {}", e),
        })?;

    let price = body
        .data
        .amount
        .parse::<f64>()
        .map_err(|e| FeedError::SourceTransient {
            source_name: SOURCE.to_string(),
            reason: format!("unparseable spot price: {}", e),
        })?;

    let update = PriceUpdate {
        symbol: pair.to_string(),
        price,
        timestamp_ms: now_ms(),
        source: SOURCE.to_string(),
        confidence: SPOT_CONFIDENCE,
        volume: None,
    };

    if !update.is_well_formed() {
        return Err(FeedError::SourceTransient {
            source_name: SOURCE.to_string(),
            reason: format!("invalid spot price {}", price),
        });
    }
    Ok(update)
}
