//! Scripted adapter for tests
//!
//! Lets tests push updates and connection transitions from the outside and
//! observe subscribe/unsubscribe calls.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use crate::error::{FeedError, FeedResult};
use crate::models::{FeedCategory, PriceUpdate};

use super::{AdapterCapabilities, AdapterEvent, ExchangeAdapter};

const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// In-process adapter driven by test code
pub struct MockAdapter {
    name: String,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    events: broadcast::Sender<AdapterEvent>,
    subscribed: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            events,
            subscribed: Mutex::new(Vec::new()),
        }
    }

    /// Make subsequent `connect` calls fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Release);
    }

    /// Emit a price update as if decoded from the wire
    pub fn push_update(&self, update: PriceUpdate) {
        let _ = self.events.send(AdapterEvent::PriceUpdate(update));
    }

    /// Emit a transport loss
    pub fn emit_disconnect(&self, reason: impl Into<String>) {
        self.connected.store(false, Ordering::Release);
        let _ = self.events.send(AdapterEvent::Disconnected {
            source: self.name.clone(),
            reason: reason.into(),
        });
    }

    /// Symbols currently subscribed
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            rest: false,
            volume: true,
            categories: vec![FeedCategory::Crypto, FeedCategory::Forex],
        }
    }

    async fn connect(&self) -> FeedResult<()> {
        if self.fail_connect.load(Ordering::Acquire) {
            return Err(FeedError::SourceTransient {
                source_name: self.name.clone(),
                reason: "scripted connect failure".to_string(),
            });
        }
        self.connected.store(true, Ordering::Release);
        let _ = self.events.send(AdapterEvent::Connected {
            source: self.name.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> FeedResult<()> {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(AdapterEvent::Disconnected {
                source: self.name.clone(),
                reason: "client disconnect".to_string(),
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn subscribe(&self, symbols: &[String]) -> FeedResult<()> {
        let mut subscribed = self.subscribed.lock();
        for symbol in symbols {
            if !subscribed.contains(symbol) {
                subscribed.push(symbol.clone());
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> FeedResult<()> {
        let mut subscribed = self.subscribed.lock();
        subscribed.retain(|s| !symbols.contains(s));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}
