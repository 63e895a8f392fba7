//! Exchange adapters
//!
//! Each adapter drives one exchange connection, decodes the exchange wire
//! format, and emits normalized price updates and connection transitions on
//! a broadcast channel. Adapters never retry beyond one immediate reconnect
//! attempt; sustained failures are the recovery layer's job.

pub mod binance;
pub mod coinbase;
pub mod mock;
pub mod rest_fallback;

pub use binance::BinanceAdapter;
pub use coinbase::CoinbaseAdapter;
pub use mock::MockAdapter;
pub use rest_fallback::RestFallbackAdapter;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::AdaptersConfig;
use crate::error::{FeedError, FeedResult};
use crate::models::{FeedCategory, PriceUpdate};

/// Capability descriptor for one adapter
#[derive(Debug, Clone)]
pub struct AdapterCapabilities {
    /// Pushes updates over a streaming transport
    pub streaming: bool,
    /// Pulls updates over REST
    pub rest: bool,
    /// Reports traded volume
    pub volume: bool,
    /// Feed categories the venue can serve
    pub categories: Vec<FeedCategory>,
}

/// Events emitted by an adapter
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A normalized price observation
    PriceUpdate(PriceUpdate),
    /// Transport established
    Connected { source: String },
    /// Transport lost
    Disconnected { source: String, reason: String },
    /// One symbol's subscription failed or was dropped by the venue
    SubscriptionDropped {
        source: String,
        symbol: String,
        reason: String,
    },
}

/// Contract implemented by every exchange driver
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Source id, e.g. `binance`
    fn name(&self) -> &str;

    /// What this venue can do
    fn capabilities(&self) -> AdapterCapabilities;

    /// Establish the transport
    async fn connect(&self) -> FeedResult<()>;

    /// Tear down the transport
    async fn disconnect(&self) -> FeedResult<()>;

    /// Whether the transport is currently up
    fn is_connected(&self) -> bool;

    /// Subscribe to feeds by pair name, e.g. `BTC/USD`
    async fn subscribe(&self, symbols: &[String]) -> FeedResult<()>;

    /// Drop subscriptions by pair name
    async fn unsubscribe(&self, symbols: &[String]) -> FeedResult<()>;

    /// Event stream; each call returns a fresh receiver
    fn events(&self) -> broadcast::Receiver<AdapterEvent>;
}

/// Registry mapping adapter names to constructors
pub fn build_adapter(name: &str, config: &AdaptersConfig) -> FeedResult<Arc<dyn ExchangeAdapter>> {
    match name {
        "binance" => Ok(Arc::new(BinanceAdapter::new())),
        "coinbase" => Ok(Arc::new(CoinbaseAdapter::new())),
        "rest_fallback" => Ok(Arc::new(RestFallbackAdapter::new(
            config.rest_fallback.clone(),
        ))),
        "mock" => Ok(Arc::new(MockAdapter::new("mock"))),
        other => Err(FeedError::Config(format!("unknown adapter: {}", other))),
    }
}

/// Names the registry can construct
pub fn available_adapters() -> &'static [&'static str] {
    &["binance", "coinbase", "rest_fallback", "mock"]
}
