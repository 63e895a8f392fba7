//! Feed value provider library
//!
//! Oracle-side price feed provider: per-exchange adapters stream trades
//! into a consensus aggregator, results land in a warmed real-time cache,
//! and a resilience layer keeps output steady through exchange outages.
//! This library exposes the core modules for embedding and testing.

pub mod adapters;
pub mod aggregation;
pub mod aggregator;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod constants;
pub mod data_manager;
pub mod error;
pub mod metrics;
pub mod models;
pub mod recovery;
pub mod service;
pub mod warmer;

// Re-export commonly used types for embedders and tests
pub use adapters::{AdapterCapabilities, AdapterEvent, ExchangeAdapter, MockAdapter};
pub use aggregation::{AggregationService, SubscriptionHandle};
pub use aggregator::ConsensusAggregator;
pub use cache::{CacheEntry, CacheStats, RealTimeCache};
pub use circuit_breaker::{BreakerState, BreakerTransition, CircuitRegistry, SourceBreaker};
pub use config::AppConfig;
pub use data_manager::{DataManager, DataManagerEvent};
pub use error::{FeedError, FeedResult};
pub use models::{AggregatedPrice, FeedCategory, FeedId, PriceUpdate, SourceHealth, SourceStatus};
pub use recovery::{ConnectionRecovery, RecoveryEvent};
pub use service::{FeedIntegrationService, HealthStatus, SystemHealth};
pub use warmer::{CacheWarmer, FeedAccessPattern};
