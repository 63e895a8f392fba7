//! Configuration management for the feed value provider
//!
//! Loads configuration from YAML files and environment variables.
//! Environment variables (prefix `FEED`, `__` separator) override YAML values.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

use crate::models::FeedCategory;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    /// Declared feeds
    #[serde(default)]
    pub feeds: FeedsConfig,
    /// Adapter fleet settings
    #[serde(default)]
    pub adapters: AdaptersConfig,
    /// Consensus aggregator tuning
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    /// Aggregation service batching
    #[serde(default)]
    pub aggregation: AggregationConfig,
    /// Real-time cache sizing and freshness
    #[serde(default)]
    pub cache: CacheConfig,
    /// Cache warmer strategy tuning
    #[serde(default)]
    pub warmer: WarmerConfig,
    /// Circuit breakers, recovery, failover
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Shutdown grace
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// A declared feed
#[derive(Debug, Clone, Deserialize)]
pub struct FeedDecl {
    /// Asset category
    pub category: FeedCategory,
    /// Pair name, `BASE/QUOTE`
    pub name: String,
}

/// Declared feed set
#[derive(Debug, Clone, Deserialize)]
pub struct FeedsConfig {
    /// Feeds served by this provider
    #[serde(default = "default_declared_feeds")]
    pub declared: Vec<FeedDecl>,
}

fn default_declared_feeds() -> Vec<FeedDecl> {
    vec![
        FeedDecl {
            category: FeedCategory::Crypto,
            name: "BTC/USD".to_string(),
        },
        FeedDecl {
            category: FeedCategory::Crypto,
            name: "ETH/USD".to_string(),
        },
    ]
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            declared: default_declared_feeds(),
        }
    }
}

/// Adapter fleet configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdaptersConfig {
    /// Streaming adapters to start, by registry name
    #[serde(default = "default_enabled_adapters")]
    pub enabled: Vec<String>,
    /// Per-call timeout for adapter operations, ms
    #[serde(default = "default_adapter_call_timeout")]
    pub call_timeout_ms: u64,
    /// REST fallback adapter
    #[serde(default)]
    pub rest_fallback: RestFallbackConfig,
}

fn default_enabled_adapters() -> Vec<String> {
    vec!["binance".to_string(), "coinbase".to_string()]
}

fn default_adapter_call_timeout() -> u64 {
    10_000
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_adapters(),
            call_timeout_ms: default_adapter_call_timeout(),
            rest_fallback: RestFallbackConfig::default(),
        }
    }
}

/// REST fallback adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RestFallbackConfig {
    /// Whether the fallback adapter is registered as a backup source
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Poll interval, ms
    #[serde(default = "default_rest_poll_interval")]
    pub poll_interval_ms: u64,
    /// Spot price endpoint; `{pair}` is replaced with `BASE-QUOTE`
    #[serde(default = "default_rest_endpoint")]
    pub endpoint: String,
    /// Per-request timeout, ms
    #[serde(default = "default_rest_timeout")]
    pub request_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_rest_poll_interval() -> u64 {
    1_000
}

fn default_rest_endpoint() -> String {
    "https://api.coinbase.com/v2/prices/{pair}/spot".to_string()
}

fn default_rest_timeout() -> u64 {
    2_000
}

impl Default for RestFallbackConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            poll_interval_ms: default_rest_poll_interval(),
            endpoint: default_rest_endpoint(),
            request_timeout_ms: default_rest_timeout(),
        }
    }
}

/// Consensus aggregator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Minimum contributing sources for full-quorum consensus
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,
    /// Maximum update age under strict validation, ms
    #[serde(default = "default_max_staleness")]
    pub max_staleness_ms: i64,
    /// Exponential time-decay constant, per ms
    #[serde(default = "default_decay_lambda")]
    pub decay_lambda: f64,
    /// Dispersion normalizer for the consensus score
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,
    /// Result cache TTL, ms
    #[serde(default = "default_result_cache_ttl")]
    pub result_cache_ttl_ms: i64,
    /// Result cache capacity, entries
    #[serde(default = "default_result_cache_capacity")]
    pub result_cache_capacity: usize,
    /// Weight optimization sweep interval, seconds
    #[serde(default = "default_weight_update_interval")]
    pub weight_update_interval_secs: u64,
}

fn default_min_sources() -> usize {
    3
}

fn default_max_staleness() -> i64 {
    crate::constants::MAX_STALENESS_MS
}

fn default_decay_lambda() -> f64 {
    crate::constants::TIME_DECAY_LAMBDA
}

fn default_outlier_threshold() -> f64 {
    crate::constants::OUTLIER_THRESHOLD
}

fn default_result_cache_ttl() -> i64 {
    500
}

fn default_result_cache_capacity() -> usize {
    1_024
}

fn default_weight_update_interval() -> u64 {
    60
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_sources: default_min_sources(),
            max_staleness_ms: default_max_staleness(),
            decay_lambda: default_decay_lambda(),
            outlier_threshold: default_outlier_threshold(),
            result_cache_ttl_ms: default_result_cache_ttl(),
            result_cache_capacity: default_result_cache_capacity(),
            weight_update_interval_secs: default_weight_update_interval(),
        }
    }
}

/// Aggregation service batching configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Consolidation tick, ms; at most one aggregate per feed per tick
    #[serde(default = "default_batch_tick")]
    pub batch_tick_ms: u64,
    /// Per-feed result cache TTL, ms
    #[serde(default = "default_feed_result_ttl")]
    pub result_cache_ttl_ms: i64,
}

fn default_batch_tick() -> u64 {
    100
}

fn default_feed_result_ttl() -> i64 {
    1_000
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            batch_tick_ms: default_batch_tick(),
            result_cache_ttl_ms: default_feed_result_ttl(),
        }
    }
}

/// Real-time cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Initial entry bound across all shards
    #[serde(default = "default_initial_entries")]
    pub initial_entries: usize,
    /// Hard entry bound across all shards
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Shard count; shard is chosen by feed hash
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    /// Fill ratio that triggers an auto-resize
    #[serde(default = "default_resize_fill_ratio")]
    pub resize_fill_ratio: f64,
    /// Freshness bound for serving cached values, ms
    #[serde(default = "default_serve_freshness")]
    pub serve_freshness_ms: i64,
    /// Freshness bound used by the warmer, ms
    #[serde(default = "default_warm_freshness")]
    pub warm_freshness_ms: i64,
}

fn default_initial_entries() -> usize {
    512
}

fn default_max_entries() -> usize {
    4_096
}

fn default_shard_count() -> usize {
    16
}

fn default_resize_fill_ratio() -> f64 {
    0.9
}

fn default_serve_freshness() -> i64 {
    2_000
}

fn default_warm_freshness() -> i64 {
    200
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            initial_entries: default_initial_entries(),
            max_entries: default_max_entries(),
            shard_count: default_shard_count(),
            resize_fill_ratio: default_resize_fill_ratio(),
            serve_freshness_ms: default_serve_freshness(),
            warm_freshness_ms: default_warm_freshness(),
        }
    }
}

/// Cache warmer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WarmerConfig {
    /// Aggressive strategy interval, ms
    #[serde(default = "default_aggressive_interval")]
    pub aggressive_interval_ms: u64,
    /// Aggressive strategy worker bound
    #[serde(default = "default_aggressive_concurrency")]
    pub aggressive_concurrency: usize,
    /// Predictive strategy interval, ms
    #[serde(default = "default_predictive_interval")]
    pub predictive_interval_ms: u64,
    /// Predictive strategy worker bound
    #[serde(default = "default_predictive_concurrency")]
    pub predictive_concurrency: usize,
    /// Maintenance strategy interval, ms
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,
    /// Maintenance strategy worker bound
    #[serde(default = "default_maintenance_concurrency")]
    pub maintenance_concurrency: usize,
    /// Idle time after which a pattern is evicted, hours
    #[serde(default = "default_pattern_idle_expiry")]
    pub pattern_idle_expiry_hours: i64,
    /// Timeout for one warm call into the aggregation path, ms
    #[serde(default = "default_warm_call_timeout")]
    pub warm_call_timeout_ms: u64,
}

fn default_aggressive_interval() -> u64 {
    3_000
}

fn default_aggressive_concurrency() -> usize {
    16
}

fn default_predictive_interval() -> u64 {
    7_000
}

fn default_predictive_concurrency() -> usize {
    12
}

fn default_maintenance_interval() -> u64 {
    20_000
}

fn default_maintenance_concurrency() -> usize {
    8
}

fn default_pattern_idle_expiry() -> i64 {
    24
}

fn default_warm_call_timeout() -> u64 {
    2_000
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            aggressive_interval_ms: default_aggressive_interval(),
            aggressive_concurrency: default_aggressive_concurrency(),
            predictive_interval_ms: default_predictive_interval(),
            predictive_concurrency: default_predictive_concurrency(),
            maintenance_interval_ms: default_maintenance_interval(),
            maintenance_concurrency: default_maintenance_concurrency(),
            pattern_idle_expiry_hours: default_pattern_idle_expiry(),
            warm_call_timeout_ms: default_warm_call_timeout(),
        }
    }
}

/// Primary and backup sources for one feed
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FeedSources {
    /// Ordered primary sources
    #[serde(default)]
    pub primary: Vec<String>,
    /// Ordered backup sources, activated on failover
    #[serde(default)]
    pub backup: Vec<String>,
}

/// Circuit breakers and connection recovery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    /// Failures within the rolling window that open a circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close a circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Rolling failure window, ms
    #[serde(default = "default_failure_window")]
    pub failure_window_ms: i64,
    /// Time an open circuit rejects calls before allowing a probe, ms
    #[serde(default = "default_open_timeout")]
    pub open_timeout_ms: i64,
    /// Reconnect backoff base, ms
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    /// Reconnect backoff cap, ms
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
    /// Backoff jitter fraction
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    /// Consecutive healthy checks before a recovered primary releases backups
    #[serde(default = "default_primary_stable_checks")]
    pub primary_stable_checks: u32,
    /// Stability check interval, ms
    #[serde(default = "default_stability_check_interval")]
    pub stability_check_interval_ms: u64,
    /// Failover plans keyed by feed name
    #[serde(default)]
    pub feed_sources: HashMap<String, FeedSources>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_failure_window() -> i64 {
    60_000
}

fn default_open_timeout() -> i64 {
    30_000
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_backoff_cap() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_primary_stable_checks() -> u32 {
    3
}

fn default_stability_check_interval() -> u64 {
    5_000
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            failure_window_ms: default_failure_window(),
            open_timeout_ms: default_open_timeout(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            backoff_jitter: default_backoff_jitter(),
            primary_stable_checks: default_primary_stable_checks(),
            stability_check_interval_ms: default_stability_check_interval(),
            feed_sources: HashMap::new(),
        }
    }
}

/// Shutdown configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Grace period for draining in-flight work, ms
    #[serde(default = "default_shutdown_grace")]
    pub grace_ms: u64,
}

fn default_shutdown_grace() -> u64 {
    5_000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_shutdown_grace(),
        }
    }
}

/// Load configuration from the given file (optional) plus `FEED_*` env overrides
pub fn load(path: Option<&str>) -> Result<AppConfig, ConfigError> {
    let file = path.unwrap_or("config/default");

    Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(Environment::with_prefix("FEED").separator("__"))
        .build()?
        .try_deserialize()
}
