//! Prometheus metrics for the feed value provider
//!
//! Registry of counters, gauges, and histograms:
//! - Update ingestion and drop counters
//! - Cache hit/miss counters
//! - Aggregation latency histogram
//! - Circuit breaker and source gauges
//!
//! Delivery (scrape endpoint) is left to the embedding host; `render`
//! returns the text exposition format.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

/// Metrics state
pub struct MetricsState {
    /// Prometheus registry
    registry: Registry,
    /// Updates accepted and routed
    pub updates_received: IntCounter,
    /// Updates rejected or dropped (validation, circuit, overflow)
    pub updates_dropped: IntCounter,
    /// Successful aggregations
    pub aggregations_total: IntCounter,
    /// Failed aggregations
    pub aggregation_errors: IntCounter,
    /// Real-time cache hits
    pub cache_hits: IntCounter,
    /// Real-time cache misses
    pub cache_misses: IntCounter,
    /// Warm attempts that populated or confirmed the cache
    pub warm_success: IntCounter,
    /// Warm attempts that failed
    pub warm_failures: IntCounter,
    /// Aggregation latency in milliseconds
    pub aggregation_latency: Histogram,
    /// End-to-end value response latency in milliseconds
    pub response_latency: Histogram,
    /// Sources with an open circuit
    pub open_circuits: IntGauge,
    /// Connected sources
    pub active_sources: IntGauge,
}

impl MetricsState {
    /// Create a new metrics state with all metrics registered
    pub fn new() -> Self {
        let registry = Registry::new();

        let updates_received = IntCounter::with_opts(Opts::new(
            "feed_updates_received_total",
            "Price updates accepted and routed to aggregation",
        ))
        .expect("Failed to create updates_received counter");
        registry
            .register(Box::new(updates_received.clone()))
            .expect("Failed to register updates_received");

        let updates_dropped = IntCounter::with_opts(Opts::new(
            "feed_updates_dropped_total",
            "Price updates rejected by validation, circuit, or overflow",
        ))
        .expect("Failed to create updates_dropped counter");
        registry
            .register(Box::new(updates_dropped.clone()))
            .expect("Failed to register updates_dropped");

        let aggregations_total = IntCounter::with_opts(Opts::new(
            "feed_aggregations_total",
            "Successful consensus aggregations",
        ))
        .expect("Failed to create aggregations_total counter");
        registry
            .register(Box::new(aggregations_total.clone()))
            .expect("Failed to register aggregations_total");

        let aggregation_errors = IntCounter::with_opts(Opts::new(
            "feed_aggregation_errors_total",
            "Aggregations that returned an error",
        ))
        .expect("Failed to create aggregation_errors counter");
        registry
            .register(Box::new(aggregation_errors.clone()))
            .expect("Failed to register aggregation_errors");

        let cache_hits = IntCounter::with_opts(Opts::new(
            "feed_cache_hits_total",
            "Real-time cache hits",
        ))
        .expect("Failed to create cache_hits counter");
        registry
            .register(Box::new(cache_hits.clone()))
            .expect("Failed to register cache_hits");

        let cache_misses = IntCounter::with_opts(Opts::new(
            "feed_cache_misses_total",
            "Real-time cache misses",
        ))
        .expect("Failed to create cache_misses counter");
        registry
            .register(Box::new(cache_misses.clone()))
            .expect("Failed to register cache_misses");

        let warm_success = IntCounter::with_opts(Opts::new(
            "feed_warm_success_total",
            "Cache warm attempts that populated or confirmed an entry",
        ))
        .expect("Failed to create warm_success counter");
        registry
            .register(Box::new(warm_success.clone()))
            .expect("Failed to register warm_success");

        let warm_failures = IntCounter::with_opts(Opts::new(
            "feed_warm_failures_total",
            "Cache warm attempts that failed",
        ))
        .expect("Failed to create warm_failures counter");
        registry
            .register(Box::new(warm_failures.clone()))
            .expect("Failed to register warm_failures");

        let aggregation_latency = Histogram::with_opts(HistogramOpts::new(
            "feed_aggregation_latency_ms",
            "Consensus aggregation latency in milliseconds",
        ))
        .expect("Failed to create aggregation_latency histogram");
        registry
            .register(Box::new(aggregation_latency.clone()))
            .expect("Failed to register aggregation_latency");

        let response_latency = Histogram::with_opts(HistogramOpts::new(
            "feed_response_latency_ms",
            "End-to-end value response latency in milliseconds",
        ))
        .expect("Failed to create response_latency histogram");
        registry
            .register(Box::new(response_latency.clone()))
            .expect("Failed to register response_latency");

        let open_circuits = IntGauge::with_opts(Opts::new(
            "feed_open_circuits",
            "Sources currently rejected by an open circuit",
        ))
        .expect("Failed to create open_circuits gauge");
        registry
            .register(Box::new(open_circuits.clone()))
            .expect("Failed to register open_circuits");

        let active_sources = IntGauge::with_opts(Opts::new(
            "feed_active_sources",
            "Connected data sources",
        ))
        .expect("Failed to create active_sources gauge");
        registry
            .register(Box::new(active_sources.clone()))
            .expect("Failed to register active_sources");

        Self {
            registry,
            updates_received,
            updates_dropped,
            aggregations_total,
            aggregation_errors,
            cache_hits,
            cache_misses,
            warm_success,
            warm_failures,
            aggregation_latency,
            response_latency,
            open_circuits,
            active_sources,
        }
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = MetricsState::new();
        metrics.updates_received.inc();
        metrics.cache_hits.inc_by(3);

        let text = metrics.render();
        assert!(text.contains("feed_updates_received_total 1"));
        assert!(text.contains("feed_cache_hits_total 3"));
    }
}
