//! Error types for the feed value provider

use thiserror::Error;

/// Application-level errors
#[derive(Error, Debug)]
pub enum FeedError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No updates buffered for the feed
    #[error("No updates available for feed: {0}")]
    NoUpdates(String),

    /// Validation retained zero updates, even on the lenient pass
    #[error("No valid data for feed: {0}")]
    NoValidData(String),

    /// Fewer contributing sources than required after the lenient pass
    #[error("Insufficient sources for feed {feed}: {available} available, {required} required")]
    InsufficientSources {
        feed: String,
        available: usize,
        required: usize,
    },

    /// Source circuit is open
    #[error("Circuit open for source: {0}")]
    CircuitOpen(String),

    /// Adapter disconnect or timeout; recovery retries with backoff
    #[error("Transient failure on source {source_name}: {reason}")]
    SourceTransient { source_name: String, reason: String },

    /// No cache entry, or entry past freshness
    #[error("Cache miss for feed: {0}")]
    CacheMiss(String),

    /// Caller dropped or shutdown requested
    #[error("Operation cancelled")]
    Cancelled,

    /// Unrecoverable wiring error at init
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl From<config::ConfigError> for FeedError {
    fn from(e: config::ConfigError) -> Self {
        FeedError::Config(e.to_string())
    }
}

/// Result type alias for convenience
pub type FeedResult<T> = Result<T, FeedError>;
