//! Core value types shared across the provider

pub mod feed;
pub mod price;

pub use feed::{FeedCategory, FeedId};
pub use price::{
    now_ms, AggregatedPrice, PriceUpdate, SourceHealth, SourceStatus,
};
