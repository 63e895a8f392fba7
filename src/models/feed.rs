//! Feed identifiers
//!
//! A feed is a named price series, e.g. `BTC/USD` in category Crypto.
//! Names are uppercase `BASE/QUOTE` pairs with exactly one separator.

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};

/// Asset category of a feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedCategory {
    Crypto,
    Forex,
    Commodity,
    Stock,
}

impl std::fmt::Display for FeedCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto => write!(f, "crypto"),
            Self::Forex => write!(f, "forex"),
            Self::Commodity => write!(f, "commodity"),
            Self::Stock => write!(f, "stock"),
        }
    }
}

/// Identifier of a price feed
///
/// Two feeds are equal iff both category and name match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedId {
    /// Asset category
    pub category: FeedCategory,
    /// Pair name, `BASE/QUOTE`, uppercase
    pub name: String,
}

impl FeedId {
    /// Create a feed id, validating the pair name
    pub fn new(category: FeedCategory, name: impl Into<String>) -> FeedResult<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { category, name })
    }

    /// Convenience constructor for crypto pairs
    pub fn crypto(name: impl Into<String>) -> FeedResult<Self> {
        Self::new(FeedCategory::Crypto, name)
    }

    /// Base asset of the pair
    pub fn base(&self) -> &str {
        self.name.split('/').next().unwrap_or("")
    }

    /// Quote asset of the pair
    pub fn quote(&self) -> &str {
        self.name.split('/').nth(1).unwrap_or("")
    }
}

impl std::fmt::Display for FeedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.category, self.name)
    }
}

fn validate_name(name: &str) -> FeedResult<()> {
    let mut parts = name.split('/');
    let base = parts.next().unwrap_or("");
    let quote = parts.next().unwrap_or("");

    if base.is_empty() || quote.is_empty() || parts.next().is_some() {
        return Err(FeedError::Config(format!(
            "invalid feed name '{}': expected BASE/QUOTE",
            name
        )));
    }
    if name.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(FeedError::Config(format!(
            "invalid feed name '{}': must be uppercase",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_feed_id() {
        let feed = FeedId::crypto("BTC/USD").unwrap();
        assert_eq!(feed.base(), "BTC");
        assert_eq!(feed.quote(), "USD");
        assert_eq!(feed.to_string(), "crypto:BTC/USD");
    }

    #[test]
    fn test_rejects_malformed_names() {
        assert!(FeedId::crypto("BTCUSD").is_err());
        assert!(FeedId::crypto("BTC/USD/EUR").is_err());
        assert!(FeedId::crypto("/USD").is_err());
        assert!(FeedId::crypto("BTC/").is_err());
        assert!(FeedId::crypto("btc/usd").is_err());
    }

    #[test]
    fn test_equality_covers_category() {
        let a = FeedId::crypto("EUR/USD").unwrap();
        let b = FeedId::new(FeedCategory::Forex, "EUR/USD").unwrap();
        assert_ne!(a, b);
    }
}
