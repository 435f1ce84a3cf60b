//! Update normalizers
//!
//! One normalizer per exchange turns that exchange's payloads into
//! [`BookUpdate`] values and describes how to reach its feed. Everything
//! exchange specific lives behind [`Normalizer`]; adding an exchange means
//! adding an [`ExchangeId`] variant and an implementation here.

pub mod binance;
pub mod bitstamp;

pub use binance::BinanceNormalizer;
pub use bitstamp::{BitstampChannel, BitstampNormalizer};

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

use crate::error::{AggregatorError, Result};
use crate::orderbook::{BookUpdate, Delta, ExchangeId, Level, Sequencing, Side};

/// Where and how to connect to an exchange feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEndpoint {
    /// Websocket URL
    pub ws_url: String,
    /// Frames sent right after connecting
    pub subscribe: Vec<String>,
    /// REST snapshot URL, if the exchange needs one to seed its stream
    pub snapshot_url: Option<String>,
}

/// Exchange-specific translation into the common update shape
pub trait Normalizer: Send + Sync + 'static {
    fn exchange(&self) -> ExchangeId;

    /// Sequencing rule the exchange's update ids follow
    fn sequencing(&self) -> Sequencing;

    fn endpoint(&self, symbol: &str) -> FeedEndpoint;

    /// Translate one websocket payload.
    ///
    /// `Ok(None)` is returned for control messages with no book content.
    fn normalize(&self, raw: &str) -> Result<Option<BookUpdate>>;

    /// Parse a REST snapshot body
    fn parse_snapshot(&self, _body: &str) -> Result<BookUpdate> {
        Err(AggregatorError::RestApiError(format!(
            "{} has no REST snapshot",
            self.exchange()
        )))
    }
}

/// Price level as sent by the exchanges: a `[price, quantity]` pair of strings
#[derive(Debug, Clone)]
pub struct RawLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl From<&RawLevel> for Level {
    fn from(raw: &RawLevel) -> Self {
        Level {
            price: raw.price,
            quantity: raw.quantity,
        }
    }
}

/// Both sides of a payload as deltas, bids first
pub(crate) fn to_deltas(bids: &[RawLevel], asks: &[RawLevel]) -> Vec<Delta> {
    let bids = bids.iter().map(|l| Delta {
        side: Side::Bid,
        price: l.price,
        quantity: l.quantity,
    });
    let asks = asks.iter().map(|l| Delta {
        side: Side::Ask,
        price: l.price,
        quantity: l.quantity,
    });
    bids.chain(asks).collect()
}

pub(crate) fn to_levels(raw: &[RawLevel]) -> Vec<Level> {
    raw.iter().map(Level::from).collect()
}

/// Custom deserializer for price levels from array of string pairs
pub(crate) fn deserialize_price_levels<'de, D>(deserializer: D) -> std::result::Result<Vec<RawLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            Ok(RawLevel {
                price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                quantity: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            })
        })
        .collect()
}

/// Custom deserializer for integers sent as strings
pub(crate) fn deserialize_u64_str<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

/// Shorten a payload for error messages
pub(crate) fn excerpt(raw: &str) -> &str {
    let end = raw
        .char_indices()
        .nth(120)
        .map(|(idx, _)| idx)
        .unwrap_or(raw.len());
    &raw[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[derive(Deserialize)]
    struct Levels {
        #[serde(deserialize_with = "deserialize_price_levels")]
        levels: Vec<RawLevel>,
    }

    #[test]
    fn test_price_levels_from_strings() {
        let parsed: Levels =
            serde_json::from_str(r#"{"levels": [["0.06830000", "12.5"], ["0.0682", "0"]]}"#).unwrap();
        assert_eq!(parsed.levels.len(), 2);
        assert_eq!(parsed.levels[0].price, dec!(0.0683));
        assert_eq!(parsed.levels[1].quantity, Decimal::ZERO);
    }

    #[test]
    fn test_price_levels_reject_bad_shape() {
        assert!(serde_json::from_str::<Levels>(r#"{"levels": [["1.0"]]}"#).is_err());
        assert!(serde_json::from_str::<Levels>(r#"{"levels": [["abc", "1"]]}"#).is_err());
    }

    #[test]
    fn test_to_deltas_tags_sides() {
        let bids = [RawLevel {
            price: dec!(10),
            quantity: dec!(1),
        }];
        let asks = [RawLevel {
            price: dec!(11),
            quantity: dec!(0),
        }];
        let deltas = to_deltas(&bids, &asks);
        assert_eq!(deltas[0].side, Side::Bid);
        assert_eq!(deltas[1].side, Side::Ask);
        assert_eq!(deltas[1].quantity, Decimal::ZERO);
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        assert_eq!(excerpt(&long).chars().count(), 120);
        assert_eq!(excerpt("short"), "short");
    }

    struct StreamOnly;

    impl Normalizer for StreamOnly {
        fn exchange(&self) -> ExchangeId {
            ExchangeId::Bitstamp
        }

        fn sequencing(&self) -> Sequencing {
            Sequencing::Monotonic
        }

        fn endpoint(&self, _symbol: &str) -> FeedEndpoint {
            FeedEndpoint {
                ws_url: "wss://example.test".to_string(),
                subscribe: Vec::new(),
                snapshot_url: None,
            }
        }

        fn normalize(&self, _raw: &str) -> Result<Option<BookUpdate>> {
            Ok(None)
        }
    }

    #[test]
    fn test_default_snapshot_parse_is_unsupported() {
        let err = StreamOnly.parse_snapshot(r#"{"bids":[],"asks":[]}"#).unwrap_err();
        assert!(matches!(err, AggregatorError::RestApiError(_)));
        assert!(err.to_string().contains("bitstamp"));
    }
}
