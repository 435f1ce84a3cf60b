//! Order book module
//!
//! Per-exchange books kept in sync from normalized updates, plus the shared
//! registry the aggregator reads them through.

mod book;
mod registry;

pub use book::{ApplyOutcome, BookStatus, ExchangeBook, Sequencing};
pub use registry::{BookHandle, BookRegistry, BookView};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

/// Exchanges feeding the aggregator.
///
/// Declaration order is the tie-break priority when two exchanges quote the
/// same price: earlier variants rank first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Binance,
    Bitstamp,
}

impl ExchangeId {
    pub const ALL: [ExchangeId; 2] = [ExchangeId::Binance, ExchangeId::Bitstamp];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Bitstamp => "bitstamp",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExchangeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(ExchangeId::Binance),
            "bitstamp" => Ok(ExchangeId::Bitstamp),
            other => Err(format!("unknown exchange: {other}")),
        }
    }
}

/// A (price, quantity) pair within one exchange's book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// A level in the merged book, tagged with the exchange that quotes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(rename = "exchange")]
    pub source: ExchangeId,
}

/// Change to a single price level. Zero quantity removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Range of exchange sequence numbers an update covers.
///
/// Exchanges that stamp a single id per message use `first == last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    pub first: u64,
    pub last: u64,
}

impl SequenceRange {
    pub fn single(id: u64) -> Self {
        Self { first: id, last: id }
    }
}

/// Normalized update, the only shape an [`ExchangeBook`] accepts
#[derive(Debug, Clone, PartialEq)]
pub enum BookUpdate {
    /// Full replacement of both sides
    Snapshot {
        sequence: u64,
        bids: Vec<Level>,
        asks: Vec<Level>,
    },
    /// Incremental changes applied as one unit
    Deltas {
        sequence: SequenceRange,
        deltas: Vec<Delta>,
    },
}

impl BookUpdate {
    /// Highest sequence number this update brings the book to
    pub fn last_sequence(&self) -> u64 {
        match self {
            BookUpdate::Snapshot { sequence, .. } => *sequence,
            BookUpdate::Deltas { sequence, .. } => sequence.last,
        }
    }
}
