//! Binance normalizer
//!
//! Binance streams diff-depth events carrying absolute quantities and a
//! contiguous `U..=u` update id range. The stream has to be seeded from the
//! REST depth snapshot, whose `lastUpdateId` anchors the first event.

use serde::Deserialize;

use super::{deserialize_price_levels, excerpt, to_deltas, to_levels, FeedEndpoint, Normalizer, RawLevel};
use crate::error::{AggregatorError, Result};
use crate::orderbook::{BookUpdate, ExchangeId, SequenceRange, Sequencing};

/// Largest snapshot Binance serves
const MAX_SNAPSHOT_LIMIT: usize = 5000;

/// Binance depth update message
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    /// Event type
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    /// Bids to update
    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<RawLevel>,

    /// Asks to update
    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<RawLevel>,
}

/// Order book snapshot from the REST API or a partial-depth stream
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookSnapshot {
    /// Last update ID
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<RawLevel>,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<RawLevel>,
}

/// Reply to a SUBSCRIBE request
#[derive(Debug, Clone, Deserialize)]
pub struct CommandResponse {
    pub id: u64,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Payload {
    Depth(DepthUpdate),
    Snapshot(OrderBookSnapshot),
}

/// Any message on a raw or combined Binance stream
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Message {
    Combined { stream: String, data: Payload },
    Payload(Payload),
    Response(CommandResponse),
}

impl From<DepthUpdate> for BookUpdate {
    fn from(update: DepthUpdate) -> Self {
        BookUpdate::Deltas {
            sequence: SequenceRange {
                first: update.first_update_id,
                last: update.final_update_id,
            },
            deltas: to_deltas(&update.bids, &update.asks),
        }
    }
}

impl From<OrderBookSnapshot> for BookUpdate {
    fn from(snapshot: OrderBookSnapshot) -> Self {
        BookUpdate::Snapshot {
            sequence: snapshot.last_update_id,
            bids: to_levels(&snapshot.bids),
            asks: to_levels(&snapshot.asks),
        }
    }
}

/// Normalizer for the Binance spot diff-depth stream
#[derive(Debug, Clone)]
pub struct BinanceNormalizer {
    ws_endpoint: String,
    rest_endpoint: String,
    snapshot_limit: usize,
}

impl BinanceNormalizer {
    pub fn new(ws_endpoint: &str, rest_endpoint: &str, snapshot_limit: usize) -> Self {
        Self {
            ws_endpoint: ws_endpoint.trim_end_matches('/').to_string(),
            rest_endpoint: rest_endpoint.trim_end_matches('/').to_string(),
            snapshot_limit: snapshot_limit.clamp(1, MAX_SNAPSHOT_LIMIT),
        }
    }

    fn from_payload(payload: Payload) -> Option<BookUpdate> {
        match payload {
            Payload::Depth(depth) if depth.event_type == "depthUpdate" => Some(depth.into()),
            Payload::Depth(depth) => {
                tracing::trace!(event = %depth.event_type, "Ignoring Binance event");
                None
            }
            Payload::Snapshot(snapshot) => Some(snapshot.into()),
        }
    }
}

impl Normalizer for BinanceNormalizer {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    fn sequencing(&self) -> Sequencing {
        Sequencing::Contiguous
    }

    fn endpoint(&self, symbol: &str) -> FeedEndpoint {
        FeedEndpoint {
            ws_url: format!("{}/ws/{}@depth@100ms", self.ws_endpoint, symbol.to_lowercase()),
            subscribe: Vec::new(),
            snapshot_url: Some(format!(
                "{}/depth?symbol={}&limit={}",
                self.rest_endpoint,
                symbol.to_uppercase(),
                self.snapshot_limit
            )),
        }
    }

    fn normalize(&self, raw: &str) -> Result<Option<BookUpdate>> {
        let message: Message = serde_json::from_str(raw).map_err(|e| {
            AggregatorError::ParseError(format!("binance: {e}: {}", excerpt(raw)))
        })?;

        match message {
            Message::Combined { stream, data } => {
                tracing::trace!(stream = %stream, "Combined stream payload");
                Ok(Self::from_payload(data))
            }
            Message::Payload(payload) => Ok(Self::from_payload(payload)),
            Message::Response(response) => {
                tracing::debug!(id = response.id, result = ?response.result, "Binance command response");
                Ok(None)
            }
        }
    }

    fn parse_snapshot(&self, body: &str) -> Result<BookUpdate> {
        let snapshot: OrderBookSnapshot = serde_json::from_str(body).map_err(|e| {
            AggregatorError::ParseError(format!("binance snapshot: {e}: {}", excerpt(body)))
        })?;
        Ok(snapshot.into())
    }
}
