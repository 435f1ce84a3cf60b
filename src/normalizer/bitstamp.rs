//! Bitstamp normalizer
//!
//! Bitstamp has no update ids; every data event carries a `microtimestamp`
//! that only grows, which serves as the sequence. The `order_book` channel
//! pushes the full top of book on every change, the `diff_order_book`
//! channel pushes absolute quantities for changed prices and is seeded from
//! the REST order book.

use serde::Deserialize;
use serde_json::json;

use super::{deserialize_price_levels, deserialize_u64_str, excerpt, to_deltas, to_levels, FeedEndpoint, Normalizer, RawLevel};
use crate::error::{AggregatorError, Result};
use crate::orderbook::{BookUpdate, ExchangeId, SequenceRange, Sequencing};

const FULL_CHANNEL_PREFIX: &str = "order_book_";
const DIFF_CHANNEL_PREFIX: &str = "diff_order_book_";

/// Which Bitstamp book channel to follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitstampChannel {
    /// Full top-100 book per event
    #[default]
    Full,
    /// Changed levels only, seeded from REST
    Diff,
}

/// Book payload shared by both channels and the REST order book
#[derive(Debug, Clone, Deserialize)]
pub struct BookData {
    #[serde(deserialize_with = "deserialize_u64_str")]
    pub microtimestamp: u64,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<RawLevel>,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<RawLevel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

/// Websocket feed message
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event")]
pub enum FeedMessage {
    #[serde(rename = "bts:subscription_succeeded")]
    SubscriptionSucceeded { channel: String },

    #[serde(rename = "bts:request_reconnect")]
    RequestReconnect,

    #[serde(rename = "bts:error")]
    Error {
        #[serde(default)]
        data: ErrorData,
    },

    #[serde(rename = "data")]
    Data { channel: String, data: BookData },

    #[serde(other)]
    Other,
}

/// Normalizer for the Bitstamp websocket API v2
#[derive(Debug, Clone)]
pub struct BitstampNormalizer {
    ws_endpoint: String,
    rest_endpoint: String,
    channel: BitstampChannel,
}

impl BitstampNormalizer {
    pub fn new(ws_endpoint: &str, rest_endpoint: &str, channel: BitstampChannel) -> Self {
        Self {
            ws_endpoint: ws_endpoint.to_string(),
            rest_endpoint: rest_endpoint.trim_end_matches('/').to_string(),
            channel,
        }
    }

    fn channel_name(&self, symbol: &str) -> String {
        let prefix = match self.channel {
            BitstampChannel::Full => FULL_CHANNEL_PREFIX,
            BitstampChannel::Diff => DIFF_CHANNEL_PREFIX,
        };
        format!("{prefix}{}", symbol.to_lowercase())
    }

    fn snapshot(data: &BookData) -> BookUpdate {
        BookUpdate::Snapshot {
            sequence: data.microtimestamp,
            bids: to_levels(&data.bids),
            asks: to_levels(&data.asks),
        }
    }
}

/// Subscription frame for one channel
pub fn make_subscription_payload(channel: &str) -> String {
    json!({
        "event": "bts:subscribe",
        "data": {
            "channel": channel
        }
    })
    .to_string()
}

impl Normalizer for BitstampNormalizer {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Bitstamp
    }

    fn sequencing(&self) -> Sequencing {
        Sequencing::Monotonic
    }

    fn endpoint(&self, symbol: &str) -> FeedEndpoint {
        let snapshot_url = match self.channel {
            BitstampChannel::Full => None,
            BitstampChannel::Diff => Some(format!(
                "{}/order_book/{}",
                self.rest_endpoint,
                symbol.to_lowercase()
            )),
        };

        FeedEndpoint {
            ws_url: self.ws_endpoint.clone(),
            subscribe: vec![make_subscription_payload(&self.channel_name(symbol))],
            snapshot_url,
        }
    }

    fn normalize(&self, raw: &str) -> Result<Option<BookUpdate>> {
        let message: FeedMessage = serde_json::from_str(raw).map_err(|e| {
            AggregatorError::ParseError(format!("bitstamp: {e}: {}", excerpt(raw)))
        })?;

        match message {
            FeedMessage::Data { channel, data } => {
                // Check the diff prefix first: it also ends in "order_book_".
                if channel.starts_with(DIFF_CHANNEL_PREFIX) {
                    Ok(Some(BookUpdate::Deltas {
                        sequence: SequenceRange::single(data.microtimestamp),
                        deltas: to_deltas(&data.bids, &data.asks),
                    }))
                } else if channel.starts_with(FULL_CHANNEL_PREFIX) {
                    Ok(Some(Self::snapshot(&data)))
                } else {
                    tracing::trace!(channel = %channel, "Ignoring Bitstamp channel");
                    Ok(None)
                }
            }
            FeedMessage::SubscriptionSucceeded { channel } => {
                tracing::info!(channel = %channel, "Bitstamp subscription confirmed");
                Ok(None)
            }
            FeedMessage::RequestReconnect => Err(AggregatorError::ResyncRequested {
                exchange: ExchangeId::Bitstamp,
                reason: "bts:request_reconnect".to_string(),
            }),
            FeedMessage::Error { data } => Err(AggregatorError::ResyncRequested {
                exchange: ExchangeId::Bitstamp,
                reason: format!("bts:error {:?}: {}", data.code, data.message),
            }),
            FeedMessage::Other => Ok(None),
        }
    }

    fn parse_snapshot(&self, body: &str) -> Result<BookUpdate> {
        let data: BookData = serde_json::from_str(body).map_err(|e| {
            AggregatorError::ParseError(format!("bitstamp snapshot: {e}: {}", excerpt(body)))
        })?;
        Ok(Self::snapshot(&data))
    }
}
