//! Error types for the order book aggregator

use thiserror::Error;

use crate::orderbook::ExchangeId;

/// Aggregator errors
#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Sequence gap on {exchange}: expected {expected}, got {got}")]
    SequenceGap {
        exchange: ExchangeId,
        expected: u64,
        got: u64,
    },

    #[error("Invalid level on {exchange}: {reason}")]
    InvalidLevel { exchange: ExchangeId, reason: String },

    #[error("{exchange} requested a resync: {reason}")]
    ResyncRequested { exchange: ExchangeId, reason: String },

    #[error("Connection timeout")]
    ConnectionTimeout,
}

impl AggregatorError {
    /// Whether this error means the book no longer mirrors the exchange and
    /// has to be rebuilt from a fresh snapshot.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            AggregatorError::ParseError(_)
                | AggregatorError::SequenceGap { .. }
                | AggregatorError::InvalidLevel { .. }
                | AggregatorError::ResyncRequested { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AggregatorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AggregatorError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for AggregatorError {
    fn from(err: serde_json::Error) -> Self {
        AggregatorError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for AggregatorError {
    fn from(err: reqwest::Error) -> Self {
        AggregatorError::RestApiError(err.to_string())
    }
}

impl From<config::ConfigError> for AggregatorError {
    fn from(err: config::ConfigError) -> Self {
        AggregatorError::ConfigError(err.to_string())
    }
}

impl From<prometheus::Error> for AggregatorError {
    fn from(err: prometheus::Error) -> Self {
        AggregatorError::SerializationError(format!("metrics: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
