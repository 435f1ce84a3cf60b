//! Configuration module for the order book aggregator
//!
//! Every setting comes from an `AGG_`-prefixed environment variable (a `.env`
//! file is honoured) and falls back to the defaults below.

use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::aggregator::AggregatorSettings;
use crate::error::{AggregatorError, Result};
use crate::normalizer::bitstamp::BitstampChannel;
use crate::orderbook::ExchangeId;

const ENV_PREFIX: &str = "AGG";

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Currency pair, e.g. "ethbtc"
    pub symbol: String,

    /// Comma separated exchanges to aggregate
    pub exchanges: String,

    /// Port for the HTTP surface
    pub http_port: u16,

    /// Port for the gRPC `BookSummary` stream
    pub grpc_port: u16,

    pub binance_ws: String,
    pub binance_rest: String,
    pub bitstamp_ws: String,
    pub bitstamp_rest: String,

    /// "full" or "diff"
    pub bitstamp_channel: String,

    /// Levels kept per side in each exchange book
    pub depth_levels: usize,

    /// A book silent for longer than this is left out of the merge
    pub stale_after_ms: u64,

    /// Live books below this count are logged as degraded
    pub min_live_exchanges: usize,

    /// Base delay for reconnect backoff
    pub reconnect_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "ethbtc".to_string(),
            exchanges: "binance,bitstamp".to_string(),
            http_port: 9090,
            grpc_port: 50051,
            binance_ws: "wss://stream.binance.com:9443".to_string(),
            binance_rest: "https://api.binance.com/api/v3".to_string(),
            bitstamp_ws: "wss://ws.bitstamp.net".to_string(),
            bitstamp_rest: "https://www.bitstamp.net/api/v2".to_string(),
            bitstamp_channel: "full".to_string(),
            depth_levels: 1000,
            stale_after_ms: 5000,
            min_live_exchanges: 2,
            reconnect_delay_ms: 1000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_env(config::Environment::with_prefix(ENV_PREFIX))?;
        Ok(config)
    }

    /// Build from an environment source and validate the result
    pub fn from_env(env: config::Environment) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(env)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(AggregatorError::ConfigError("symbol must not be empty".to_string()));
        }
        let exchanges = self.exchange_ids()?;
        if exchanges.is_empty() {
            return Err(AggregatorError::ConfigError(
                "at least one exchange is required".to_string(),
            ));
        }
        if self.depth_levels < crate::aggregator::TOP_N {
            return Err(AggregatorError::ConfigError(format!(
                "depth_levels must be at least {}",
                crate::aggregator::TOP_N
            )));
        }
        if self.stale_after_ms < 2 {
            return Err(AggregatorError::ConfigError(
                "stale_after_ms must be at least 2".to_string(),
            ));
        }
        if self.http_port == self.grpc_port {
            return Err(AggregatorError::ConfigError(
                "http_port and grpc_port must differ".to_string(),
            ));
        }
        self.bitstamp_channel()?;
        Ok(())
    }

    /// Configured exchanges, deduplicated, in priority order
    pub fn exchange_ids(&self) -> Result<Vec<ExchangeId>> {
        let mut ids = self
            .exchanges
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| ExchangeId::from_str(s).map_err(AggregatorError::ConfigError))
            .collect::<Result<Vec<_>>>()?;
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    pub fn bitstamp_channel(&self) -> Result<BitstampChannel> {
        match self.bitstamp_channel.trim().to_lowercase().as_str() {
            "full" => Ok(BitstampChannel::Full),
            "diff" => Ok(BitstampChannel::Diff),
            other => Err(AggregatorError::ConfigError(format!(
                "unknown bitstamp channel '{other}', expected 'full' or 'diff'"
            ))),
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Ping interval on a silent socket. Half the stale window, so a healthy
    /// but quiet feed is heard from before its book ages out.
    pub fn keepalive(&self) -> Duration {
        self.stale_after() / 2
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            stale_after: self.stale_after(),
            min_live_exchanges: self.min_live_exchanges,
        }
    }
}
