//! Order Book Aggregator - Library
//!
//! Maintains live order books for one currency pair on several exchanges,
//! merges them into a single top-of-book with the spread, and streams the
//! result to any number of subscribers over gRPC and server-sent events.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod grpc;
pub mod metrics;
pub mod normalizer;
pub mod orderbook;
pub mod publisher;
pub mod server;
pub mod websocket;

pub use aggregator::{merge, Aggregator, AggregatorSettings, Snapshot, TOP_N};
pub use config::Config;
pub use error::{AggregatorError, Result};
pub use orderbook::{BookHandle, BookRegistry, BookStatus, ExchangeBook, ExchangeId, PriceLevel, Side};
pub use publisher::{Publisher, Subscription};
pub use websocket::FeedManager;
