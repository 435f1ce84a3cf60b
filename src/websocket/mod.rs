//! WebSocket module for exchange feed connections

mod client;
mod manager;

pub use client::WebSocketClient;
pub use manager::{backoff_delay, FrameAction, FeedManager};
