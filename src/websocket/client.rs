//! WebSocket client for exchange streams
//!
//! Handles connection, subscription, and message reception.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{AggregatorError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for a single connection
pub struct WebSocketClient {
    stream: Option<WsStream>,
    url: String,
    subscribe: Vec<String>,
}

impl WebSocketClient {
    /// Create a new WebSocket client
    pub fn new(url: &str, subscribe: Vec<String>) -> Self {
        Self {
            stream: None,
            url: url.to_string(),
            subscribe,
        }
    }

    /// Connect and send the subscription frames
    pub async fn connect(&mut self) -> Result<()> {
        info!(url = %self.url, "Connecting to exchange WebSocket");

        let (mut ws_stream, response) = connect_async(self.url.as_str()).await.map_err(|e| {
            AggregatorError::WebSocketConnection(format!("Failed to connect to {}: {}", self.url, e))
        })?;

        info!(status = ?response.status(), "WebSocket connected");

        for frame in &self.subscribe {
            debug!(frame = %frame, "Sending subscription");
            ws_stream
                .send(Message::Text(frame.clone()))
                .await
                .map_err(|e| AggregatorError::WebSocketMessage(e.to_string()))?;
        }

        self.stream = Some(ws_stream);
        Ok(())
    }

    /// Receive the next message
    ///
    /// `Ok(None)` for control frames that carry no payload.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| AggregatorError::WebSocketConnection("Not connected".to_string()))?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(text)),
            Some(Ok(Message::Binary(data))) => {
                // Convert binary to text if needed
                let text = String::from_utf8_lossy(&data).to_string();
                Ok(Some(text))
            }
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Some(stream) = self.stream.as_mut() {
                    let _ = stream.send(Message::Pong(data)).await;
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) => {
                debug!("Received pong");
                Ok(None)
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(AggregatorError::WebSocketConnection(
                    "Connection closed".to_string(),
                ))
            }
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(AggregatorError::WebSocketMessage(e.to_string()))
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(AggregatorError::WebSocketConnection(
                    "Stream ended".to_string(),
                ))
            }
        }
    }

    /// Send a ping to keep connection alive
    pub async fn ping(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream
                .send(Message::Ping(vec![]))
                .await
                .map_err(|e| AggregatorError::WebSocketMessage(e.to_string()))?;
        }
        Ok(())
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
