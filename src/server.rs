//! HTTP surface
//!
//! - `GET /book`: server-sent events, one `book` event per merged snapshot,
//!   starting with the current one
//! - `GET /book/snapshot`: the current merged snapshot as JSON
//! - `GET /health`: per-exchange book status
//! - `GET /metrics`: Prometheus text exposition

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::aggregator::Snapshot;
use crate::metrics::Metrics;
use crate::orderbook::{BookRegistry, BookStatus};
use crate::publisher::Publisher;

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub publisher: Publisher,
    pub registry: Arc<BookRegistry>,
    pub metrics: Arc<Metrics>,
    /// Ends open event streams on shutdown
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/book", get(book_stream))
        .route("/book/snapshot", get(book_snapshot))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Starting HTTP server");
    serve_on(listener, state).await
}

pub async fn serve_on(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn book_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let guard = state.metrics.track_subscriber();
    debug!(subscribers = state.publisher.subscriber_count() + 1, "Subscriber connected");

    let stream = state
        .publisher
        .subscribe()
        .into_stream_with(guard)
        .map(|snapshot| Event::default().event("book").json_data(&*snapshot))
        .take_until(state.shutdown.cancelled_owned());

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn book_snapshot(State(state): State<AppState>) -> Json<Snapshot> {
    Json(Snapshot::clone(&state.publisher.current()))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let statuses = state.registry.statuses().await;
    let live = statuses
        .iter()
        .filter(|(_, status)| *status == BookStatus::Live)
        .count();

    let exchanges: serde_json::Map<String, serde_json::Value> = statuses
        .iter()
        .map(|(exchange, status)| (exchange.to_string(), serde_json::json!(status)))
        .collect();

    Json(serde_json::json!({
        "status": if live > 0 { "healthy" } else { "degraded" },
        "component": "orderbook-aggregator",
        "live_exchanges": live,
        "exchanges": exchanges,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{ExchangeId, PriceLevel, Sequencing};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct TestServer {
        base: String,
        state: AppState,
    }

    async fn start(registry: BookRegistry) -> TestServer {
        let state = AppState {
            publisher: Publisher::new(),
            registry: Arc::new(registry),
            metrics: Arc::new(Metrics::new().unwrap()),
            shutdown: CancellationToken::new(),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve_on(listener, state.clone()));
        TestServer { base, state }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            bids: vec![PriceLevel {
                price: dec!(0.068),
                quantity: dec!(2),
                source: ExchangeId::Binance,
            }],
            asks: vec![PriceLevel {
                price: dec!(0.069),
                quantity: dec!(1),
                source: ExchangeId::Bitstamp,
            }],
            spread: Some(dec!(0.001)),
        }
    }

    #[tokio::test]
    async fn test_snapshot_endpoint() {
        let server = start(BookRegistry::new()).await;
        server.state.publisher.publish(snapshot());

        let body: serde_json::Value = reqwest::get(format!("{}/book/snapshot", server.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["spread"], "0.001");
        assert_eq!(body["bids"][0]["exchange"], "binance");
        assert_eq!(body["asks"][0]["exchange"], "bitstamp");
        server.state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_health_reports_each_exchange() {
        let mut registry = BookRegistry::new();
        let binance = registry.register(ExchangeId::Binance, Sequencing::Contiguous, 100);
        registry.register(ExchangeId::Bitstamp, Sequencing::Monotonic, 100);
        binance.set_connected(true).await;

        let server = start(registry).await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", server.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["status"], "degraded");
        assert_eq!(body["exchanges"]["binance"], "awaiting_snapshot");
        assert_eq!(body["exchanges"]["bitstamp"], "disconnected");
        server.state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let server = start(BookRegistry::new()).await;
        let text = reqwest::get(format!("{}/metrics", server.base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(text.contains("orderbook_aggregator_snapshots_published_total"));
        server.state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_event_stream_starts_with_current_snapshot() {
        let server = start(BookRegistry::new()).await;
        server.state.publisher.publish(snapshot());

        let mut response = reqwest::get(format!("{}/book", server.base)).await.unwrap();
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("event: book"));
        assert!(text.contains(r#""spread":"0.001""#));
        assert_eq!(server.state.metrics.subscribers.get(), 1);

        drop(response);
        server.state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_closed_event_stream_releases_subscriber() {
        let server = start(BookRegistry::new()).await;
        let mut response = reqwest::get(format!("{}/book", server.base)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.state.metrics.subscribers.get(), 1);

        drop(response);
        // The server notices the closed connection on its next write.
        server.state.publisher.publish(snapshot());
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.state.metrics.subscribers.get() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                server.state.publisher.publish(Snapshot::default());
                server.state.publisher.publish(snapshot());
            }
        })
        .await
        .unwrap();
        assert_eq!(server.state.publisher.subscriber_count(), 0);
        server.state.shutdown.cancel();
    }
}
