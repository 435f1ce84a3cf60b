//! Feed connection manager
//!
//! Drives one exchange: keeps its websocket alive with backoff, pumps frames
//! through the exchange normalizer into the book, and rebuilds the book from
//! a REST snapshot whenever it loses sync.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::WebSocketClient;
use crate::error::{AggregatorError, Result};
use crate::metrics::Metrics;
use crate::normalizer::Normalizer;
use crate::orderbook::{ApplyOutcome, BookHandle, BookUpdate};

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;
/// Unanswered keepalive intervals before the connection is recycled
const MISSED_KEEPALIVES: u32 = 3;
/// Consecutive failed snapshot resyncs before the connection is recycled
const MAX_RESYNC_ATTEMPTS: u32 = 3;

/// Reconnect delay after `attempts` consecutive failures
pub fn backoff_delay(base_ms: u64, attempts: u32) -> Duration {
    let delay = base_ms.saturating_mul(2u64.pow(attempts.min(6)));
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

/// What the receive loop should do after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    /// Book is stale; fetch a fresh snapshot
    Resync,
}

type SnapshotFetch = BoxFuture<'static, Result<String>>;

/// Manages one exchange feed with automatic reconnection
pub struct FeedManager<N> {
    normalizer: N,
    symbol: String,
    book: BookHandle,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
    reconnect_delay_ms: u64,
    /// Silence on the socket before a ping goes out
    keepalive: Duration,
    reconnect_attempts: u32,
    last_successful_connection: Option<Instant>,
}

impl<N: Normalizer> FeedManager<N> {
    pub fn new(
        normalizer: N,
        symbol: &str,
        book: BookHandle,
        metrics: Arc<Metrics>,
        reconnect_delay_ms: u64,
        keepalive: Duration,
    ) -> Self {
        Self {
            normalizer,
            symbol: symbol.to_lowercase(),
            book,
            metrics,
            http: reqwest::Client::new(),
            reconnect_delay_ms,
            keepalive,
            reconnect_attempts: 0,
            last_successful_connection: None,
        }
    }

    /// Run until cancelled, reconnecting after every failure
    pub async fn run(mut self, cancel: CancellationToken) {
        let exchange = self.normalizer.exchange();
        info!(exchange = %exchange, symbol = %self.symbol, "Starting feed");

        loop {
            if let Some(last_success) = self.last_successful_connection {
                if last_success.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS)
                    && self.reconnect_attempts > 0
                {
                    info!(
                        exchange = %exchange,
                        previous_attempts = self.reconnect_attempts,
                        "Resetting reconnect counter after cooldown period"
                    );
                    self.reconnect_attempts = 0;
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connect_and_process() => result,
            };

            self.set_connected(false).await;

            let delay = match result {
                Ok(()) => Duration::from_secs(1),
                Err(e) => {
                    error!(exchange = %exchange, error = %e, "Feed error");
                    self.reconnect_attempts += 1;
                    backoff_delay(self.reconnect_delay_ms, self.reconnect_attempts)
                }
            };

            warn!(
                exchange = %exchange,
                attempt = self.reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting..."
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.set_connected(false).await;
        info!(exchange = %exchange, "Feed stopped");
    }

    async fn set_connected(&self, connected: bool) {
        let label = [self.normalizer.exchange().as_str()];
        self.metrics
            .connected
            .with_label_values(&label)
            .set(i64::from(connected));
        self.book.set_connected(connected).await;
    }

    /// Connect and process messages until the connection fails
    async fn connect_and_process(&mut self) -> Result<()> {
        let exchange = self.normalizer.exchange();
        let endpoint = self.normalizer.endpoint(&self.symbol);

        self.metrics
            .connects
            .with_label_values(&[exchange.as_str()])
            .inc();

        let mut client = WebSocketClient::new(&endpoint.ws_url, endpoint.subscribe.clone());
        client.connect().await?;

        self.set_connected(true).await;
        self.last_successful_connection = Some(Instant::now());
        self.reconnect_attempts = 0;
        info!(exchange = %exchange, "Feed connected, resetting reconnect counter");

        // Frames keep flowing into the book's pending buffer while the
        // snapshot is in flight.
        let mut pending: Option<SnapshotFetch> = endpoint
            .snapshot_url
            .as_deref()
            .map(|url| self.fetch_snapshot(url));
        let mut resync_attempts = 0u32;
        let mut last_message = Instant::now();

        loop {
            tokio::select! {
                body = async {
                    match pending.as_mut() {
                        Some(fetch) => fetch.await,
                        None => std::future::pending().await,
                    }
                } => {
                    pending = None;
                    match self.apply_snapshot(&body?).await {
                        FrameAction::Continue => resync_attempts = 0,
                        FrameAction::Resync => {
                            resync_attempts += 1;
                            if resync_attempts >= MAX_RESYNC_ATTEMPTS {
                                client.close().await;
                                return Err(AggregatorError::RestApiError(format!(
                                    "{exchange} snapshot did not line up with the stream after {resync_attempts} attempts"
                                )));
                            }
                            pending = endpoint.snapshot_url.as_deref().map(|url| self.fetch_snapshot(url));
                        }
                    }
                }
                frame = timeout(self.keepalive, client.recv()) => match frame {
                    Ok(Ok(frame)) => {
                        last_message = Instant::now();
                        match self.on_frame(frame.as_deref()).await {
                            Ok(FrameAction::Continue) => {}
                            Ok(FrameAction::Resync) => {
                                if pending.is_none() {
                                    pending = endpoint.snapshot_url.as_deref().map(|url| self.fetch_snapshot(url));
                                }
                            }
                            Err(e) => {
                                client.close().await;
                                return Err(e);
                            }
                        }
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        if last_message.elapsed() > self.keepalive * MISSED_KEEPALIVES {
                            warn!(exchange = %exchange, "Keepalive unanswered, reconnecting");
                            client.close().await;
                            return Err(AggregatorError::ConnectionTimeout);
                        }
                        debug!(
                            exchange = %exchange,
                            silent_ms = last_message.elapsed().as_millis() as u64,
                            "No message received within timeout, sending keepalive"
                        );
                        if let Err(e) = client.ping().await {
                            warn!(exchange = %exchange, error = %e, "Failed to send keepalive ping, reconnecting");
                            return Err(AggregatorError::ConnectionTimeout);
                        }
                    }
                },
            }
        }
    }

    /// Start fetching a REST snapshot. The returned future owns everything it
    /// needs so it can be polled alongside the socket.
    fn fetch_snapshot(&self, url: &str) -> SnapshotFetch {
        let http = self.http.clone();
        let url = url.to_string();
        let exchange = self.normalizer.exchange();

        Box::pin(async move {
            info!(exchange = %exchange, url = %url, "Fetching order book snapshot");
            let body = http
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;
            Ok(body)
        })
    }

    async fn apply_snapshot(&self, body: &str) -> FrameAction {
        match self.normalizer.parse_snapshot(body) {
            Ok(update) => self.apply(update).await,
            Err(e) => self.desync(e).await,
        }
    }

    /// Anything received, payload or control frame, proves the connection
    /// is alive.
    pub async fn on_frame(&self, frame: Option<&str>) -> Result<FrameAction> {
        self.book.touch().await;
        match frame {
            Some(raw) => self.handle_frame(raw).await,
            None => Ok(FrameAction::Continue),
        }
    }

    /// Normalize and apply one websocket payload.
    ///
    /// Errors only for conditions that need a fresh connection.
    pub async fn handle_frame(&self, raw: &str) -> Result<FrameAction> {
        match self.normalizer.normalize(raw) {
            Ok(Some(update)) => Ok(self.apply(update).await),
            Ok(None) => Ok(FrameAction::Continue),
            Err(e @ AggregatorError::ResyncRequested { .. }) => {
                self.desync(AggregatorError::ResyncRequested {
                    exchange: self.normalizer.exchange(),
                    reason: "reconnecting".to_string(),
                })
                .await;
                Err(e)
            }
            Err(e) => Ok(self.desync(e).await),
        }
    }

    async fn apply(&self, update: BookUpdate) -> FrameAction {
        let exchange = self.normalizer.exchange();
        match self.book.apply(&update).await {
            Ok(ApplyOutcome::Applied) => {
                self.metrics
                    .updates_applied
                    .with_label_values(&[exchange.as_str()])
                    .inc();
                FrameAction::Continue
            }
            Ok(outcome) => {
                debug!(exchange = %exchange, outcome = ?outcome, sequence = update.last_sequence(), "Update not applied");
                FrameAction::Continue
            }
            Err(e) => self.desync(e).await,
        }
    }

    async fn desync(&self, err: AggregatorError) -> FrameAction {
        let exchange = self.normalizer.exchange();
        warn!(exchange = %exchange, error = %err, "Book out of sync, marking stale");
        self.metrics
            .desyncs
            .with_label_values(&[exchange.as_str()])
            .inc();
        self.book.mark_stale().await;
        FrameAction::Resync
    }
}
