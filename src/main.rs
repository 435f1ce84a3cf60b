//! Order Book Aggregator
//!
//! Connects to the configured exchange websocket feeds, keeps one order book
//! per exchange, and serves the merged top of book over gRPC and HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderbook_aggregator::metrics::Metrics;
use orderbook_aggregator::normalizer::binance::BinanceNormalizer;
use orderbook_aggregator::normalizer::bitstamp::BitstampNormalizer;
use orderbook_aggregator::normalizer::Normalizer;
use orderbook_aggregator::grpc;
use orderbook_aggregator::server::{self, AppState};
use orderbook_aggregator::{
    Aggregator, BookHandle, BookRegistry, Config, ExchangeId, FeedManager, Publisher,
};

/// Interval between status log lines
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Order Book Aggregator");

    let config = Config::load()?;
    let exchanges = config.exchange_ids()?;
    info!(symbol = %config.symbol, exchanges = ?exchanges, "Configuration loaded");

    let metrics = Arc::new(Metrics::new()?);
    let cancel = CancellationToken::new();

    let mut registry = BookRegistry::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    for exchange in exchanges {
        let task = match exchange {
            ExchangeId::Binance => {
                let normalizer =
                    BinanceNormalizer::new(&config.binance_ws, &config.binance_rest, config.depth_levels);
                spawn_feed(normalizer, &config, &mut registry, &metrics, &cancel)
            }
            ExchangeId::Bitstamp => {
                let normalizer = BitstampNormalizer::new(
                    &config.bitstamp_ws,
                    &config.bitstamp_rest,
                    config.bitstamp_channel()?,
                );
                spawn_feed(normalizer, &config, &mut registry, &metrics, &cancel)
            }
        };
        tasks.push(task);
    }

    let registry = Arc::new(registry);
    let publisher = Publisher::new();

    let aggregator = Aggregator::new(
        registry.clone(),
        publisher.clone(),
        metrics.clone(),
        config.aggregator_settings(),
    );
    tasks.push(tokio::spawn(aggregator.run(cancel.clone())));

    tasks.push(spawn_status_logger(registry.clone(), publisher.clone(), cancel.clone()));

    let grpc_handle = {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.grpc_port));
        let publisher = publisher.clone();
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = grpc::serve(addr, publisher, metrics, cancel.clone()).await {
                warn!(error = %e, "gRPC server error");
                cancel.cancel();
            }
        })
    };

    let server_handle = {
        let state = AppState {
            publisher,
            registry,
            metrics,
            shutdown: cancel.clone(),
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(state, addr).await {
                warn!(error = %e, "HTTP server error");
                cancel.cancel();
            }
        })
    };

    shutdown_signal(cancel.clone()).await;
    info!("Received shutdown signal, draining");

    let _ = grpc_handle.await;
    let _ = server_handle.await;
    for task in tasks {
        let _ = task.await;
    }

    info!("Shutdown complete");
    Ok(())
}

fn spawn_feed<N: Normalizer>(
    normalizer: N,
    config: &Config,
    registry: &mut BookRegistry,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
) -> JoinHandle<()> {
    let book: BookHandle = registry.register(
        normalizer.exchange(),
        normalizer.sequencing(),
        config.depth_levels,
    );
    let feed = FeedManager::new(
        normalizer,
        &config.symbol,
        book,
        metrics.clone(),
        config.reconnect_delay_ms,
        config.keepalive(),
    );
    tokio::spawn(feed.run(cancel.clone()))
}

/// Periodic status line with each book's state and the merged top of book
fn spawn_status_logger(
    registry: Arc<BookRegistry>,
    publisher: Publisher,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut status_interval = interval(STATUS_LOG_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = status_interval.tick() => {}
            }

            let statuses = registry.statuses().await;
            let snapshot = publisher.current();
            info!(
                books = ?statuses,
                best_bid = ?snapshot.best_bid().map(|l| l.price),
                best_ask = ?snapshot.best_ask().map(|l| l.price),
                spread = ?snapshot.spread,
                subscribers = publisher.subscriber_count(),
                "Order book status"
            );
        }
    })
}

/// Resolves on Ctrl-C or SIGTERM, or when something else cancels the token
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}
