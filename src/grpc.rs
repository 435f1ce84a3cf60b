//! gRPC surface: `OrderbookAggregator/BookSummary`
//!
//! Each call opens its own [`Subscription`](crate::publisher::Subscription),
//! so a client first receives the current merged book and then every change
//! to it. Prices and amounts go out as doubles.

use futures_util::{Stream, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::aggregator::Snapshot;
use crate::metrics::Metrics;
use crate::orderbook::PriceLevel;
use crate::publisher::Publisher;

#[allow(clippy::all)]
pub mod proto {
    include!("gen/orderbook.rs");
}

use proto::orderbook_aggregator_server::{OrderbookAggregator, OrderbookAggregatorServer};

/// Streams merged snapshots to gRPC clients
#[derive(Clone)]
pub struct BookSummaryService {
    publisher: Publisher,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl BookSummaryService {
    pub fn new(publisher: Publisher, metrics: Arc<Metrics>, shutdown: CancellationToken) -> Self {
        Self {
            publisher,
            metrics,
            shutdown,
        }
    }
}

type SummaryStream = Pin<Box<dyn Stream<Item = Result<proto::Summary, Status>> + Send>>;

#[tonic::async_trait]
impl OrderbookAggregator for BookSummaryService {
    type BookSummaryStream = SummaryStream;

    async fn book_summary(
        &self,
        request: Request<proto::Empty>,
    ) -> Result<Response<Self::BookSummaryStream>, Status> {
        let guard = self.metrics.track_subscriber();
        debug!(
            remote = ?request.remote_addr(),
            subscribers = self.publisher.subscriber_count() + 1,
            "gRPC subscriber connected"
        );

        let stream = self
            .publisher
            .subscribe()
            .into_stream_with(guard)
            .map(|snapshot| Ok(to_proto(&snapshot)))
            .take_until(self.shutdown.clone().cancelled_owned());

        Ok(Response::new(Box::pin(stream)))
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

fn level_to_proto(level: &PriceLevel) -> proto::Level {
    proto::Level {
        exchange: level.source.to_string(),
        price: to_f64(level.price),
        amount: to_f64(level.quantity),
    }
}

pub fn to_proto(snapshot: &Snapshot) -> proto::Summary {
    proto::Summary {
        spread: snapshot.spread.map(to_f64),
        bids: snapshot.bids.iter().map(level_to_proto).collect(),
        asks: snapshot.asks.iter().map(level_to_proto).collect(),
    }
}

/// Serve `BookSummary` until `shutdown` is cancelled
pub async fn serve(
    addr: SocketAddr,
    publisher: Publisher,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Starting gRPC server");
    serve_on(listener, publisher, metrics, shutdown).await
}

pub async fn serve_on(
    listener: tokio::net::TcpListener,
    publisher: Publisher,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let service = BookSummaryService::new(publisher, metrics, shutdown.clone());
    tonic::transport::Server::builder()
        .add_service(OrderbookAggregatorServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await?;
    info!("gRPC server stopped");
    Ok(())
}
