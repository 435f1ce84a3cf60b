//! Prometheus metrics
//!
//! Collectors live in a registry owned by [`Metrics`] rather than the global
//! default one, so tests can build as many instances as they like.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use tracing::debug;

use crate::error::{AggregatorError, Result};
use crate::orderbook::ExchangeId;

pub struct Metrics {
    registry: Registry,
    /// Updates that changed a book, per exchange
    pub updates_applied: IntCounterVec,
    /// Sequence gaps, bad payloads and resync requests, per exchange
    pub desyncs: IntCounterVec,
    /// Websocket (re)connection attempts, per exchange
    pub connects: IntCounterVec,
    /// 1 while the exchange websocket is up
    pub connected: IntGaugeVec,
    pub recomputes: IntCounter,
    /// Snapshots that differed from the previous one
    pub snapshots_published: IntCounter,
    pub live_exchanges: IntGauge,
    pub subscribers: IntGauge,
    pub recompute_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("orderbook_aggregator".to_string()), None)?;

        let updates_applied = IntCounterVec::new(
            Opts::new("updates_applied_total", "Book updates applied"),
            &["exchange"],
        )?;
        let desyncs = IntCounterVec::new(
            Opts::new("desyncs_total", "Books marked stale after a desynchronization"),
            &["exchange"],
        )?;
        let connects = IntCounterVec::new(
            Opts::new("connects_total", "Websocket connection attempts"),
            &["exchange"],
        )?;
        let connected = IntGaugeVec::new(
            Opts::new("exchange_connected", "Whether the exchange feed is connected"),
            &["exchange"],
        )?;
        let recomputes = IntCounter::new("recomputes_total", "Merged book recomputations")?;
        let snapshots_published =
            IntCounter::new("snapshots_published_total", "Distinct merged snapshots published")?;
        let live_exchanges = IntGauge::new("live_exchanges", "Books currently merged")?;
        let subscribers = IntGauge::new("subscribers", "Open snapshot stream subscriptions")?;
        let recompute_seconds = Histogram::with_opts(
            HistogramOpts::new("recompute_seconds", "Time spent merging books").buckets(vec![
                0.000_001, 0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01,
            ]),
        )?;

        registry.register(Box::new(updates_applied.clone()))?;
        registry.register(Box::new(desyncs.clone()))?;
        registry.register(Box::new(connects.clone()))?;
        registry.register(Box::new(connected.clone()))?;
        registry.register(Box::new(recomputes.clone()))?;
        registry.register(Box::new(snapshots_published.clone()))?;
        registry.register(Box::new(live_exchanges.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;
        registry.register(Box::new(recompute_seconds.clone()))?;

        // Pre-create labelled series so every exchange shows up at zero.
        for exchange in ExchangeId::ALL {
            let label = [exchange.as_str()];
            updates_applied.with_label_values(&label);
            desyncs.with_label_values(&label);
            connects.with_label_values(&label);
            connected.with_label_values(&label);
        }

        Ok(Self {
            registry,
            updates_applied,
            desyncs,
            connects,
            connected,
            recomputes,
            snapshots_published,
            live_exchanges,
            subscribers,
            recompute_seconds,
        })
    }

    /// Count one open subscription until the guard is dropped
    pub fn track_subscriber(&self) -> SubscriberGuard {
        self.subscribers.inc();
        SubscriberGuard(self.subscribers.clone())
    }

    /// Prometheus text exposition of every collector
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| AggregatorError::SerializationError(e.to_string()))
    }
}

/// Keeps the subscriber gauge in step with open streams
#[derive(Debug)]
pub struct SubscriberGuard(IntGauge);

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.0.dec();
        debug!("Subscriber disconnected");
    }
}
