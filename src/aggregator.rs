//! Order book aggregator
//!
//! Merges the live per-exchange books into one ranked top-of-book and hands
//! the result to the [`Publisher`].
//!
//! Uses a k-way merge of the pre-sorted exchange ladders: `O(TOP_N × k)`
//! comparisons, touching only the levels that make it into the output.
//! Levels at the same price from different exchanges stay separate entries,
//! ordered by exchange priority.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::orderbook::{BookRegistry, BookView, Level, PriceLevel, Side};
use crate::publisher::Publisher;

/// Levels per side in the merged output
pub const TOP_N: usize = 10;

/// How often silent books are swept out even without new updates
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Merged top of book
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Best bids, highest price first
    pub bids: Vec<PriceLevel>,
    /// Best asks, lowest price first
    pub asks: Vec<PriceLevel>,
    /// Best ask minus best bid; `None` when either side is empty
    pub spread: Option<Decimal>,
}

impl Snapshot {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Whether `a` ranks ahead of `b` on `side`
fn better(side: Side, a: &Level, b: &Level) -> Ordering {
    match side {
        Side::Bid => b.price.cmp(&a.price),
        Side::Ask => a.price.cmp(&b.price),
    }
}

/// K-way merge of best-first ladders into the top `n` levels of one side.
///
/// Ties on price go to the exchange with the higher priority.
pub fn merge_top_n(views: &[BookView], side: Side, n: usize) -> Vec<PriceLevel> {
    let ladders: Vec<&[Level]> = views
        .iter()
        .map(|v| match side {
            Side::Bid => v.bids.as_slice(),
            Side::Ask => v.asks.as_slice(),
        })
        .collect();
    let mut cursors = vec![0usize; views.len()];
    let mut merged = Vec::with_capacity(n);

    while merged.len() < n {
        let mut best: Option<usize> = None;
        for (i, ladder) in ladders.iter().enumerate() {
            let Some(level) = ladder.get(cursors[i]) else {
                continue;
            };
            best = match best {
                None => Some(i),
                Some(b) => {
                    let order = better(side, level, &ladders[b][cursors[b]])
                        .then(views[i].exchange.cmp(&views[b].exchange));
                    if order.is_lt() {
                        Some(i)
                    } else {
                        Some(b)
                    }
                }
            };
        }

        let Some(i) = best else { break };
        let level = ladders[i][cursors[i]];
        merged.push(PriceLevel {
            price: level.price,
            quantity: level.quantity,
            source: views[i].exchange,
        });
        cursors[i] += 1;
    }

    merged
}

/// Merge book views into a [`Snapshot`]
pub fn merge(views: &[BookView]) -> Snapshot {
    let bids = merge_top_n(views, Side::Bid, TOP_N);
    let asks = merge_top_n(views, Side::Ask, TOP_N);

    let spread = match (asks.first(), bids.first()) {
        (Some(ask), Some(bid)) => Some(ask.price - bid.price),
        _ => None,
    };

    Snapshot { bids, asks, spread }
}

/// Aggregator tuning
#[derive(Debug, Clone, Copy)]
pub struct AggregatorSettings {
    /// Books silent for longer than this are left out of the merge
    pub stale_after: Duration,
    /// Fewer live books than this is logged as degraded
    pub min_live_exchanges: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5),
            min_live_exchanges: 2,
        }
    }
}

/// Recomputes the merged book whenever a book changes
pub struct Aggregator {
    registry: Arc<BookRegistry>,
    publisher: Publisher,
    metrics: Arc<Metrics>,
    settings: AggregatorSettings,
    live: Option<usize>,
}

impl Aggregator {
    pub fn new(
        registry: Arc<BookRegistry>,
        publisher: Publisher,
        metrics: Arc<Metrics>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            registry,
            publisher,
            metrics,
            settings,
            live: None,
        }
    }

    /// Merge the current state of every live book and publish it.
    ///
    /// Returns whether the published snapshot changed.
    pub async fn recompute(&mut self) -> bool {
        let views = self.registry.live_views(TOP_N, self.settings.stale_after).await;

        let t0 = Instant::now();
        let snapshot = merge(&views);
        self.metrics.recompute_seconds.observe(t0.elapsed().as_secs_f64());
        self.metrics.recomputes.inc();

        self.track_live(views.len());

        debug!(
            live = views.len(),
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            spread = ?snapshot.spread,
            "Merged"
        );

        let changed = self.publisher.publish(snapshot);
        if changed {
            self.metrics.snapshots_published.inc();
        }
        changed
    }

    fn track_live(&mut self, live: usize) {
        if self.live == Some(live) {
            return;
        }
        self.metrics.live_exchanges.set(live as i64);

        if live < self.settings.min_live_exchanges {
            warn!(
                live,
                required = self.settings.min_live_exchanges,
                "Aggregating from fewer exchanges than configured"
            );
        } else {
            info!(live, "Aggregating from all required exchanges");
        }
        self.live = Some(live);
    }

    /// Run until cancelled.
    ///
    /// Book mutations arrive as a single stored permit, so any burst while a
    /// merge is running collapses into one more merge over the latest state.
    pub async fn run(mut self, cancel: CancellationToken) {
        let changed = self.registry.changed();
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            exchanges = ?self.registry.exchanges(),
            stale_after_ms = self.settings.stale_after.as_millis() as u64,
            "Aggregator started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = changed.notified() => {}
                _ = sweep.tick() => {}
            }
            self.recompute().await;
        }

        info!("Aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{BookUpdate, ExchangeId, Sequencing};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn lvl(price: Decimal, quantity: Decimal) -> Level {
        Level { price, quantity }
    }

    fn view(exchange: ExchangeId, bids: &[Level], asks: &[Level]) -> BookView {
        BookView {
            exchange,
            bids: bids.to_vec(),
            asks: asks.to_vec(),
        }
    }

    #[test]
    fn test_merge_two_exchanges() {
        let views = [
            view(
                ExchangeId::Binance,
                &[lvl(dec!(100), dec!(1))],
                &[lvl(dec!(101), dec!(1))],
            ),
            view(
                ExchangeId::Bitstamp,
                &[lvl(dec!(100.5), dec!(2))],
                &[lvl(dec!(100.8), dec!(1))],
            ),
        ];

        let snapshot = merge(&views);

        let bids: Vec<_> = snapshot.bids.iter().map(|l| (l.price, l.source)).collect();
        let asks: Vec<_> = snapshot.asks.iter().map(|l| (l.price, l.source)).collect();
        assert_eq!(
            bids,
            vec![(dec!(100.5), ExchangeId::Bitstamp), (dec!(100), ExchangeId::Binance)]
        );
        assert_eq!(
            asks,
            vec![(dec!(100.8), ExchangeId::Bitstamp), (dec!(101), ExchangeId::Binance)]
        );
        assert_eq!(snapshot.spread, Some(dec!(0.3)));
    }

    #[test]
    fn test_disjoint_merge_matches_sorted_union() {
        let a_bids: Vec<Level> = (0..8).map(|i| lvl(Decimal::from(100 - 2 * i), dec!(1))).collect();
        let b_bids: Vec<Level> = (0..8).map(|i| lvl(Decimal::from(99 - 2 * i), dec!(2))).collect();
        let a_asks: Vec<Level> = (0..8).map(|i| lvl(Decimal::from(101 + 3 * i), dec!(1))).collect();
        let b_asks: Vec<Level> = (0..8).map(|i| lvl(Decimal::from(102 + 3 * i), dec!(2))).collect();

        let views = [
            view(ExchangeId::Binance, &a_bids, &a_asks),
            view(ExchangeId::Bitstamp, &b_bids, &b_asks),
        ];
        let snapshot = merge(&views);

        let mut expected_bids: Vec<Decimal> = a_bids.iter().chain(&b_bids).map(|l| l.price).collect();
        expected_bids.sort_by(|a, b| b.cmp(a));
        expected_bids.truncate(TOP_N);
        let mut expected_asks: Vec<Decimal> = a_asks.iter().chain(&b_asks).map(|l| l.price).collect();
        expected_asks.sort();
        expected_asks.truncate(TOP_N);

        let bids: Vec<Decimal> = snapshot.bids.iter().map(|l| l.price).collect();
        let asks: Vec<Decimal> = snapshot.asks.iter().map(|l| l.price).collect();
        assert_eq!(bids, expected_bids);
        assert_eq!(asks, expected_asks);
    }

    #[test]
    fn test_tie_broken_by_exchange_priority() {
        let binance = view(
            ExchangeId::Binance,
            &[lvl(dec!(100), dec!(1))],
            &[lvl(dec!(101), dec!(1))],
        );
        let bitstamp = view(
            ExchangeId::Bitstamp,
            &[lvl(dec!(100), dec!(5))],
            &[lvl(dec!(101), dec!(5))],
        );

        // Input order must not matter.
        for views in [[binance.clone(), bitstamp.clone()], [bitstamp.clone(), binance.clone()]] {
            for _ in 0..3 {
                let snapshot = merge(&views);
                assert_eq!(snapshot.bids.len(), 2);
                assert_eq!(snapshot.bids[0].source, ExchangeId::Binance);
                assert_eq!(snapshot.bids[1].source, ExchangeId::Bitstamp);
                assert_eq!(snapshot.asks[0].source, ExchangeId::Binance);
                assert_eq!(snapshot.asks[1].quantity, dec!(5));
            }
        }
    }

    #[test]
    fn test_equal_prices_kept_as_separate_entries() {
        let views = [
            view(ExchangeId::Binance, &[lvl(dec!(50), dec!(1))], &[]),
            view(ExchangeId::Bitstamp, &[lvl(dec!(50), dec!(2))], &[]),
        ];
        let snapshot = merge(&views);
        assert_eq!(snapshot.bids.len(), 2);
        assert!(snapshot.bids.iter().all(|l| l.price == dec!(50)));
    }

    #[test]
    fn test_empty_side_falls_back_to_other_exchange() {
        let bids: Vec<Level> = (0..15).map(|i| lvl(Decimal::from(100 - i), dec!(1))).collect();
        let views = [
            view(ExchangeId::Binance, &[], &[lvl(dec!(101), dec!(1))]),
            view(ExchangeId::Bitstamp, &bids, &[]),
        ];
        let snapshot = merge(&views);

        let expected: Vec<PriceLevel> = bids
            .iter()
            .take(TOP_N)
            .map(|l| PriceLevel {
                price: l.price,
                quantity: l.quantity,
                source: ExchangeId::Bitstamp,
            })
            .collect();
        assert_eq!(snapshot.bids, expected);
        assert_eq!(snapshot.asks.len(), 1);
    }

    #[test]
    fn test_merge_truncates_to_top_10() {
        let bids: Vec<Level> = (0..15).map(|i| lvl(Decimal::from(100 - i), dec!(1))).collect();
        let asks: Vec<Level> = (0..15).map(|i| lvl(Decimal::from(101 + i), dec!(1))).collect();
        let snapshot = merge(&[view(ExchangeId::Binance, &bids, &asks)]);
        assert_eq!(snapshot.bids.len(), TOP_N);
        assert_eq!(snapshot.asks.len(), TOP_N);
        assert_eq!(snapshot.spread, Some(dec!(1)));
    }

    #[test]
    fn test_spread_unavailable_when_side_empty() {
        let snapshot = merge(&[view(ExchangeId::Binance, &[lvl(dec!(1), dec!(1))], &[])]);
        assert_eq!(snapshot.spread, None);

        let snapshot = merge(&[]);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.spread, None);
    }

    #[test]
    fn test_crossed_book_negative_spread() {
        let views = [
            view(ExchangeId::Binance, &[lvl(dec!(102), dec!(1))], &[lvl(dec!(103), dec!(1))]),
            view(ExchangeId::Bitstamp, &[lvl(dec!(99), dec!(1))], &[lvl(dec!(101), dec!(1))]),
        ];
        assert_eq!(merge(&views).spread, Some(dec!(-1)));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = merge(&[view(ExchangeId::Bitstamp, &[lvl(dec!(1.5), dec!(2))], &[])]);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["bids"][0]["exchange"], "bitstamp");
        assert_eq!(json["bids"][0]["quantity"], "2");
        assert!(json["spread"].is_null());
    }

    /// Split price -> (owner, quantity) between the two exchanges, best first
    fn split_side(levels: &BTreeMap<u32, (bool, u32)>, bids: bool) -> (Vec<PriceLevel>, [Vec<Level>; 2]) {
        let mut all: Vec<PriceLevel> = levels
            .iter()
            .map(|(&price, &(first, quantity))| PriceLevel {
                price: Decimal::new(price as i64, 2),
                quantity: Decimal::from(quantity),
                source: if first { ExchangeId::Binance } else { ExchangeId::Bitstamp },
            })
            .collect();
        if bids {
            all.reverse();
        }

        let mut per_exchange = [Vec::new(), Vec::new()];
        for level in &all {
            let idx = usize::from(level.source == ExchangeId::Bitstamp);
            per_exchange[idx].push(lvl(level.price, level.quantity));
        }
        (all, per_exchange)
    }

    proptest! {
        #[test]
        fn prop_disjoint_merge_is_sorted_union_top_10(
            bid_levels in prop::collection::btree_map(0u32..10_000, (any::<bool>(), 1u32..50), 0..30),
            ask_levels in prop::collection::btree_map(10_000u32..20_000, (any::<bool>(), 1u32..50), 0..30),
        ) {
            let (mut expected_bids, [a_bids, b_bids]) = split_side(&bid_levels, true);
            let (mut expected_asks, [a_asks, b_asks]) = split_side(&ask_levels, false);
            expected_bids.truncate(TOP_N);
            expected_asks.truncate(TOP_N);

            let views = [
                view(ExchangeId::Binance, &a_bids, &a_asks),
                view(ExchangeId::Bitstamp, &b_bids, &b_asks),
            ];
            let snapshot = merge(&views);

            let spread = match (expected_bids.first(), expected_asks.first()) {
                (Some(bid), Some(ask)) => Some(ask.price - bid.price),
                _ => None,
            };
            prop_assert_eq!(snapshot.bids, expected_bids);
            prop_assert_eq!(snapshot.asks, expected_asks);
            prop_assert_eq!(snapshot.spread, spread);
        }
    }

    fn aggregator(registry: BookRegistry, publisher: &Publisher) -> Aggregator {
        Aggregator::new(
            Arc::new(registry),
            publisher.clone(),
            Arc::new(Metrics::new().unwrap()),
            AggregatorSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_disconnect_reflected_on_next_recompute() {
        let mut registry = BookRegistry::new();
        let binance = registry.register(ExchangeId::Binance, Sequencing::Contiguous, 100);
        let bitstamp = registry.register(ExchangeId::Bitstamp, Sequencing::Monotonic, 100);
        let publisher = Publisher::new();
        let mut aggregator = aggregator(registry, &publisher);

        binance.set_connected(true).await;
        binance
            .apply(&BookUpdate::Snapshot {
                sequence: 1,
                bids: vec![lvl(dec!(100), dec!(1))],
                asks: vec![lvl(dec!(101), dec!(1))],
            })
            .await
            .unwrap();
        bitstamp.set_connected(true).await;
        bitstamp
            .apply(&BookUpdate::Snapshot {
                sequence: 1,
                bids: vec![lvl(dec!(100.5), dec!(2))],
                asks: vec![lvl(dec!(100.8), dec!(1))],
            })
            .await
            .unwrap();

        assert!(aggregator.recompute().await);
        assert_eq!(publisher.current().spread, Some(dec!(0.3)));

        bitstamp.set_connected(false).await;
        assert!(aggregator.recompute().await);

        let current = publisher.current();
        assert!(current
            .bids
            .iter()
            .chain(&current.asks)
            .all(|l| l.source == ExchangeId::Binance));
        assert_eq!(current.spread, Some(dec!(1)));
    }

    #[tokio::test]
    async fn test_all_exchanges_down_publishes_empty_book() {
        let mut registry = BookRegistry::new();
        let binance = registry.register(ExchangeId::Binance, Sequencing::Contiguous, 100);
        let publisher = Publisher::new();
        let mut aggregator = aggregator(registry, &publisher);

        binance.set_connected(true).await;
        binance
            .apply(&BookUpdate::Snapshot {
                sequence: 1,
                bids: vec![lvl(dec!(100), dec!(1))],
                asks: vec![],
            })
            .await
            .unwrap();
        aggregator.recompute().await;
        assert!(!publisher.current().is_empty());

        binance.set_connected(false).await;
        aggregator.recompute().await;
        assert!(publisher.current().is_empty());
        assert_eq!(publisher.current().spread, None);
    }

    #[tokio::test]
    async fn test_unchanged_books_do_not_republish() {
        let mut registry = BookRegistry::new();
        let binance = registry.register(ExchangeId::Binance, Sequencing::Contiguous, 100);
        let publisher = Publisher::new();
        let mut aggregator = aggregator(registry, &publisher);

        binance.set_connected(true).await;
        binance
            .apply(&BookUpdate::Snapshot {
                sequence: 1,
                bids: vec![lvl(dec!(100), dec!(1))],
                asks: vec![lvl(dec!(101), dec!(1))],
            })
            .await
            .unwrap();
        assert!(aggregator.recompute().await);
        assert!(!aggregator.recompute().await);
    }

    #[tokio::test]
    async fn test_run_publishes_after_mutation() {
        let mut registry = BookRegistry::new();
        let binance = registry.register(ExchangeId::Binance, Sequencing::Contiguous, 100);
        let publisher = Publisher::new();
        let mut sub = publisher.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(aggregator(registry, &publisher).run(cancel.clone()));

        assert!(sub.next().await.unwrap().is_empty());

        binance.set_connected(true).await;
        binance
            .apply(&BookUpdate::Snapshot {
                sequence: 1,
                bids: vec![lvl(dec!(100), dec!(1))],
                asks: vec![lvl(dec!(101), dec!(1))],
            })
            .await
            .unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.best_bid().map(|l| l.price), Some(dec!(100)));

        cancel.cancel();
        handle.await.unwrap();
    }
}
