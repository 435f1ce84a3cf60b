//! Core order book implementation
//!
//! Uses BTreeMap for efficient sorted price level management. Each book is
//! fed by exactly one exchange and checks every update against that
//! exchange's sequencing rule before touching its levels.

use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{BookUpdate, Delta, ExchangeId, Level, SequenceRange, Side};
use crate::error::{AggregatorError, Result};

/// Deltas held while waiting for a snapshot. Older entries are dropped once
/// full, which surfaces as a gap when the snapshot is replayed against them.
const MAX_PENDING_UPDATES: usize = 1024;

/// How an exchange numbers its updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequencing {
    /// Every update id follows the previous one; a hole is a gap.
    Contiguous,
    /// Ids only grow (e.g. timestamps); anything not newer is a replay.
    Monotonic,
}

/// Synchronization state of a book
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    /// No connection to the exchange
    Disconnected,
    /// Connected, first snapshot not applied yet
    AwaitingSnapshot,
    /// In sync and eligible for aggregation
    Live,
    /// Desynchronized, waiting for a fresh snapshot
    Stale,
}

/// Result of applying an update that did not desynchronize the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Levels changed
    Applied,
    /// Held until the next snapshot arrives
    Buffered,
    /// Already covered by the current state, nothing changed
    Skipped,
}

/// Order book for a single exchange
#[derive(Debug)]
pub struct ExchangeBook {
    exchange: ExchangeId,
    sequencing: Sequencing,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    status: BookStatus,
    /// Last applied exchange sequence number
    last_sequence: u64,
    /// Maximum depth levels to maintain per side
    max_depth: usize,
    /// Deltas received before the current snapshot
    pending: VecDeque<(SequenceRange, Vec<Delta>)>,
    /// Last time the levels changed
    last_update: Option<Instant>,
    /// Last sign of life from the connection, updates included
    last_heard: Option<Instant>,
}

impl ExchangeBook {
    /// Create an empty, disconnected book
    pub fn new(exchange: ExchangeId, sequencing: Sequencing, max_depth: usize) -> Self {
        Self {
            exchange,
            sequencing,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            status: BookStatus::Disconnected,
            last_sequence: 0,
            max_depth: max_depth.max(1),
            pending: VecDeque::new(),
            last_update: None,
            last_heard: None,
        }
    }

    /// Connection established; start over and wait for a snapshot.
    pub fn connect(&mut self) {
        self.reset();
        self.status = BookStatus::AwaitingSnapshot;
    }

    /// Connection lost; drop all state so nothing old can be merged.
    pub fn disconnect(&mut self) {
        self.reset();
        self.status = BookStatus::Disconnected;
    }

    /// Exclude the book from aggregation until the next snapshot.
    pub fn mark_stale(&mut self) {
        if self.status != BookStatus::Disconnected {
            self.status = BookStatus::Stale;
        }
        self.pending.clear();
    }

    fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.pending.clear();
        self.last_sequence = 0;
        self.last_update = None;
        self.last_heard = None;
    }

    /// Record that the connection is alive without changing any level.
    pub fn touch(&mut self) {
        if self.status != BookStatus::Disconnected {
            self.last_heard = Some(Instant::now());
        }
    }

    fn mark_updated(&mut self) {
        let now = Instant::now();
        self.last_update = Some(now);
        self.last_heard = Some(now);
    }

    /// Apply a normalized update as one unit.
    ///
    /// On a sequence gap or an invalid level the book is marked stale and
    /// the error is returned so the caller can request a new snapshot.
    pub fn apply(&mut self, update: &BookUpdate) -> Result<ApplyOutcome> {
        match update {
            BookUpdate::Snapshot {
                sequence,
                bids,
                asks,
            } => self.apply_snapshot(bids, asks, *sequence),
            BookUpdate::Deltas { sequence, deltas } => self.apply_deltas(*sequence, deltas),
        }
    }

    /// Replace both sides with a snapshot, then replay buffered deltas
    /// newer than it.
    pub fn apply_snapshot(
        &mut self,
        bids: &[Level],
        asks: &[Level],
        sequence: u64,
    ) -> Result<ApplyOutcome> {
        if self.status == BookStatus::Disconnected {
            debug!(exchange = %self.exchange, sequence, "Ignoring snapshot while disconnected");
            return Ok(ApplyOutcome::Skipped);
        }

        if self.status == BookStatus::Live && sequence <= self.last_sequence {
            debug!(exchange = %self.exchange, sequence, last = self.last_sequence, "Skipping old snapshot");
            return Ok(ApplyOutcome::Skipped);
        }

        if let Some(bad) = bids.iter().chain(asks).find(|l| l.quantity < Decimal::ZERO) {
            self.mark_stale();
            return Err(self.invalid_level(bad.price, bad.quantity));
        }

        self.bids.clear();
        self.asks.clear();

        for level in bids {
            if level.quantity > Decimal::ZERO {
                self.bids.insert(Reverse(level.price), level.quantity);
            }
        }

        for level in asks {
            if level.quantity > Decimal::ZERO {
                self.asks.insert(level.price, level.quantity);
            }
        }

        self.last_sequence = sequence;
        self.status = BookStatus::Live;
        self.mark_updated();
        self.trim_depth();

        let pending: Vec<_> = self.pending.drain(..).collect();
        for (range, deltas) in &pending {
            self.apply_live_deltas(*range, deltas)?;
        }

        Ok(ApplyOutcome::Applied)
    }

    /// Apply a batch of deltas covering `sequence`
    pub fn apply_deltas(&mut self, sequence: SequenceRange, deltas: &[Delta]) -> Result<ApplyOutcome> {
        match self.status {
            BookStatus::Disconnected => Ok(ApplyOutcome::Skipped),
            BookStatus::AwaitingSnapshot | BookStatus::Stale => {
                if self.pending.len() == MAX_PENDING_UPDATES {
                    self.pending.pop_front();
                }
                self.pending.push_back((sequence, deltas.to_vec()));
                Ok(ApplyOutcome::Buffered)
            }
            BookStatus::Live => self.apply_live_deltas(sequence, deltas),
        }
    }

    fn apply_live_deltas(&mut self, sequence: SequenceRange, deltas: &[Delta]) -> Result<ApplyOutcome> {
        if sequence.last <= self.last_sequence {
            return Ok(ApplyOutcome::Skipped);
        }

        let expected = self.last_sequence.saturating_add(1);
        if self.sequencing == Sequencing::Contiguous && sequence.first > expected {
            warn!(
                exchange = %self.exchange,
                expected,
                got = sequence.first,
                "Sequence gap, book marked stale"
            );
            self.mark_stale();
            return Err(AggregatorError::SequenceGap {
                exchange: self.exchange,
                expected,
                got: sequence.first,
            });
        }

        // Validate first so a bad batch leaves the book untouched.
        if let Some(bad) = deltas.iter().find(|d| d.quantity < Decimal::ZERO) {
            self.mark_stale();
            return Err(self.invalid_level(bad.price, bad.quantity));
        }

        for delta in deltas {
            self.update_side(delta.side, delta.price, delta.quantity);
        }

        self.last_sequence = sequence.last;
        self.mark_updated();
        self.trim_depth();

        Ok(ApplyOutcome::Applied)
    }

    /// Apply a single level change outside of any sequence check.
    ///
    /// Zero quantity removes the price (no-op if absent); a positive quantity
    /// inserts or overwrites it.
    pub fn apply_delta(&mut self, side: Side, price: Decimal, quantity: Decimal) -> Result<()> {
        if quantity < Decimal::ZERO {
            return Err(self.invalid_level(price, quantity));
        }
        self.update_side(side, price, quantity);
        self.mark_updated();
        self.trim_depth();
        Ok(())
    }

    /// Update a single price level
    fn update_side(&mut self, side: Side, price: Decimal, quantity: Decimal) {
        match side {
            Side::Bid => {
                if quantity == Decimal::ZERO {
                    self.bids.remove(&Reverse(price));
                } else {
                    self.bids.insert(Reverse(price), quantity);
                }
            }
            Side::Ask => {
                if quantity == Decimal::ZERO {
                    self.asks.remove(&price);
                } else {
                    self.asks.insert(price, quantity);
                }
            }
        }
    }

    /// Trim the book to max depth
    fn trim_depth(&mut self) {
        while self.bids.len() > self.max_depth {
            self.bids.pop_last();
        }
        while self.asks.len() > self.max_depth {
            self.asks.pop_last();
        }
    }

    fn invalid_level(&self, price: Decimal, quantity: Decimal) -> AggregatorError {
        AggregatorError::InvalidLevel {
            exchange: self.exchange,
            reason: format!("negative quantity {quantity} at {price}"),
        }
    }

    /// Up to `n` levels, best first
    pub fn best_levels(&self, side: Side, n: usize) -> Vec<Level> {
        match side {
            Side::Bid => self
                .bids
                .iter()
                .take(n)
                .map(|(Reverse(p), q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
            Side::Ask => self
                .asks
                .iter()
                .take(n)
                .map(|(p, q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
        }
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// Number of levels on one side
    pub fn depth(&self, side: Side) -> usize {
        match side {
            Side::Bid => self.bids.len(),
            Side::Ask => self.asks.len(),
        }
    }

    pub fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    pub fn status(&self) -> BookStatus {
        self.status
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    pub fn last_heard(&self) -> Option<Instant> {
        self.last_heard
    }

    /// Live and heard from within `stale_after` of `now`
    pub fn is_eligible(&self, now: Instant, stale_after: Duration) -> bool {
        self.status == BookStatus::Live
            && self
                .last_heard
                .is_some_and(|t| now.saturating_duration_since(t) <= stale_after)
    }
}
