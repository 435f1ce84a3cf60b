//! Book registry
//!
//! Owns one shared book per exchange. Feeds mutate their own book through a
//! [`BookHandle`]; the aggregator only reads through the registry. Each
//! mutation happens under that book's write lock, so a reader never sees a
//! half-applied update, and no lock is ever held on two books at once.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};
use tracing::info;

use super::{ApplyOutcome, BookStatus, BookUpdate, ExchangeBook, ExchangeId, Level, Sequencing, Side};
use crate::error::Result;

/// Best-first levels copied out of one live book
#[derive(Debug, Clone, PartialEq)]
pub struct BookView {
    pub exchange: ExchangeId,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// Registry of per-exchange books
#[derive(Debug, Default)]
pub struct BookRegistry {
    /// Sorted by exchange priority
    books: Vec<(ExchangeId, Arc<RwLock<ExchangeBook>>)>,
    changed: Arc<Notify>,
}

impl BookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a book for `exchange`, or hand out another handle to the
    /// existing one.
    pub fn register(&mut self, exchange: ExchangeId, sequencing: Sequencing, max_depth: usize) -> BookHandle {
        let book = match self.books.binary_search_by_key(&exchange, |(id, _)| *id) {
            Ok(idx) => self.books[idx].1.clone(),
            Err(idx) => {
                let book = Arc::new(RwLock::new(ExchangeBook::new(exchange, sequencing, max_depth)));
                self.books.insert(idx, (exchange, book.clone()));
                info!(exchange = %exchange, max_depth, "Registered order book");
                book
            }
        };

        BookHandle {
            exchange,
            book,
            changed: self.changed.clone(),
        }
    }

    /// Registered exchanges in priority order
    pub fn exchanges(&self) -> Vec<ExchangeId> {
        self.books.iter().map(|(id, _)| *id).collect()
    }

    /// Signalled after every accepted mutation. Holds at most one pending
    /// permit, so bursts of mutations collapse into one wake-up.
    pub fn changed(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    /// Top `depth` levels of every book eligible for aggregation, in
    /// exchange priority order.
    pub async fn live_views(&self, depth: usize, stale_after: Duration) -> Vec<BookView> {
        let now = Instant::now();
        let mut views = Vec::with_capacity(self.books.len());

        for (exchange, book) in &self.books {
            let book = book.read().await;
            if book.is_eligible(now, stale_after) {
                views.push(BookView {
                    exchange: *exchange,
                    bids: book.best_levels(Side::Bid, depth),
                    asks: book.best_levels(Side::Ask, depth),
                });
            }
        }

        views
    }

    /// Status of every registered book
    pub async fn statuses(&self) -> Vec<(ExchangeId, BookStatus)> {
        let mut out = Vec::with_capacity(self.books.len());
        for (exchange, book) in &self.books {
            out.push((*exchange, book.read().await.status()));
        }
        out
    }
}

/// Write access to a single exchange's book
#[derive(Debug, Clone)]
pub struct BookHandle {
    exchange: ExchangeId,
    book: Arc<RwLock<ExchangeBook>>,
    changed: Arc<Notify>,
}

impl BookHandle {
    pub fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    /// Apply a normalized update atomically and wake the aggregator if the
    /// book changed or dropped out of aggregation.
    pub async fn apply(&self, update: &BookUpdate) -> Result<ApplyOutcome> {
        let result = self.book.write().await.apply(update);
        match &result {
            Ok(ApplyOutcome::Applied) | Err(_) => self.changed.notify_one(),
            Ok(ApplyOutcome::Buffered | ApplyOutcome::Skipped) => {}
        }
        result
    }

    /// Apply one level change without a sequence check
    pub async fn apply_delta(&self, side: Side, price: Decimal, quantity: Decimal) -> Result<()> {
        self.book.write().await.apply_delta(side, price, quantity)?;
        self.changed.notify_one();
        Ok(())
    }

    /// Connection-health signal from the feed
    pub async fn set_connected(&self, connected: bool) {
        {
            let mut book = self.book.write().await;
            if connected {
                book.connect();
            } else {
                book.disconnect();
            }
        }
        info!(exchange = %self.exchange, connected, "Connection state changed");
        self.changed.notify_one();
    }

    /// The connection is alive: a frame, ping or pong arrived. Keeps a
    /// quiet but healthy book in the merge without changing its levels.
    pub async fn touch(&self) {
        self.book.write().await.touch();
    }

    /// Pull the book out of aggregation until the next snapshot
    pub async fn mark_stale(&self) {
        self.book.write().await.mark_stale();
        self.changed.notify_one();
    }

    pub async fn status(&self) -> BookStatus {
        self.book.read().await.status()
    }

    pub async fn last_sequence(&self) -> u64 {
        self.book.read().await.last_sequence()
    }
}
