//! Publisher module for snapshot fan-out
//!
//! Every subscriber reads the same latest-value slot with its own cursor.
//! Publishing overwrites the slot and never waits on anyone; a subscriber
//! that falls behind simply sees the newest snapshot on its next poll.

use futures_util::Stream;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::aggregator::Snapshot;

/// Broadcasts merged snapshots to any number of subscribers
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: Arc<watch::Sender<Arc<Snapshot>>>,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher {
    /// Create a publisher holding an empty snapshot
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Snapshot::default()));
        Self { tx: Arc::new(tx) }
    }

    /// Replace the current snapshot.
    ///
    /// Returns false, and wakes nobody, when it equals the current one.
    pub fn publish(&self, snapshot: Snapshot) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if **current == snapshot {
                false
            } else {
                *current = Arc::new(snapshot);
                true
            }
        });

        if changed {
            debug!(subscribers = self.tx.receiver_count(), "Published snapshot");
        }
        changed
    }

    /// The latest snapshot
    pub fn current(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    /// Start a subscription whose first item is the current snapshot
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            primed: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One subscriber's view of the snapshot stream
#[derive(Debug)]
pub struct Subscription {
    rx: watch::Receiver<Arc<Snapshot>>,
    primed: bool,
}

impl Subscription {
    /// Next snapshot to deliver.
    ///
    /// The first call returns immediately with the current snapshot; later
    /// calls wait for a newer one, skipping any published in between. `None`
    /// once the publisher is gone.
    pub async fn next(&mut self) -> Option<Arc<Snapshot>> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }

        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Stop receiving snapshots
    pub fn unsubscribe(self) {}

    /// Adapt into a `Stream` of snapshots
    pub fn into_stream(self) -> impl Stream<Item = Arc<Snapshot>> + Send + 'static {
        self.into_stream_with(())
    }

    /// Like [`Subscription::into_stream`], keeping `held` alive until the
    /// stream is dropped.
    pub fn into_stream_with<T: Send + 'static>(
        self,
        held: T,
    ) -> impl Stream<Item = Arc<Snapshot>> + Send + 'static {
        futures_util::stream::unfold((self, held), |(mut sub, held)| async move {
            let snapshot = sub.next().await?;
            Some((snapshot, (sub, held)))
        })
    }
}
