//! Per-collection change fan-out.
//!
//! Each collection gets its own tokio broadcast channel, created on first
//! listen. Every listener owns an independent receiver buffering up to
//! `capacity` notices; a listener that falls behind loses notices but not
//! data, because subscribers re-read the collection on every notice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use super::{ChangeNotice, ChangeStream};

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub notices_sent: u64,
    /// Notices published to a collection nobody listens to
    pub notices_unheard: u64,
    pub active_channels: usize,
}

/// Lock-free counters so `publish` never takes the stats path through a lock.
struct AtomicHubStats {
    notices_sent: AtomicU64,
    notices_unheard: AtomicU64,
}

/// Maps collection names to broadcast channels.
pub struct ChangeHub {
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<ChangeNotice>>>>,
    capacity: usize,
    stats: AtomicHubStats,
}

impl ChangeHub {
    /// `capacity` is the per-listener notice buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicHubStats {
                notices_sent: AtomicU64::new(0),
                notices_unheard: AtomicU64::new(0),
            },
        }
    }

    /// Open a receiver for `collection`, creating its channel if needed.
    pub async fn subscribe(&self, collection: &str) -> ChangeStream {
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(collection) {
                return sender.subscribe();
            }
        }

        let mut channels = self.channels.write().await;
        // Another listener may have created it between the two locks.
        channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Announce a change. Returns the number of listeners reached.
    ///
    /// A channel found with no receivers left is dropped.
    pub async fn publish(&self, notice: ChangeNotice) -> usize {
        self.stats.notices_sent.fetch_add(1, Ordering::Relaxed);
        let collection = notice.collection.clone();
        let (reached, orphaned) = {
            let channels = self.channels.read().await;
            match channels.get(&collection) {
                Some(sender) => (sender.send(Arc::new(notice)).unwrap_or(0), true),
                None => (0, false),
            }
        };
        if reached == 0 {
            self.stats.notices_unheard.fetch_add(1, Ordering::Relaxed);
            if orphaned {
                self.release(&collection).await;
            }
        }
        reached
    }

    /// Drop the channel of `collection` if nobody listens to it any more.
    /// Returns whether it was removed.
    pub async fn release(&self, collection: &str) -> bool {
        let mut channels = self.channels.write().await;
        let idle = channels
            .get(collection)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if idle {
            channels.remove(collection);
            log::debug!("Released idle channel [{collection}]");
        }
        idle
    }

    /// Number of live receivers on `collection`.
    pub async fn listener_count(&self, collection: &str) -> usize {
        self.channels
            .read()
            .await
            .get(collection)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Drop channels whose receivers are all gone. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        before - channels.len()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            notices_sent: self.stats.notices_sent.load(Ordering::Relaxed),
            notices_unheard: self.stats.notices_unheard.load(Ordering::Relaxed),
            active_channels: self.channels.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
