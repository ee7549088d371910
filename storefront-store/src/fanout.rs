//! Collection subscription fan-out.
//!
//! Each `subscribe` call opens its own backend listener and spawns a task that
//! republishes the whole collection, sorted by the registry's rule, to the
//! callback: once on start and once per change notice. Listeners are never
//! shared or deduplicated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task;
use uuid::Uuid;

use crate::backend::DocumentBackend;
use crate::document::Record;
use crate::error::StoreResult;
use crate::rules::CollectionRules;

/// Receives the full, ordered collection on every change.
pub type SnapshotCallback = Arc<dyn Fn(Vec<Record>) + Send + Sync>;

/// Handle to a live collection listener.
///
/// Dropping the handle leaves the listener running; call
/// [`Subscription::unsubscribe`] to detach it.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    collection: String,
    active: Arc<AtomicBool>,
    /// Held by the listener task for the duration of each callback.
    delivering: Arc<Mutex<()>>,
    cancel: Arc<Notify>,
    task: Option<task::Id>,
}

impl Subscription {
    /// A subscription that was never attached.
    pub fn noop(collection: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection: collection.to_string(),
            active: Arc::new(AtomicBool::new(false)),
            delivering: Arc::new(Mutex::new(())),
            cancel: Arc::new(Notify::new()),
            task: None,
        }
    }

    /// Detach the listener. Safe to call any number of times, including from
    /// inside the callback; no callback starts after the first call returns,
    /// and a callback running on another thread has finished by then.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.notify_one();
        if self.task.is_some() && task::try_id() != self.task {
            drop(self.delivering.lock());
        }
        log::debug!("Unsubscribed {} from [{}]", self.id, self.collection);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

/// Read `collection` and order it by the registry rule.
pub async fn snapshot(
    backend: &dyn DocumentBackend,
    rules: &CollectionRules,
    collection: &str,
) -> StoreResult<Vec<Record>> {
    let mut docs = backend.list(collection).await?;
    rules.order(collection, &mut docs);
    Ok(docs)
}

/// Opens listeners and drives their snapshot tasks.
pub struct SubscriptionFanout {
    rules: Arc<CollectionRules>,
}

impl SubscriptionFanout {
    pub fn new(rules: Arc<CollectionRules>) -> Self {
        Self { rules }
    }

    /// Start delivering snapshots of `collection` to `callback`.
    ///
    /// Listener setup failures are logged and yield an inert subscription.
    /// When the listener stops, its stream is dropped and the backend is told
    /// to release the collection's channel.
    pub async fn subscribe(
        &self,
        backend: Arc<dyn DocumentBackend>,
        collection: &str,
        callback: SnapshotCallback,
    ) -> Subscription {
        // Listen before the initial read so no change falls in between.
        let mut changes = match backend.listen(collection).await {
            Ok(changes) => changes,
            Err(e) => {
                log::error!("Error setting up listener for [{collection}]: {e}");
                return Subscription::noop(collection);
            }
        };

        let id = Uuid::new_v4();
        let active = Arc::new(AtomicBool::new(true));
        let delivering = Arc::new(Mutex::new(()));
        let cancel = Arc::new(Notify::new());
        let rules = self.rules.clone();
        let name = collection.to_string();
        let (flag, gate, stop) = (active.clone(), delivering.clone(), cancel.clone());

        let handle = tokio::spawn(async move {
            loop {
                match snapshot(backend.as_ref(), &rules, &name).await {
                    Ok(docs) => {
                        let delivered = {
                            let _delivering = gate.lock().unwrap_or_else(PoisonError::into_inner);
                            let live = flag.load(Ordering::SeqCst);
                            if live {
                                callback(docs);
                            }
                            live
                        };
                        if !delivered {
                            break;
                        }
                    }
                    Err(e) => log::error!("Listener error for [{name}]: {e}"),
                }

                tokio::select! {
                    _ = stop.notified() => break,
                    change = changes.recv() => match change {
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            log::debug!("Listener {id} on [{name}] skipped {missed} notices");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            drop(changes);
            backend.release(&name).await;
        });

        log::debug!("Subscribed {id} to [{collection}]");

        Subscription {
            id,
            collection: collection.to_string(),
            active,
            delivering,
            cancel,
            task: Some(handle.id()),
        }
    }
}
