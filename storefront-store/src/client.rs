//! The access layer's verb set.
//!
//! `StoreClient` ties the pieces together:
//!
//! ```text
//! set / delete / batch ─► sanitize ─► resolve id ─► WriteQueue ─► with_retry ─► backend.commit
//! get                  ─────────────────────────────────────────► with_retry ─► backend.get
//! listen               ─────────────────────────► SubscriptionFanout ─► callback(sorted snapshot)
//! ```
//!
//! Every write goes through one [`WriteQueue`], so writes from all callers of
//! a client are applied in call order, one at a time.

use futures_util::FutureExt;
use std::sync::Arc;

use crate::backend::DocumentBackend;
use crate::config::{ConnectionConfig, StoreSettings};
use crate::connection::{ConnectionHandle, ConnectionManager, Connector, MemoryConnector};
use crate::document::{now_ms, Record, WriteOp, ID_FIELD, UPDATED_AT_FIELD};
use crate::error::{StoreError, StoreResult};
use crate::fanout::{snapshot, SnapshotCallback, Subscription, SubscriptionFanout};
use crate::payload::Payload;
use crate::queue::{FlushHook, QueueStats, WriteQueue};
use crate::retry::RetryPolicy;
use crate::rules::CollectionRules;

/// Outcome of a [`StoreClient::batch_save`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Documents in chunks that committed
    pub committed: usize,
    /// Documents rejected before commit or in chunks that failed
    pub failed: usize,
}

/// Document store access layer.
pub struct StoreClient {
    connections: Arc<ConnectionManager>,
    queue: WriteQueue,
    fanout: SubscriptionFanout,
    rules: Arc<CollectionRules>,
    retry: RetryPolicy,
    settings: StoreSettings,
}

impl StoreClient {
    /// Client with the storefront collection rules and compiled-in defaults.
    pub fn new(connector: Arc<dyn Connector>, settings: StoreSettings) -> Self {
        Self::with_parts(
            Arc::new(ConnectionManager::new(connector)),
            CollectionRules::storefront(),
            settings,
        )
    }

    /// Client over a fresh in-process store.
    pub fn in_memory(settings: StoreSettings) -> Self {
        let connector = Arc::new(MemoryConnector::new(settings.change_capacity));
        Self::new(connector, settings)
    }

    pub fn with_parts(
        connections: Arc<ConnectionManager>,
        rules: CollectionRules,
        settings: StoreSettings,
    ) -> Self {
        let rules = Arc::new(rules);
        let queue = WriteQueue::new(settings.settle_delay(), flush_hook(connections.clone()));

        Self {
            connections,
            queue,
            fanout: SubscriptionFanout::new(rules.clone()),
            rules,
            retry: RetryPolicy::new(settings.max_retries, settings.base_backoff()),
            settings,
        }
    }

    /// Connect with caller-supplied credentials. Only effective before the
    /// first connection is made.
    pub async fn init(&self, config: &ConnectionConfig) -> StoreResult<ConnectionHandle> {
        self.connections.get_connection(Some(config)).await
    }

    /// Write `payload` into `collection`, merging into any existing document.
    ///
    /// Resolves once the write is acknowledged and the settle delay has
    /// passed. Returns the document id.
    pub async fn set_document(
        &self,
        collection: &str,
        payload: impl Into<Payload>,
    ) -> StoreResult<String> {
        let result = self.set_inner(collection, payload.into()).await;
        report(collection, "write", result)
    }

    async fn set_inner(&self, collection: &str, payload: Payload) -> StoreResult<String> {
        let write = self.prepare(collection, payload, now_ms())?;
        let id = write.id().to_string();
        let backend = self.backend().await?;
        self.submit(backend, vec![write]).await?;
        Ok(id)
    }

    /// Delete one document. Deleting a missing document succeeds.
    pub async fn delete_document(&self, collection: &str, id: &str) -> StoreResult<()> {
        let result = async {
            let backend = self.backend().await?;
            let write = WriteOp::Delete {
                collection: collection.to_string(),
                id: id.to_string(),
            };
            self.submit(backend, vec![write]).await
        }
        .await;
        report(collection, "delete", result)
    }

    /// Write `items` in chunks of `batch_chunk_size`, one queue slot per chunk.
    ///
    /// Items without a resolvable id are skipped and counted as failed. A
    /// failing chunk is logged and does not stop the chunks after it.
    pub async fn batch_save(
        &self,
        collection: &str,
        items: impl IntoIterator<Item = Payload>,
    ) -> StoreResult<BatchSummary> {
        let backend = report(collection, "batch", self.backend().await)?;
        let stamp = now_ms();
        let mut summary = BatchSummary::default();

        let mut writes = Vec::new();
        for item in items {
            match self.prepare(collection, item, stamp) {
                Ok(write) => writes.push(write),
                Err(e) => {
                    log::warn!("Skipping batch item: {e}");
                    summary.failed += 1;
                }
            }
        }

        let chunk_size = self.settings.batch_chunk_size.max(1);
        for chunk in writes.chunks(chunk_size) {
            let len = chunk.len();
            match self.submit(backend.clone(), chunk.to_vec()).await {
                Ok(()) => {
                    log::info!("Batch synced {len} items to [{collection}]");
                    summary.committed += len;
                }
                Err(e) => {
                    log::error!("Batch sync failed for [{collection}]: {e}");
                    summary.failed += len;
                }
            }
        }

        Ok(summary)
    }

    /// Fetch one document; `Ok(None)` when it does not exist.
    pub async fn get_document(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        let result = async {
            let backend = self.backend().await?;
            self.retry.run(|| backend.get(collection, id)).await
        }
        .await;
        report(collection, "read", result)
    }

    /// One-shot read of a whole collection, ordered like subscription snapshots.
    pub async fn get_collection(&self, collection: &str) -> StoreResult<Vec<Record>> {
        let result = async {
            let backend = self.backend().await?;
            let rules = self.rules.as_ref();
            self.retry
                .run(|| snapshot(backend.as_ref(), rules, collection))
                .await
        }
        .await;
        report(collection, "read", result)
    }

    /// Names of all non-empty collections.
    pub async fn collection_names(&self) -> StoreResult<Vec<String>> {
        let result = async {
            let backend = self.backend().await?;
            self.retry.run(|| backend.collection_names()).await
        }
        .await;
        report("*", "read", result)
    }

    /// Deliver the full sorted collection to `callback` now and on every change.
    ///
    /// Never fails: when the listener cannot be set up the error is logged and
    /// an inert subscription is returned.
    pub async fn listen_to_collection<F>(&self, collection: &str, callback: F) -> Subscription
    where
        F: Fn(Vec<Record>) + Send + Sync + 'static,
    {
        let backend = match self.backend().await {
            Ok(backend) => backend,
            Err(e) => {
                log::error!("Error setting up listener for [{collection}]: {e}");
                return Subscription::noop(collection);
            }
        };
        let callback: SnapshotCallback = Arc::new(callback);
        self.fanout.subscribe(backend, collection, callback).await
    }

    pub fn rules(&self) -> &CollectionRules {
        &self.rules
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    async fn backend(&self) -> StoreResult<Arc<dyn DocumentBackend>> {
        Ok(self.connections.get_connection(None).await?.backend().clone())
    }

    /// Sanitize, resolve the id and stamp the bookkeeping fields.
    fn prepare(&self, collection: &str, payload: Payload, stamp: u64) -> StoreResult<WriteOp> {
        let mut record = payload.into_record(collection)?;
        let id = self
            .rules
            .resolve_id(collection, &record)
            .ok_or_else(|| StoreError::invalid(collection, "document must have a valid id"))?;

        if !has_truthy_id(&record) {
            record.insert(ID_FIELD.to_string(), id.clone().into());
        }
        record.insert(UPDATED_AT_FIELD.to_string(), stamp.into());

        Ok(WriteOp::Set {
            collection: collection.to_string(),
            id,
            record,
            merge: true,
        })
    }

    /// Commit `writes` in one queue slot, retrying transient failures inside it.
    async fn submit(
        &self,
        backend: Arc<dyn DocumentBackend>,
        writes: Vec<WriteOp>,
    ) -> StoreResult<()> {
        let retry = self.retry;
        self.queue
            .enqueue(move || async move {
                retry
                    .run(|| {
                        let backend = backend.clone();
                        let writes = writes.clone();
                        async move { backend.commit(writes).await }
                    })
                    .await
            })
            .await
    }
}

fn flush_hook(connections: Arc<ConnectionManager>) -> FlushHook {
    Arc::new(move || {
        let connections = connections.clone();
        async move {
            connections
                .get_connection(None)
                .await?
                .backend()
                .wait_for_pending_writes()
                .await
        }
        .boxed()
    })
}

fn has_truthy_id(record: &Record) -> bool {
    match record.get(ID_FIELD) {
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        Some(serde_json::Value::Number(n)) => n.as_f64() != Some(0.0),
        _ => false,
    }
}

/// Log failures with a message naming their kind, then pass them through.
fn report<T>(collection: &str, action: &str, result: StoreResult<T>) -> StoreResult<T> {
    if let Err(e) = &result {
        match e {
            StoreError::Permission(_) => {
                log::error!("Permission denied on {action} [{collection}]: {e}")
            }
            StoreError::Configuration(_) => {
                log::error!("Store not configured for {action} [{collection}]: {e}")
            }
            StoreError::Transient { .. } => {
                log::warn!("Store unavailable for {action} [{collection}]: {e}")
            }
            StoreError::InvalidDocument { .. } => {
                log::warn!("Rejected {action} [{collection}]: {e}")
            }
            _ => log::error!("Error on {action} [{collection}]: {e}"),
        }
    }
    result
}
