//! In-process backend.
//!
//! Holds every collection in memory behind one tokio `RwLock`, so a commit is
//! atomic with respect to readers. Also serves as the emulator for tests:
//! failures can be queued ahead of the next commits.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

use super::{touched_collections, ChangeHub, ChangeNotice, ChangeStream, DocumentBackend};
use crate::document::{merge_into, Record, WriteOp};
use crate::error::{StoreError, StoreResult};

/// In-memory document store.
pub struct MemoryBackend {
    collections: RwLock<BTreeMap<String, BTreeMap<String, Record>>>,
    hub: ChangeHub,
    sequence: AtomicU64,
    commits: AtomicU64,
    injected: Mutex<VecDeque<StoreError>>,
}

impl MemoryBackend {
    pub fn new(change_capacity: usize) -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
            hub: ChangeHub::new(change_capacity),
            sequence: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            injected: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the next `errors.len()` commits fail, in order, without applying.
    pub async fn fail_next_commits(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.injected.lock().await.extend(errors);
    }

    /// Number of commits applied so far.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of documents in `collection`.
    pub async fn document_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn hub(&self) -> &ChangeHub {
        &self.hub
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<Record>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> StoreResult<()> {
        if let Some(err) = self.injected.lock().await.pop_front() {
            return Err(err);
        }

        let touched = touched_collections(&writes);
        {
            let mut collections = self.collections.write().await;
            for op in writes {
                match op {
                    WriteOp::Set { collection, id, record, merge } => {
                        let docs = collections.entry(collection).or_default();
                        if merge {
                            if let Some(existing) = docs.get_mut(&id) {
                                merge_into(existing, record);
                                continue;
                            }
                        }
                        docs.insert(id, record);
                    }
                    WriteOp::Delete { collection, id } => {
                        if let Some(docs) = collections.get_mut(&collection) {
                            docs.remove(&id);
                            if docs.is_empty() {
                                collections.remove(&collection);
                            }
                        }
                    }
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);

        for (collection, ids) in touched {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
            self.hub
                .publish(ChangeNotice { collection, ids, sequence })
                .await;
        }
        Ok(())
    }

    async fn wait_for_pending_writes(&self) -> StoreResult<()> {
        // Commits are applied before they are acknowledged.
        Ok(())
    }

    async fn listen(&self, collection: &str) -> StoreResult<ChangeStream> {
        Ok(self.hub.subscribe(collection).await)
    }

    async fn release(&self, collection: &str) {
        self.hub.release(collection).await;
    }

    async fn collection_names(&self) -> StoreResult<Vec<String>> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }
}
