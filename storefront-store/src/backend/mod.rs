//! Document store backends.
//!
//! ```text
//! ┌──────────────┐  commit / get / list   ┌────────────────────┐
//! │ StoreClient  │ ─────────────────────► │ dyn DocumentBackend│
//! │ (access      │                        │  MemoryBackend     │
//! │  layer)      │ ◄───────────────────── │  RocksBackend      │
//! └──────────────┘    ChangeNotice        └─────────┬──────────┘
//!                                                   │
//!                                             ┌─────┴─────┐
//!                                             │ ChangeHub │
//!                                             │ (fan-out) │
//!                                             └───────────┘
//! ```
//!
//! A backend is the remote side of the access layer: it owns the documents,
//! applies commits atomically and announces every committed change on a
//! per-collection channel. Listeners receive notices only; they re-read the
//! collection to build a snapshot.

pub mod hub;
pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::document::{Record, WriteOp};
use crate::error::StoreResult;

pub use hub::{ChangeHub, HubStats};
pub use memory::MemoryBackend;
pub use rocks::{DocumentMetadata, RocksBackend, RocksConfig};

/// Announcement that a commit touched a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub collection: String,
    /// Ids written or deleted by the commit
    pub ids: Vec<String>,
    /// Backend-wide commit sequence number
    pub sequence: u64,
}

/// Receiver side of a collection listener.
pub type ChangeStream = broadcast::Receiver<Arc<ChangeNotice>>;

/// A document store with live change notification.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Fetch one document; `None` when absent.
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>>;

    /// Every document of a collection, in storage order.
    async fn list(&self, collection: &str) -> StoreResult<Vec<Record>>;

    /// Apply `writes` atomically and announce them to listeners.
    async fn commit(&self, writes: Vec<WriteOp>) -> StoreResult<()>;

    /// Resolve once every acknowledged write is durable.
    async fn wait_for_pending_writes(&self) -> StoreResult<()>;

    /// Open a change listener for `collection`.
    async fn listen(&self, collection: &str) -> StoreResult<ChangeStream>;

    /// Called after a listener on `collection` has dropped its stream, so the
    /// backend can free per-collection state nobody uses any more.
    async fn release(&self, _collection: &str) {}

    /// Names of collections holding at least one document.
    async fn collection_names(&self) -> StoreResult<Vec<String>>;
}

/// Group the ids touched by `writes` per collection, in first-seen order.
pub(crate) fn touched_collections(writes: &[WriteOp]) -> Vec<(String, Vec<String>)> {
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for op in writes {
        match grouped.iter_mut().find(|(c, _)| c == op.collection()) {
            Some((_, ids)) => ids.push(op.id().to_string()),
            None => grouped.push((op.collection().to_string(), vec![op.id().to_string()])),
        }
    }
    grouped
}
