//! # storefront-store: Document store access layer for the storefront
//!
//! A narrow verb set over a document store that paces writes, retries
//! transient failures and republishes whole, ordered collections to
//! subscribers.
//!
//! ## Architecture
//!
//! ```text
//!   callers (storefront, admin panel, bot, CLI)
//!        │ set / delete / batch / get / listen
//!        ▼
//! ┌──────────────┐   one slot at a time   ┌──────────────┐
//! │ StoreClient  │ ─────────────────────► │ WriteQueue   │──► with_retry ──┐
//! └──────┬───────┘                        └──────────────┘                 │
//!        │ get_connection                                                   ▼
//! ┌──────┴────────────┐   initialize once  ┌─────────────────────────────────┐
//! │ ConnectionManager │ ─────────────────► │ dyn DocumentBackend             │
//! └───────────────────┘                    │  (MemoryBackend / RocksBackend) │
//!                                          └───────────────┬─────────────────┘
//!                                                          │ ChangeNotice
//!                                          ┌───────────────┴─────────────────┐
//!                                          │ SubscriptionFanout → callbacks  │
//!                                          └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: lazily created, frozen connection handle
//! - [`queue`]: FIFO write serializer with settle delay
//! - [`retry`]: exponential backoff with a quota penalty
//! - [`fanout`]: per-call collection listeners delivering sorted snapshots
//! - [`client`]: the verb set (`set_document`, `batch_save`, ...)
//! - [`payload`]: caller payloads and the sanitizer
//! - [`rules`]: per-collection sort and id rules
//! - [`backend`]: store implementations and change notification
//! - [`media`], [`chat`], [`backup`]: features built on the verb set
//!
//! ## Defaults
//!
//! | Setting | Value |
//! |---------|-------|
//! | Settle delay after each write | 300ms |
//! | Retry budget | 5 retries |
//! | First backoff step | 2000ms (×5 on quota errors) |
//! | Batch chunk | 2 documents |

pub mod backend;
pub mod backup;
pub mod chat;
pub mod client;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod fanout;
pub mod media;
pub mod payload;
pub mod queue;
pub mod ratelimit;
pub mod retry;
pub mod rules;

// Re-exports for convenience
pub use backend::{
    ChangeHub, ChangeNotice, ChangeStream, DocumentBackend, DocumentMetadata, HubStats,
    MemoryBackend, RocksBackend, RocksConfig,
};
pub use backup::{Backup, MigrationReport};
pub use chat::{Attachment, ChatMessage, ChatService, ChatSession, MediaKind, Sender};
pub use client::{BatchSummary, StoreClient};
pub use config::{ConnectionConfig, StoreSettings};
pub use connection::{
    ConnectionHandle, ConnectionManager, Connector, MemoryConnector, RocksConnector,
};
pub use document::{Record, WriteOp};
pub use error::{ErrorClass, StoreError, StoreResult};
pub use fanout::{SnapshotCallback, Subscription, SubscriptionFanout};
pub use media::{
    FallbackPolicy, InlineFallback, MediaAsset, MediaUploader, MemoryObjectStore, NoFallback,
    ObjectStore,
};
pub use payload::{Payload, SharedPayload};
pub use queue::{QueueStats, WriteQueue};
pub use ratelimit::RateLimiter;
pub use retry::{with_retry, RetryPolicy};
pub use rules::{CollectionRules, IdRule, SortRule};
