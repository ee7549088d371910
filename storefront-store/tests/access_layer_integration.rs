//! Access layer integration tests.
//!
//! Verifies:
//! - Writes from concurrent callers run one at a time in call order
//! - A failing write does not stall the writes queued behind it
//! - Batches are chunked and committed sequentially
//! - Subscribers get sorted snapshots and unsubscribe is idempotent
//! - Every verb shares one connection
//! - Unsupported payload values are sanitized, not rejected

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storefront_store::backend::{ChangeStream, DocumentBackend, MemoryBackend};
use storefront_store::{
    ConnectionConfig, ConnectionManager, CollectionRules, MemoryConnector, Payload, Record,
    StoreClient, StoreError, StoreResult, StoreSettings, WriteOp,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Wraps a `MemoryBackend`, recording commit sizes and detecting overlap.
struct RecordingBackend {
    inner: MemoryBackend,
    commits: Mutex<Vec<Vec<String>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    commit_delay: Duration,
}

impl RecordingBackend {
    fn new(commit_delay: Duration) -> Self {
        Self {
            inner: MemoryBackend::default(),
            commits: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            commit_delay,
        }
    }

    fn committed_ids(&self) -> Vec<Vec<String>> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        self.inner.get(collection, id).await
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<Record>> {
        self.inner.list(collection).await
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> StoreResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.commit_delay).await;

        let ids = writes.iter().map(|w| w.id().to_string()).collect();
        let result = self.inner.commit(writes).await;
        if result.is_ok() {
            self.commits.lock().unwrap().push(ids);
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn wait_for_pending_writes(&self) -> StoreResult<()> {
        self.inner.wait_for_pending_writes().await
    }

    async fn listen(&self, collection: &str) -> StoreResult<ChangeStream> {
        self.inner.listen(collection).await
    }

    async fn collection_names(&self) -> StoreResult<Vec<String>> {
        self.inner.collection_names().await
    }
}

fn client_over(backend: Arc<dyn DocumentBackend>, settings: StoreSettings) -> StoreClient {
    StoreClient::new(Arc::new(MemoryConnector::with_backend(backend)), settings)
}

fn ids(docs: &[Record]) -> Vec<String> {
    docs.iter()
        .map(|d| d["id"].as_str().unwrap_or_default().to_string())
        .collect()
}

// ─── Write Serializer ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_writes_applied_in_call_order() {
    let backend = Arc::new(RecordingBackend::new(Duration::from_millis(5)));
    let client = Arc::new(client_over(backend.clone(), StoreSettings::for_testing()));
    client.get_document("orders", "warm-up").await.unwrap();

    // Issue all writes without awaiting in between.
    let pending: Vec<_> = (0..6)
        .map(|i| {
            let client = client.clone();
            async move {
                client
                    .set_document("orders", json!({"id": format!("o{i}"), "seq": i}))
                    .await
            }
        })
        .collect();
    let results = futures_util::future::join_all(pending).await;
    assert!(results.iter().all(Result::is_ok));

    let order: Vec<String> = backend.committed_ids().into_iter().flatten().collect();
    assert_eq!(order, vec!["o0", "o1", "o2", "o3", "o4", "o5"]);
    assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_write_does_not_block_queue() {
    let backend = Arc::new(MemoryBackend::default());
    let client = client_over(backend.clone(), StoreSettings::for_testing());

    client.set_document("ads", json!({"id": "1"})).await.unwrap();
    backend
        .fail_next_commits([StoreError::Permission("missing or insufficient permissions".into())])
        .await;
    let err = client.set_document("ads", json!({"id": "2"})).await.unwrap_err();
    assert!(matches!(err, StoreError::Permission(_)));
    client.set_document("ads", json!({"id": "3"})).await.unwrap();

    let docs = client.get_collection("ads").await.unwrap();
    assert_eq!(ids(&docs), vec!["3", "1"]);
    let stats = client.queue_stats();
    assert_eq!((stats.completed, stats.failed), (2, 1));
}

#[tokio::test]
async fn test_exhausted_retries_surface_transient_error() {
    let backend = Arc::new(MemoryBackend::default());
    backend
        .fail_next_commits((0..3).map(|_| StoreError::unavailable("Service firestore is not available")))
        .await;
    let settings = StoreSettings {
        max_retries: 2,
        ..StoreSettings::for_testing()
    };
    let client = client_over(backend.clone(), settings);

    let err = client.set_document("ads", json!({"id": "1"})).await.unwrap_err();
    assert!(matches!(err, StoreError::Transient { .. }));
    assert_eq!(backend.commit_count(), 0);

    // The queue is still usable.
    client.set_document("ads", json!({"id": "1"})).await.unwrap();
    assert_eq!(backend.commit_count(), 1);
}

// ─── Batches ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_batch_of_five_commits_two_two_one() {
    let backend = Arc::new(RecordingBackend::new(Duration::from_millis(2)));
    let client = client_over(backend.clone(), StoreSettings::for_testing());

    let items = (1..=5).map(|i| Payload::from(json!({"id": format!("c{i}")})));
    let summary = client.batch_save("categories", items).await.unwrap();
    assert_eq!(summary.committed, 5);
    assert_eq!(summary.failed, 0);

    let sizes: Vec<usize> = backend.committed_ids().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_batch_chunk_size_tunable() {
    let backend = Arc::new(RecordingBackend::new(Duration::ZERO));
    let settings = StoreSettings {
        batch_chunk_size: 450,
        ..StoreSettings::for_testing()
    };
    let client = client_over(backend.clone(), settings);

    let items = (0..1000).map(|i| Payload::from(json!({"id": i})));
    client.batch_save("analytics", items).await.unwrap();

    let sizes: Vec<usize> = backend.committed_ids().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![450, 450, 100]);
}

// ─── Subscriptions ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_listener_receives_sorted_snapshots() {
    let client = StoreClient::in_memory(StoreSettings::for_testing());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = client
        .listen_to_collection("sessions", move |docs| {
            let _ = tx.send(docs);
        })
        .await;
    assert!(rx.recv().await.unwrap().is_empty());

    client
        .set_document("sessions", json!({"id": "a", "lastActive": 100}))
        .await
        .unwrap();
    client
        .set_document("sessions", json!({"id": "b", "lastActive": 300}))
        .await
        .unwrap();
    client
        .set_document("sessions", json!({"id": "c", "lastMessageTime": 200}))
        .await
        .unwrap();

    let mut latest = Vec::new();
    while latest.len() < 3 {
        latest = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    }
    assert_eq!(ids(&latest), vec!["b", "c", "a"]);
    sub.unsubscribe();
}

#[tokio::test]
async fn test_unsubscribe_twice_stops_callbacks() {
    let client = StoreClient::in_memory(StoreSettings::for_testing());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let sub = client
        .listen_to_collection("treatments", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    // Wait for the initial snapshot.
    timeout(Duration::from_secs(1), async {
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    sub.unsubscribe();
    sub.unsubscribe();
    let after = calls.load(Ordering::SeqCst);

    client.set_document("treatments", json!({"id": "t1"})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn test_newest_first_content_ordering() {
    let client = StoreClient::in_memory(StoreSettings::for_testing());
    for (id, created) in [("t1", 10), ("t2", 30), ("t3", 20)] {
        client
            .set_document("treatments", json!({"id": id, "createdAt": created}))
            .await
            .unwrap();
    }
    // Editing must not move the document.
    client
        .set_document("treatments", json!({"id": "t1", "name": "edited"}))
        .await
        .unwrap();

    let docs = client.get_collection("treatments").await.unwrap();
    assert_eq!(ids(&docs), vec!["t2", "t3", "t1"]);
}

#[tokio::test]
async fn test_unsubscribed_chat_channels_are_released() {
    let backend = Arc::new(MemoryBackend::default());
    let client = client_over(backend.clone(), StoreSettings::for_testing());

    for i in 0..100 {
        let sub = client
            .listen_to_collection(&format!("chat_s{i}"), |_| {})
            .await;
        sub.unsubscribe();
    }

    timeout(Duration::from_secs(2), async {
        while backend.hub().stats().await.active_channels > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

// ─── Connection ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_verbs_share_one_connection() {
    let manager = Arc::new(ConnectionManager::new(Arc::new(MemoryConnector::default())));
    let client = StoreClient::with_parts(
        manager.clone(),
        CollectionRules::storefront(),
        StoreSettings::for_testing(),
    );

    let first = client
        .init(&ConnectionConfig::new("caller-key-123", "shop-a"))
        .await
        .unwrap();
    client.set_document("ads", json!({"id": "1"})).await.unwrap();
    client.get_document("ads", "1").await.unwrap();
    let later = manager
        .get_connection(Some(&ConnectionConfig::new("another-key-456", "shop-b")))
        .await
        .unwrap();

    assert_eq!(first.id(), later.id());
    assert_eq!(later.config().project_id, "shop-a");
}

#[tokio::test]
async fn test_short_key_then_valid_key_share_default_handle() {
    let manager = ConnectionManager::with_defaults(
        Arc::new(MemoryConnector::default()),
        ConnectionConfig::new("default-key-0001", "defaults-project"),
    );

    let first = manager
        .get_connection(Some(&ConnectionConfig::new("short", "short-project")))
        .await
        .unwrap();
    let second = manager
        .get_connection(Some(&ConnectionConfig::new("a-valid-long-key", "valid-project")))
        .await
        .unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(first.config().project_id, "defaults-project");
    assert_eq!(second.config().api_key, "default-key-0001");
}

// ─── Sanitization ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unsupported_values_stored_as_null() {
    let client = StoreClient::in_memory(StoreSettings::for_testing());

    let mut product = Payload::shared(
        Payload::object()
            .with("id", "p1")
            .with("discount", Payload::Undefined)
            .with("onSelect", Payload::Function("onSelect".into())),
    );
    let back_edge = product.clone();
    product.insert("parent", back_edge);

    client.set_document("treatments", product).await.unwrap();

    let stored = client.get_document("treatments", "p1").await.unwrap().unwrap();
    assert_eq!(stored["discount"], Value::Null);
    assert_eq!(stored["parent"], Value::Null);
    assert!(stored.get("onSelect").is_none());
}
