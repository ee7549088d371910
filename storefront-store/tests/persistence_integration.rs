//! Persistence integration tests.
//!
//! Verifies:
//! - Documents written through the client survive a restart
//! - Merge semantics hold on the durable backend
//! - Deletes are durable
//! - Subscribers on a RocksDB store see committed changes
//! - Backups exported from disk restore into a fresh store

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storefront_store::backup;
use storefront_store::{
    ConnectionConfig, Payload, RocksConfig, RocksConnector, StoreClient, StoreSettings,
};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::timeout;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn rocks_client(dir: &Path) -> StoreClient {
    let connector = RocksConnector::with_template(dir, RocksConfig::for_testing(dir));
    StoreClient::new(Arc::new(connector), StoreSettings::for_testing())
}

fn project() -> ConnectionConfig {
    ConnectionConfig::new("integration-key", "shop")
}

/// Drop the client and give its queue worker a chance to release the database.
async fn shutdown(client: StoreClient) {
    drop(client);
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_documents_survive_restart() {
    let dir = tempdir().unwrap();

    let client = rocks_client(dir.path());
    client.init(&project()).await.unwrap();
    client
        .set_document("treatments", json!({"id": "t1", "name": "Implant", "price": 900}))
        .await
        .unwrap();
    client
        .set_document("treatments", json!({"id": "t1", "price": 850}))
        .await
        .unwrap();
    client
        .set_document("ads", json!({"id": "a1", "title": "Spring"}))
        .await
        .unwrap();
    client.delete_document("ads", "a1").await.unwrap();
    shutdown(client).await;

    let client = rocks_client(dir.path());
    client.init(&project()).await.unwrap();
    let doc = client.get_document("treatments", "t1").await.unwrap().unwrap();
    assert_eq!(doc["name"], json!("Implant"));
    assert_eq!(doc["price"], json!(850));
    assert!(client.get_document("ads", "a1").await.unwrap().is_none());
    assert_eq!(client.collection_names().await.unwrap(), vec!["treatments".to_string()]);
}

#[tokio::test]
async fn test_rocks_listener_sees_batches() {
    let dir = tempdir().unwrap();
    let client = rocks_client(dir.path());
    client.init(&project()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = client
        .listen_to_collection("categories", move |docs| {
            let _ = tx.send(docs.len());
        })
        .await;
    assert_eq!(rx.recv().await.unwrap(), 0);

    let items = (0..3).map(|i| Payload::from(json!({"id": format!("c{i}")})));
    let summary = client.batch_save("categories", items).await.unwrap();
    assert_eq!(summary.committed, 3);

    let mut seen = 0;
    while seen < 3 {
        seen = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    }
    sub.unsubscribe();
}

#[tokio::test]
async fn test_backup_round_trip_between_stores() {
    let source_dir = tempdir().unwrap();
    let target_dir = tempdir().unwrap();

    let source = rocks_client(source_dir.path());
    source.init(&project()).await.unwrap();
    source
        .set_document("site_config", json!({"heroTitle": "Smile"}))
        .await
        .unwrap();
    source
        .set_document("orders", json!({"id": "o1", "total": 120}))
        .await
        .unwrap();
    let exported = backup::export_all(&source).await.unwrap();
    shutdown(source).await;

    let target = rocks_client(target_dir.path());
    target.init(&project()).await.unwrap();
    let report = backup::restore(&target, &exported).await;
    assert_eq!(report.total_migrated, 2);
    assert_eq!(report.errors, 0);

    let hero = target.get_document("site_config", "hero_config").await.unwrap().unwrap();
    assert_eq!(hero["heroTitle"], json!("Smile"));
}
