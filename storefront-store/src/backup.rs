//! Bulk export and restore through the regular verb set.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::client::StoreClient;
use crate::document::now_ms;
use crate::error::StoreResult;
use crate::payload::Payload;

pub const BACKUP_VERSION: u32 = 1;

/// Snapshot of several collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// 0 for files that carry only `data`
    #[serde(default)]
    pub version: u32,
    /// ms since epoch
    #[serde(default)]
    pub created_at: u64,
    /// Collection name → array of documents
    pub data: BTreeMap<String, Value>,
}

impl Backup {
    pub fn from_json(json: &str) -> StoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> StoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Total number of documents across collections.
    pub fn document_count(&self) -> usize {
        self.data
            .values()
            .filter_map(Value::as_array)
            .map(Vec::len)
            .sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub total_migrated: usize,
    pub errors: usize,
}

/// Export `collections`, each ordered like its subscription snapshots.
pub async fn export(client: &StoreClient, collections: &[String]) -> StoreResult<Backup> {
    let mut data = BTreeMap::new();
    for name in collections {
        let docs = client.get_collection(name).await?;
        log::info!("Exported {} documents from [{name}]", docs.len());
        data.insert(
            name.clone(),
            Value::Array(docs.into_iter().map(Value::Object).collect()),
        );
    }
    Ok(Backup {
        version: BACKUP_VERSION,
        created_at: now_ms(),
        data,
    })
}

/// Export every non-empty collection.
pub async fn export_all(client: &StoreClient) -> StoreResult<Backup> {
    let names = client.collection_names().await?;
    export(client, &names).await
}

/// Write every collection of `backup` through `batch_save`.
///
/// Entries that are not arrays, or are empty, are skipped. A collection whose
/// batch cannot start counts all of its documents as errors.
pub async fn restore(client: &StoreClient, backup: &Backup) -> MigrationReport {
    log::info!("Starting restore of {} collections", backup.data.len());
    let mut report = MigrationReport::default();

    for (name, entry) in &backup.data {
        let items = match entry.as_array() {
            Some(items) if !items.is_empty() => items,
            Some(_) => continue,
            None => {
                log::warn!("Skipping [{name}]: not an array");
                continue;
            }
        };

        log::info!("Migrating {} items into [{name}]", items.len());
        let payloads = items.iter().cloned().map(Payload::from);
        match client.batch_save(name, payloads).await {
            Ok(summary) => {
                report.total_migrated += summary.committed;
                report.errors += summary.failed;
            }
            Err(e) => {
                log::error!("Error migrating [{name}]: {e}");
                report.errors += items.len();
            }
        }
    }

    log::info!(
        "Restore finished: {} migrated, {} errors",
        report.total_migrated,
        report.errors
    );
    report
}
