//! RocksDB-backed durable backend.
//!
//! Column families:
//! - `documents`: JSON document bodies (LZ4 compressed), keyed `<collection>\x1f<id>`
//! - `metadata`: per-document bookkeeping (bincode), same key
//!
//! Keys sort by collection first, so listing a collection is a forward scan
//! from its prefix. Commits go through a single `WriteBatch` and are announced
//! on the backend's [`ChangeHub`] once written.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{touched_collections, ChangeHub, ChangeNotice, ChangeStream, DocumentBackend};
use crate::document::{merge_into, now_ms, Record, WriteOp};
use crate::error::{StoreError, StoreResult};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Separates collection and id inside a key.
const KEY_SEPARATOR: u8 = 0x1f;

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every commit (default: false, `wait_for_pending_writes` syncs the WAL)
    pub sync_writes: bool,
    /// Max open files (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Per-listener change notice buffer
    pub change_capacity: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("storefront_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
            change_capacity: 256,
        }
    }
}

impl RocksConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            ..Self::default()
        }
    }
}

/// Bookkeeping stored next to each document body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub collection: String,
    pub id: String,
    /// Incremented on every write to the document
    pub version: u64,
    /// Uncompressed JSON size in bytes
    pub body_size: u64,
    /// Compressed size in bytes
    pub compressed_size: u64,
    /// First write (ms since epoch)
    pub created_at: u64,
    /// Last write (ms since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(collection: &str, id: &str) -> Self {
        let now = now_ms();
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            version: 0,
            body_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable document store.
pub struct RocksBackend {
    /// Single-threaded column family mode; concurrency comes from tokio
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
    hub: ChangeHub,
    sequence: AtomicU64,
}

impl RocksBackend {
    /// Open (or create) the database at `config.path`.
    pub fn open(config: RocksConfig) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            hub: ChangeHub::new(config.change_capacity),
            db,
            config,
            sequence: AtomicU64::new(0),
        })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Bodies are already LZ4 compressed by us.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }

        opts
    }

    /// Metadata for one document, if it exists.
    pub fn load_metadata(&self, collection: &str, id: &str) -> StoreResult<Option<DocumentMetadata>> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_key(collection, id)?)? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn hub(&self) -> &ChangeHub {
        &self.hub
    }

    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn read_body(&self, key: &[u8]) -> StoreResult<Option<Record>> {
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db.get_cf(cf, key)?.map(|bytes| decode_body(&bytes)).transpose()
    }

    fn read_meta(&self, key: &[u8]) -> StoreResult<Option<DocumentMetadata>> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, key)?
            .map(|bytes| DocumentMetadata::decode(&bytes))
            .transpose()
    }
}

#[async_trait]
impl DocumentBackend for RocksBackend {
    fn name(&self) -> &str {
        "rocksdb"
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        self.read_body(&doc_key(collection, id)?)
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<Record>> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let prefix = collection_prefix(collection)?;

        let mut docs = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            docs.push(decode_body(&value)?);
        }
        Ok(docs)
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> StoreResult<()> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let touched = touched_collections(&writes);

        // Later ops in the same commit must see earlier ones.
        let mut staged: HashMap<Vec<u8>, Option<(Record, DocumentMetadata)>> = HashMap::new();

        for op in writes {
            match op {
                WriteOp::Set { collection, id, record, merge } => {
                    let key = doc_key(&collection, &id)?;
                    let previous = match staged.remove(&key) {
                        Some(prev) => prev,
                        None => match (self.read_body(&key)?, self.read_meta(&key)?) {
                            (Some(body), Some(meta)) => Some((body, meta)),
                            (Some(body), None) => {
                                Some((body, DocumentMetadata::new(&collection, &id)))
                            }
                            _ => None,
                        },
                    };
                    let (body, mut meta) = match previous {
                        Some((mut body, meta)) if merge => {
                            merge_into(&mut body, record);
                            (body, meta)
                        }
                        Some((_, meta)) => (record, meta),
                        None => (record, DocumentMetadata::new(&collection, &id)),
                    };
                    meta.version += 1;
                    meta.updated_at = now_ms();
                    staged.insert(key, Some((body, meta)));
                }
                WriteOp::Delete { collection, id } => {
                    staged.insert(doc_key(&collection, &id)?, None);
                }
            }
        }

        let mut batch = WriteBatch::default();
        for (key, entry) in staged {
            match entry {
                Some((body, mut meta)) => {
                    let raw = serde_json::to_vec(&body)?;
                    let compressed = lz4_flex::compress_prepend_size(&raw);
                    meta.body_size = raw.len() as u64;
                    meta.compressed_size = compressed.len() as u64;
                    batch.put_cf(cf_docs, &key, &compressed);
                    batch.put_cf(cf_meta, &key, meta.encode()?);
                }
                None => {
                    batch.delete_cf(cf_docs, &key);
                    batch.delete_cf(cf_meta, &key);
                }
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        for (collection, ids) in touched {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
            self.hub
                .publish(ChangeNotice { collection, ids, sequence })
                .await;
        }
        Ok(())
    }

    async fn wait_for_pending_writes(&self) -> StoreResult<()> {
        self.db.flush_wal(true)?;
        Ok(())
    }

    async fn listen(&self, collection: &str) -> StoreResult<ChangeStream> {
        collection_prefix(collection)?;
        Ok(self.hub.subscribe(collection).await)
    }

    async fn release(&self, collection: &str) {
        self.hub.release(collection).await;
    }

    async fn collection_names(&self) -> StoreResult<Vec<String>> {
        let cf = self.cf(CF_METADATA)?;
        let mut names: Vec<String> = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let Some(split) = key.iter().position(|b| *b == KEY_SEPARATOR) else {
                continue;
            };
            let name = String::from_utf8_lossy(&key[..split]).into_owned();
            if names.last() != Some(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

// ─── Keys & bodies ────────────────────────────────────────────────────

fn collection_prefix(collection: &str) -> StoreResult<Vec<u8>> {
    if collection.is_empty() || collection.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(StoreError::invalid(collection, "invalid collection name"));
    }
    let mut prefix = Vec::with_capacity(collection.len() + 1);
    prefix.extend_from_slice(collection.as_bytes());
    prefix.push(KEY_SEPARATOR);
    Ok(prefix)
}

fn doc_key(collection: &str, id: &str) -> StoreResult<Vec<u8>> {
    if id.is_empty() || id.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(StoreError::invalid(collection, format!("invalid document id {id:?}")));
    }
    let mut key = collection_prefix(collection)?;
    key.extend_from_slice(id.as_bytes());
    Ok(key)
}

fn decode_body(bytes: &[u8]) -> StoreResult<Record> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    Ok(serde_json::from_slice(&raw)?)
}
