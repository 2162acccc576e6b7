//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents`: row metadata (bincode: room, clock, sizes, timestamps)
//! - `contents`: merged document state (LZ4 compressed), absent until the
//!   first compaction
//!
//! Both are keyed by the 16-byte document UUID and written in one batch.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{unix_now, DurableSnapshot, SnapshotStore, StoreError, StoreResult};

const CF_DOCUMENTS: &str = "documents";
const CF_CONTENTS: &str = "contents";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_CONTENTS];

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    #[serde(default = "default_block_cache_size")]
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    #[serde(default = "default_bloom_filter_bits")]
    pub bloom_filter_bits: i32,
    /// fsync every snapshot write (default: true)
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    #[serde(default = "default_max_open_files")]
    pub max_open_files: i32,
}

fn default_block_cache_size() -> usize {
    64 * 1024 * 1024
}

fn default_bloom_filter_bits() -> i32 {
    10
}

fn default_sync_writes() -> bool {
    true
}

fn default_max_open_files() -> i32 {
    512
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("duet_data"),
            block_cache_size: default_block_cache_size(),
            bloom_filter_bits: default_bloom_filter_bits(),
            sync_writes: default_sync_writes(),
            max_open_files: default_max_open_files(),
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Row metadata kept apart from the (large) content blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RowRecord {
    room_id: Uuid,
    clock: u64,
    has_content: bool,
    content_size: u64,
    compressed_size: u64,
    created_at: u64,
    updated_at: u64,
}

impl RowRecord {
    fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB snapshot store.
pub struct RocksSnapshotStore {
    /// RocksDB instance (single-threaded mode)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of rows within this process.
    write_lock: Mutex<()>,
}

impl RocksSnapshotStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
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

        log::info!("Opened snapshot store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_DOCUMENTS => {
                // Small values, point lookups on every hydration
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CONTENTS => {
                // Already LZ4 compressed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn load_record(&self, doc_id: Uuid) -> StoreResult<Option<RowRecord>> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(RowRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn snapshot_from(&self, doc_id: Uuid, record: RowRecord) -> StoreResult<DurableSnapshot> {
        let content = if record.has_content {
            let cf = self.cf(CF_CONTENTS)?;
            let compressed = self
                .db
                .get_cf(cf, doc_id.as_bytes())?
                .ok_or_else(|| StoreError::DatabaseError(format!("Missing content for {doc_id}")))?;
            Some(
                lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?,
            )
        } else {
            None
        };

        Ok(DurableSnapshot {
            doc_id,
            room_id: record.room_id,
            content,
            clock: record.clock,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

#[async_trait]
impl SnapshotStore for RocksSnapshotStore {
    async fn create(&self, doc_id: Uuid, room_id: Uuid) -> StoreResult<DurableSnapshot> {
        let _guard = self.write_lock.lock();
        if let Some(record) = self.load_record(doc_id)? {
            return self.snapshot_from(doc_id, record);
        }

        let row = DurableSnapshot::new(doc_id, room_id);
        let record = RowRecord {
            room_id,
            clock: 0,
            has_content: false,
            content_size: 0,
            compressed_size: 0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        };
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db
            .put_cf_opt(cf, doc_id.as_bytes(), record.encode()?, &self.write_options())?;
        Ok(row)
    }

    async fn load(&self, doc_id: Uuid) -> StoreResult<DurableSnapshot> {
        let record = self.load_record(doc_id)?.ok_or(StoreError::NotFound(doc_id))?;
        self.snapshot_from(doc_id, record)
    }

    async fn save(&self, doc_id: Uuid, content: &[u8], clock: u64) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let mut record = self.load_record(doc_id)?.ok_or(StoreError::NotFound(doc_id))?;
        if clock < record.clock {
            log::debug!(
                "Ignoring stale snapshot for {doc_id}: clock {clock} < stored {}",
                record.clock
            );
            return Ok(false);
        }

        let compressed = lz4_flex::compress_prepend_size(content);
        record.clock = clock;
        record.has_content = true;
        record.content_size = content.len() as u64;
        record.compressed_size = compressed.len() as u64;
        record.updated_at = unix_now();

        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_contents = self.cf(CF_CONTENTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, doc_id.as_bytes(), record.encode()?);
        batch.put_cf(cf_contents, doc_id.as_bytes(), &compressed);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(true)
    }

    async fn delete(&self, doc_id: Uuid) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let existed = self.load_record(doc_id)?.is_some();

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, doc_id.as_bytes());
        batch.delete_cf(self.cf(CF_CONTENTS)?, doc_id.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        Ok(existed)
    }

    async fn list(&self) -> StoreResult<Vec<Uuid>> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?;
            doc_ids.push(Uuid::from_bytes(bytes));
        }
        Ok(doc_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, RocksSnapshotStore) {
        let dir = tempdir().unwrap();
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_then_load_empty_row() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        let room = Uuid::new_v4();

        store.create(doc, room).await.unwrap();
        let row = store.load(doc).await.unwrap();

        assert_eq!(row.room_id, room);
        assert!(row.content.is_none());
        assert_eq!(row.clock, 0);
    }

    #[tokio::test]
    async fn test_load_missing_row() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        assert!(matches!(store.load(doc).await, Err(StoreError::NotFound(id)) if id == doc));
    }

    #[tokio::test]
    async fn test_save_requires_row() {
        let (_dir, store) = open_temp();
        assert!(store.save(Uuid::new_v4(), b"x", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_save_load_roundtrip_compressed() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        store.create(doc, Uuid::new_v4()).await.unwrap();

        let content = "fn main() { println!(\"hi\"); }\n".repeat(500).into_bytes();
        assert!(store.save(doc, &content, 12).await.unwrap());

        let row = store.load(doc).await.unwrap();
        assert_eq!(row.content.as_deref(), Some(content.as_slice()));
        assert_eq!(row.clock, 12);
    }

    #[tokio::test]
    async fn test_stale_save_ignored() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        store.create(doc, Uuid::new_v4()).await.unwrap();

        assert!(store.save(doc, b"ahead", 10).await.unwrap());
        assert!(!store.save(doc, b"behind", 4).await.unwrap());
        assert_eq!(store.load(doc).await.unwrap().content.as_deref(), Some(&b"ahead"[..]));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let (_dir, store) = open_temp();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.create(a, Uuid::new_v4()).await.unwrap();
        store.create(b, Uuid::new_v4()).await.unwrap();
        store.save(a, b"state", 1).await.unwrap();

        let mut listed = store.list().await.unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);

        assert!(store.delete(a).await.unwrap());
        assert!(!store.delete(a).await.unwrap());
        assert!(store.load(a).await.is_err());
        assert_eq!(store.list().await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let doc = Uuid::new_v4();
        {
            let store = RocksSnapshotStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.create(doc, Uuid::new_v4()).await.unwrap();
            store.save(doc, b"persisted", 3).await.unwrap();
        }
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(&path)).unwrap();
        let row = store.load(doc).await.unwrap();
        assert_eq!(row.content.as_deref(), Some(&b"persisted"[..]));
        assert_eq!(row.clock, 3);
    }
}
