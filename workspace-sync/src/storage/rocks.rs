//! RocksDB-backed blob, metadata and chat store.
//!
//! Column families:
//! - `blobs`     - Workspace document states keyed by blob URI (LZ4 compressed)
//! - `blob_meta` - Per-blob bookkeeping (bincode: sizes, revision, timestamps)
//! - `campaigns` - Campaign records keyed by `org \0 project \0 campaign` (bincode)
//! - `messages`  - Chat messages keyed by `route \0 seq` (JSON)
//!
//! A blob and its bookkeeping are written in one atomic batch, so a reader
//! never sees metadata for a blob that was not written.
//!
//! The methods on [`RocksStore`] block. The async collaborator impls run
//! them on tokio's blocking pool so fsyncs never stall a runtime worker.
//!
//! Reference: Kleppmann - DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

use super::{BlobStore, CampaignRecord, ChatLog, MetadataStore};
use crate::error::{SyncError, SyncResult};
use crate::room::{ChatRoute, WorkspaceBlobUri};

const CF_BLOBS: &str = "blobs";
const CF_BLOB_META: &str = "blob_meta";
const CF_CAMPAIGNS: &str = "campaigns";
const CF_MESSAGES: &str = "messages";

const COLUMN_FAMILIES: &[&str] = &[CF_BLOBS, CF_BLOB_META, CF_CAMPAIGNS, CF_MESSAGES];

/// Separates the route prefix from the sequence number in message keys,
/// and the scope segments of campaign keys.
const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write. On by default: a fork is acknowledged to the
    /// metadata store only after its blob is durable.
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("workspace_sync_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
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
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub uri: WorkspaceBlobUri,
    /// Number of times this URI has been written
    pub revision: u64,
    /// Uncompressed size in bytes
    pub size: u64,
    /// Compressed size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl BlobMetadata {
    fn new(uri: WorkspaceBlobUri) -> Self {
        let now = unix_now();
        Self {
            uri,
            revision: 0,
            size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    DatabaseError(String),
    /// Key not found
    #[error("Key not found: {0}")]
    NotFound(String),
    /// Serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    /// Compression error
    #[error("Compression error: {0}")]
    CompressionError(String),
    /// Blocking storage task panicked or was cancelled
    #[error("Storage task failed: {0}")]
    TaskFailed(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => SyncError::NotFound(key),
            other => SyncError::Io(other.to_string()),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// RocksDB-backed store implementing every storage collaborator.
///
/// Cloning is cheap; clones share one database.
#[derive(Clone)]
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode - concurrency via tokio)
    db: Arc<DBWithThreadMode<SingleThreaded>>,
    config: Arc<StoreConfig>,
    /// Next chat message sequence number
    message_sequence: Arc<AtomicU64>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let message_sequence = Self::recover_message_sequence(&db);
        log::info!(
            "Opened workspace store at {} (next message seq {message_sequence})",
            config.path.display()
        );

        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
            message_sequence: Arc::new(AtomicU64::new(message_sequence)),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_BLOBS => {
                // Values are LZ4-compressed before they reach RocksDB.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_BLOB_META | CF_CAMPAIGNS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_MESSAGES => {
                // Append-mostly, range-scanned per chat route
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    /// Continue message numbering after the highest stored key.
    fn recover_message_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_MESSAGES) {
            Some(cf) => cf,
            None => return 0,
        };

        let mut highest = None;
        for item in db.iterator_cf(&cf, IteratorMode::Start) {
            let Ok((key, _)) = item else { break };
            if let Some(seq) = Self::message_seq(&key) {
                highest = Some(highest.map_or(seq, |h: u64| h.max(seq)));
            }
        }
        highest.map_or(0, |h| h + 1)
    }

    // ─── Blobs ────────────────────────────────────────────────────────

    /// Write a blob and its bookkeeping atomically.
    pub fn save_blob(&self, uri: &WorkspaceBlobUri, bytes: &[u8]) -> Result<BlobMetadata, StoreError> {
        let cf_blobs = self.cf(CF_BLOBS)?;
        let cf_meta = self.cf(CF_BLOB_META)?;

        let compressed = lz4_flex::compress_prepend_size(bytes);

        let mut meta = match self.load_blob_metadata(uri) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => BlobMetadata::new(uri.clone()),
            Err(e) => return Err(e),
        };
        meta.revision += 1;
        meta.size = bytes.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let key = uri.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_blobs, key, &compressed);
        batch.put_cf(&cf_meta, key, encode(&meta)?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load a blob, LZ4 decompressed. `Ok(None)` when absent.
    pub fn load_blob(&self, uri: &WorkspaceBlobUri) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_BLOBS)?;
        match self.db.get_cf(&cf, uri.as_str().as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn load_blob_metadata(&self, uri: &WorkspaceBlobUri) -> Result<BlobMetadata, StoreError> {
        let cf = self.cf(CF_BLOB_META)?;
        match self.db.get_cf(&cf, uri.as_str().as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(uri.to_string())),
        }
    }

    /// All blob URIs in the store.
    pub fn list_blobs(&self) -> Result<Vec<WorkspaceBlobUri>, StoreError> {
        let cf = self.cf(CF_BLOB_META)?;
        let mut uris = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let uri = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            uris.push(WorkspaceBlobUri::from_stored(uri));
        }
        Ok(uris)
    }

    // ─── Campaigns ────────────────────────────────────────────────────

    pub fn save_campaign(&self, record: &CampaignRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_CAMPAIGNS)?;
        let key = Self::campaign_key(&record.id, &record.project_id, &record.organization_id);
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(&cf, key, encode(record)?, &write_opts)?;
        Ok(())
    }

    pub fn load_campaign(
        &self,
        campaign_id: &str,
        project_id: &str,
        organization_id: &str,
    ) -> Result<Option<CampaignRecord>, StoreError> {
        let cf = self.cf(CF_CAMPAIGNS)?;
        let key = Self::campaign_key(campaign_id, project_id, organization_id);
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    // ─── Messages ─────────────────────────────────────────────────────

    pub fn append_chat_message(&self, route: &ChatRoute, message: &[u8]) -> Result<u64, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        let seq = self.message_sequence.fetch_add(1, Ordering::SeqCst);
        let mut key = Self::message_prefix(route);
        key.extend_from_slice(&seq.to_be_bytes());
        self.db.put_cf(&cf, key, message)?;
        Ok(seq)
    }

    pub fn load_chat_messages(&self, route: &ChatRoute) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        let prefix = Self::message_prefix(route);
        let mut messages = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            messages.push(value.to_vec());
        }
        Ok(messages)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn campaign_key(campaign_id: &str, project_id: &str, organization_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(organization_id.len() + project_id.len() + campaign_id.len() + 2);
        key.extend_from_slice(organization_id.as_bytes());
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(project_id.as_bytes());
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(campaign_id.as_bytes());
        key
    }

    /// Run a blocking store operation on the blocking thread pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }

    fn message_prefix(route: &ChatRoute) -> Vec<u8> {
        let mut prefix = route.to_string().into_bytes();
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    fn message_seq(key: &[u8]) -> Option<u64> {
        if key.len() < 9 || key[key.len() - 9] != KEY_SEPARATOR {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[key.len() - 8..]);
        Some(u64::from_be_bytes(buf))
    }
}

#[async_trait]
impl BlobStore for RocksStore {
    async fn get_snapshot(&self, uri: &WorkspaceBlobUri) -> SyncResult<Option<Vec<u8>>> {
        let uri = uri.clone();
        Ok(self.blocking(move |store| store.load_blob(&uri)).await?)
    }

    async fn set_snapshot(&self, uri: &WorkspaceBlobUri, bytes: &[u8]) -> SyncResult<()> {
        let target = uri.clone();
        let bytes = bytes.to_vec();
        let meta = self
            .blocking(move |store| store.save_blob(&target, &bytes))
            .await?;
        log::debug!(
            "Saved blob {uri} rev {} ({} → {} bytes)",
            meta.revision,
            meta.size,
            meta.compressed_size
        );
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for RocksStore {
    async fn get_campaign(
        &self,
        campaign_id: &str,
        project_id: &str,
        organization_id: &str,
    ) -> SyncResult<Option<CampaignRecord>> {
        let (id, project, org) = (campaign_id.to_string(), project_id.to_string(), organization_id.to_string());
        Ok(self
            .blocking(move |store| store.load_campaign(&id, &project, &org))
            .await?)
    }

    async fn update_campaign(
        &self,
        campaign_id: &str,
        project_id: &str,
        organization_id: &str,
        workspace_blob_uri: &WorkspaceBlobUri,
    ) -> SyncResult<()> {
        let (id, project, org) = (campaign_id.to_string(), project_id.to_string(), organization_id.to_string());
        let uri = workspace_blob_uri.clone();
        let updated = self
            .blocking(move |store| {
                let Some(mut record) = store.load_campaign(&id, &project, &org)? else {
                    return Ok(false);
                };
                record.workspace_blob_uri = uri;
                store.save_campaign(&record)?;
                Ok(true)
            })
            .await?;
        if updated {
            Ok(())
        } else {
            Err(SyncError::NotFound(format!(
                "campaign {campaign_id} in {organization_id}/{project_id}"
            )))
        }
    }

    async fn insert_campaign(&self, record: CampaignRecord) -> SyncResult<()> {
        Ok(self.blocking(move |store| store.save_campaign(&record)).await?)
    }
}

#[async_trait]
impl ChatLog for RocksStore {
    async fn append_message(&self, route: &ChatRoute, message: &serde_json::Value) -> SyncResult<()> {
        let bytes = serde_json::to_vec(message)
            .map_err(|e| SyncError::BadRequest(format!("unserializable message: {e}")))?;
        let route = route.clone();
        self.blocking(move |store| store.append_chat_message(&route, &bytes))
            .await?;
        Ok(())
    }

    async fn messages(&self, route: &ChatRoute) -> SyncResult<Vec<serde_json::Value>> {
        let route = route.clone();
        self.blocking(move |store| store.load_chat_messages(&route))
            .await?
            .iter()
            .map(|bytes| {
                serde_json::from_slice(bytes)
                    .map_err(|e| SyncError::Io(format!("corrupt chat message: {e}")))
            })
            .collect()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_open_close() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_blob_save_load() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        let uri = WorkspaceBlobUri::for_project("org", "proj");
        let data = b"Workspace state with enough repeated bytes to compress compress compress.".to_vec();

        let meta = store.save_blob(&uri, &data).unwrap();
        assert_eq!(meta.revision, 1);
        assert_eq!(meta.size, data.len() as u64);
        assert!(meta.compressed_size > 0);

        assert_eq!(store.load_blob(&uri).unwrap(), Some(data));

        let meta = store.save_blob(&uri, b"second").unwrap();
        assert_eq!(meta.revision, 2);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_blob_absent_is_none() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let uri = WorkspaceBlobUri::for_project("org", "missing");
        assert_eq!(store.load_blob(&uri).unwrap(), None);
        assert!(matches!(store.load_blob_metadata(&uri), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_list_blobs() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let project = WorkspaceBlobUri::for_project("o", "p");
        let campaign = WorkspaceBlobUri::for_campaign("o", "p", "c");
        store.save_blob(&project, b"a").unwrap();
        store.save_blob(&campaign, b"b").unwrap();

        let listed = store.list_blobs().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&project));
        assert!(listed.contains(&campaign));
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let uri = WorkspaceBlobUri::for_project("o", "p");
        let route = ChatRoute::new("o", "p", "chat").unwrap();

        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save_blob(&uri, b"durable").unwrap();
            store
                .save_campaign(&CampaignRecord::sharing_project("c", "p", "o"))
                .unwrap();
            store.append_chat_message(&route, b"{\"n\":0}").unwrap();
            store.append_chat_message(&route, b"{\"n\":1}").unwrap();
        }

        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load_blob(&uri).unwrap(), Some(b"durable".to_vec()));
        assert!(store.load_campaign("c", "p", "o").unwrap().is_some());
        let seq = store.append_chat_message(&route, b"{\"n\":2}").unwrap();
        assert_eq!(seq, 2);
        assert_eq!(store.load_chat_messages(&route).unwrap().len(), 3);
    }

    #[test]
    fn test_messages_isolated_per_route() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let a = ChatRoute::new("o", "p", "a").unwrap();
        let ab = ChatRoute::new("o", "p", "ab").unwrap();

        store.append_chat_message(&a, b"1").unwrap();
        store.append_chat_message(&ab, b"2").unwrap();
        store.append_chat_message(&a, b"3").unwrap();

        assert_eq!(store.load_chat_messages(&a).unwrap(), vec![b"1".to_vec(), b"3".to_vec()]);
        assert_eq!(store.load_chat_messages(&ab).unwrap(), vec![b"2".to_vec()]);
    }

    #[tokio::test]
    async fn test_metadata_store_contract() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        store
            .insert_campaign(CampaignRecord::sharing_project("c1", "p1", "o1"))
            .await
            .unwrap();

        let record = store.get_campaign("c1", "p1", "o1").await.unwrap().unwrap();
        assert_eq!(record.workspace_blob_uri, WorkspaceBlobUri::for_project("o1", "p1"));
        assert!(store.get_campaign("c1", "p1", "other").await.unwrap().is_none());

        let forked = WorkspaceBlobUri::for_campaign("o1", "p1", "c1");
        store.update_campaign("c1", "p1", "o1", &forked).await.unwrap();
        let record = store.get_campaign("c1", "p1", "o1").await.unwrap().unwrap();
        assert_eq!(record.workspace_blob_uri, forked);

        assert!(matches!(
            store.update_campaign("nope", "p1", "o1", &forked).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_same_campaign_id_in_two_projects() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        store
            .insert_campaign(CampaignRecord::sharing_project("spring", "p1", "o1"))
            .await
            .unwrap();
        store
            .insert_campaign(CampaignRecord::sharing_project("spring", "p2", "o1"))
            .await
            .unwrap();

        let forked = WorkspaceBlobUri::for_campaign("o1", "p1", "spring");
        store.update_campaign("spring", "p1", "o1", &forked).await.unwrap();

        let first = store.get_campaign("spring", "p1", "o1").await.unwrap().unwrap();
        let second = store.get_campaign("spring", "p2", "o1").await.unwrap().unwrap();
        assert_eq!(first.workspace_blob_uri, forked);
        assert_eq!(second.workspace_blob_uri, WorkspaceBlobUri::for_project("o1", "p2"));
    }

    #[tokio::test]
    async fn test_clones_share_one_database() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let clone = store.clone();
        let uri = WorkspaceBlobUri::for_project("o", "p");

        clone.set_snapshot(&uri, b"shared").await.unwrap();
        assert_eq!(store.get_snapshot(&uri).await.unwrap(), Some(b"shared".to_vec()));
    }

    #[test]
    fn test_compression_ratio() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        let mut data = Vec::with_capacity(10_000);
        for i in 0..1000 {
            data.extend_from_slice(&[0u8; 6]);
            data.extend_from_slice(&(i as u16).to_le_bytes());
            data.extend_from_slice(b"tx");
        }

        let meta = store
            .save_blob(&WorkspaceBlobUri::for_project("o", "p"), &data)
            .unwrap();
        let ratio = meta.size as f64 / meta.compressed_size as f64;
        assert!(ratio > 2.0, "Compression ratio {ratio:.1}x too low (expected >2x)");
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert!(config.sync_writes);
        assert!(!StoreConfig::for_testing("x").sync_writes);
    }

    #[test]
    fn test_store_error_maps_to_sync_error() {
        let err: SyncError = StoreError::NotFound("workspace/o/p".into()).into();
        assert!(matches!(err, SyncError::NotFound(_)));

        let err: SyncError = StoreError::DatabaseError("io".into()).into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Database error: io"));
    }
}
