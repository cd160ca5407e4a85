//! RocksDB-backed update log.
//!
//! Column families:
//! - `entries`   — log entries, keyed so a forward scan is replay order
//! - `snapshots` — last known full state per document (LZ4 compressed)
//! - `sequence`  — next entry id, written in the same batch as each append
//!
//! Entry key layout:
//! ```text
//! ┌───────────┬─────────────┬──────────────┬──────────┐
//! │ doc_len   │ doc_id      │ created_at   │ id       │
//! │ u16 BE    │ doc_len B   │ u64 BE (ms)  │ u64 BE   │
//! └───────────┴─────────────┴──────────────┴──────────┘
//! ```
//! The length prefix makes every document's keys a contiguous range that
//! no other document's keys can interleave with. Values are
//! bincode-encoded [`StoredEntry`] records with LZ4-compressed payloads.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{EntryStatus, LogEntry, StoreError, UpdateLogStore};
use crate::types::{DocumentId, Timestamp};

const CF_ENTRIES: &str = "entries";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_SEQUENCE: &str = "sequence";

const COLUMN_FAMILIES: &[&str] = &[CF_ENTRIES, CF_SNAPSHOTS, CF_SEQUENCE];

const NEXT_ID_KEY: &[u8] = b"next_entry_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every append and archive (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_sync_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
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

/// On-disk value of the `entries` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    status: EntryStatus,
    /// LZ4-compressed update fragment
    compressed: Vec<u8>,
}

impl StoredEntry {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(entry)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable [`UpdateLogStore`] on RocksDB.
pub struct RocksLogStore {
    /// RocksDB instance (single-threaded mode, writes serialized by the write gate)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next entry id, recovered from the `sequence` column family
    next_id: AtomicU64,
    /// Serializes appends against archive transitions
    write_gate: Mutex<()>,
}

impl RocksLogStore {
    /// Open the log at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let next_id = Self::recover_next_id(&db)?;
        log::info!(
            "Opened update log at {} (next entry id {next_id})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            next_id: AtomicU64::new(next_id),
            write_gate: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ENTRIES => {
                // Payloads are LZ4-compressed before they reach RocksDB
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_SNAPSHOTS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SEQUENCE => {
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    fn recover_next_id(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_SEQUENCE)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{CF_SEQUENCE}' not found")))?;
        match db.get_cf(&cf, NEXT_ID_KEY)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(1),
        }
    }

    /// Every entry for a document regardless of status, in replay order.
    pub fn all_entries(&self, document_id: &DocumentId) -> Result<Vec<LogEntry>, StoreError> {
        self.scan(document_id, |_| true)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Next id that will be assigned.
    pub fn next_entry_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn scan<F>(&self, document_id: &DocumentId, keep: F) -> Result<Vec<LogEntry>, StoreError>
    where
        F: Fn(EntryStatus) -> bool,
    {
        let cf = self.cf(CF_ENTRIES)?;
        let prefix = doc_prefix(document_id)?;

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let stored = StoredEntry::decode(&value)?;
            if !keep(stored.status) {
                continue;
            }
            let (created_at, id) = split_entry_key(&key, prefix.len())?;
            let payload = lz4_flex::decompress_size_prepended(&stored.compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            entries.push(LogEntry {
                id,
                document_id: document_id.clone(),
                payload,
                status: stored.status,
                created_at,
            });
        }
        Ok(entries)
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn gate(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_gate
            .lock()
            .map_err(|_| StoreError::DatabaseError("write gate poisoned".into()))
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl UpdateLogStore for RocksLogStore {
    fn append_at(
        &self,
        document_id: &DocumentId,
        payload: &[u8],
        created_at: Timestamp,
    ) -> Result<LogEntry, StoreError> {
        let prefix = doc_prefix(document_id)?;
        let cf_entries = self.cf(CF_ENTRIES)?;
        let cf_sequence = self.cf(CF_SEQUENCE)?;

        let stored = StoredEntry {
            status: EntryStatus::Active,
            compressed: lz4_flex::compress_prepend_size(payload),
        };
        let value = stored.encode()?;

        let _gate = self.gate()?;
        let id = self.next_id.load(Ordering::SeqCst);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_entries, entry_key(&prefix, created_at, id), &value);
        batch.put_cf(&cf_sequence, NEXT_ID_KEY, (id + 1).to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        self.next_id.store(id + 1, Ordering::SeqCst);

        Ok(LogEntry {
            id,
            document_id: document_id.clone(),
            payload: payload.to_vec(),
            status: EntryStatus::Active,
            created_at,
        })
    }

    fn list_active(&self, document_id: &DocumentId) -> Result<Vec<LogEntry>, StoreError> {
        self.scan(document_id, |status| status == EntryStatus::Active)
    }

    fn archive_after(&self, document_id: &DocumentId, cutoff: Timestamp) -> Result<u64, StoreError> {
        let prefix = doc_prefix(document_id)?;
        let Some(first_after) = cutoff.as_millis().checked_add(1) else {
            return Ok(0);
        };
        let cf = self.cf(CF_ENTRIES)?;
        let start = entry_key(&prefix, Timestamp::from_millis(first_after), 0);

        let _gate = self.gate()?;
        let mut batch = WriteBatch::default();
        let mut count = 0u64;

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let mut stored = StoredEntry::decode(&value)?;
            if stored.status != EntryStatus::Active {
                continue;
            }
            stored.status = EntryStatus::Archived;
            batch.put_cf(&cf, &key, stored.encode()?);
            count += 1;
        }

        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }

    fn save_snapshot(&self, document_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        if !document_id.is_valid() {
            return Err(StoreError::InvalidDocument(document_id.to_string()));
        }
        let cf = self.cf(CF_SNAPSHOTS)?;
        let compressed = lz4_flex::compress_prepend_size(snapshot);
        self.db
            .put_cf_opt(&cf, document_id.as_bytes(), &compressed, &self.write_options())?;
        Ok(())
    }

    fn load_snapshot(&self, document_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Key prefix shared by every entry of one document.
fn doc_prefix(document_id: &DocumentId) -> Result<Vec<u8>, StoreError> {
    if !document_id.is_valid() {
        return Err(StoreError::InvalidDocument(document_id.to_string()));
    }
    let bytes = document_id.as_bytes();
    let mut prefix = Vec::with_capacity(2 + bytes.len());
    prefix.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    prefix.extend_from_slice(bytes);
    Ok(prefix)
}

fn entry_key(prefix: &[u8], created_at: Timestamp, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 16);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&created_at.as_millis().to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn split_entry_key(key: &[u8], prefix_len: usize) -> Result<(Timestamp, u64), StoreError> {
    let rest = &key[prefix_len..];
    if rest.len() != 16 {
        return Err(StoreError::DeserializationError(format!(
            "Entry key has {} trailing bytes, expected 16",
            rest.len()
        )));
    }
    let created_at = decode_u64(&rest[..8])?;
    let id = decode_u64(&rest[8..])?;
    Ok((Timestamp::from_millis(created_at), id))
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::DeserializationError("Expected 8-byte integer".into()))?;
    Ok(u64::from_be_bytes(buf))
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
    use std::fs;

    /// Create a temp directory for test database.
    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("logos_sync_rocks_{name}_{}", uuid::Uuid::new_v4()))
    }

    /// Clean up test database.
    fn cleanup(path: &Path) {
        let _ = fs::remove_dir_all(path);
    }

    fn doc(name: &str) -> DocumentId {
        DocumentId::new(name)
    }

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn test_store_open_close() {
        let path = temp_db_path("open_close");
        let store = RocksLogStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert!(store.path().exists());
        assert_eq!(store.next_entry_id(), 1);
        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_append_and_list_in_replay_order() {
        let path = temp_db_path("append");
        let store = RocksLogStore::open(StoreConfig::for_testing(&path)).unwrap();

        store.append_at(&doc("d"), b"third", ts(300)).unwrap();
        store.append_at(&doc("d"), b"first", ts(100)).unwrap();
        store.append_at(&doc("d"), b"second", ts(200)).unwrap();

        let active = store.list_active(&doc("d")).unwrap();
        let payloads: Vec<&[u8]> = active.iter().map(|e| e.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"first".as_slice(), b"second", b"third"]);
        assert!(active.iter().all(|e| e.status == EntryStatus::Active));

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_prefix_documents_do_not_interleave() {
        let path = temp_db_path("prefix");
        let store = RocksLogStore::open(StoreConfig::for_testing(&path)).unwrap();

        // "doc" is a byte prefix of "doc1"; the length prefix keeps them apart.
        store.append_at(&doc("doc"), b"short", ts(10)).unwrap();
        store.append_at(&doc("doc1"), b"long", ts(5)).unwrap();

        assert_eq!(store.list_active(&doc("doc")).unwrap().len(), 1);
        assert_eq!(store.list_active(&doc("doc1")).unwrap().len(), 1);
        assert_eq!(store.archive_after(&doc("doc"), ts(0)).unwrap(), 1);
        assert_eq!(store.list_active(&doc("doc1")).unwrap().len(), 1);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_archive_after_monotonic() {
        let path = temp_db_path("archive");
        let store = RocksLogStore::open(StoreConfig::for_testing(&path)).unwrap();
        let d = doc("doc1");

        for t in [10, 20, 30] {
            store.append_at(&d, &[t as u8; 32], ts(t)).unwrap();
        }
        assert_eq!(store.archive_after(&d, ts(15)).unwrap(), 2);
        assert_eq!(store.archive_after(&d, ts(15)).unwrap(), 0);

        let all = store.all_entries(&d).unwrap();
        assert_eq!(all.len(), 3);
        for entry in &all {
            let expected = if entry.created_at > ts(15) {
                EntryStatus::Archived
            } else {
                EntryStatus::Active
            };
            assert_eq!(entry.status, expected);
        }
        let active = store.list_active(&d).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].payload, vec![10u8; 32]);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_archive_at_max_cutoff_is_noop() {
        let path = temp_db_path("max_cutoff");
        let store = RocksLogStore::open(StoreConfig::for_testing(&path)).unwrap();
        store.append_at(&doc("d"), b"x", ts(u64::MAX)).unwrap();
        assert_eq!(store.archive_after(&doc("d"), ts(u64::MAX)).unwrap(), 0);
        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_entry_ids_survive_reopen() {
        let path = temp_db_path("reopen");
        let config = StoreConfig::for_testing(path.clone());

        let last = {
            let store = RocksLogStore::open(config.clone()).unwrap();
            store.append(&doc("d"), b"a").unwrap();
            store.append(&doc("d"), b"b").unwrap().id
        };

        {
            let store = RocksLogStore::open(config).unwrap();
            assert_eq!(store.next_entry_id(), last + 1);
            let next = store.append(&doc("d"), b"c").unwrap();
            assert_eq!(next.id, last + 1);
            assert_eq!(store.list_active(&doc("d")).unwrap().len(), 3);
        }

        cleanup(&path);
    }

    #[test]
    fn test_history_newest_first() {
        let path = temp_db_path("history");
        let store = RocksLogStore::open(StoreConfig::for_testing(&path)).unwrap();
        let a = store.append_at(&doc("d"), b"a", ts(1)).unwrap();
        let b = store.append_at(&doc("d"), b"b", ts(2)).unwrap();

        let history = store.list_history(&doc("d")).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].entry_id, b.id);
        assert_eq!(history[1].entry_id, a.id);
        assert_eq!(history[0].created_at, ts(2));

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_snapshot_save_load() {
        let path = temp_db_path("snapshot");
        let store = RocksLogStore::open(StoreConfig::for_testing(&path)).unwrap();

        assert!(store.load_snapshot(&doc("d")).unwrap().is_none());
        let data = vec![42u8; 100_000];
        store.save_snapshot(&doc("d"), &data).unwrap();
        assert_eq!(store.load_snapshot(&doc("d")).unwrap(), Some(data));
        // Snapshots never show up as log entries
        assert!(store.list_active(&doc("d")).unwrap().is_empty());

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_invalid_document_rejected() {
        let path = temp_db_path("invalid");
        let store = RocksLogStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert!(matches!(
            store.append(&doc(""), b"x"),
            Err(StoreError::InvalidDocument(_))
        ));
        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 128 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(config.sync_writes);
    }
}
