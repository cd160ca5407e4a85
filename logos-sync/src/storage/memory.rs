//! In-memory update log.
//!
//! Used when the server runs without a data directory, and by tests.
//! Entries per document are kept sorted by replay order so reads are a
//! filter, not a sort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{EntryStatus, LogEntry, StoreError, UpdateLogStore};
use crate::types::{DocumentId, Timestamp};

#[derive(Default)]
struct Inner {
    entries: HashMap<DocumentId, Vec<LogEntry>>,
    snapshots: HashMap<DocumentId, Vec<u8>>,
}

/// Volatile [`UpdateLogStore`]. Contents are lost on drop.
pub struct MemoryLogStore {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Every entry for a document regardless of status, in replay order.
    pub fn all_entries(&self, document_id: &DocumentId) -> Result<Vec<LogEntry>, StoreError> {
        let inner = self.read()?;
        Ok(inner.entries.get(document_id).cloned().unwrap_or_default())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::DatabaseError("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::DatabaseError("memory store lock poisoned".into()))
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateLogStore for MemoryLogStore {
    fn append_at(
        &self,
        document_id: &DocumentId,
        payload: &[u8],
        created_at: Timestamp,
    ) -> Result<LogEntry, StoreError> {
        if !document_id.is_valid() {
            return Err(StoreError::InvalidDocument(document_id.to_string()));
        }
        let mut inner = self.write()?;
        let entry = LogEntry {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            document_id: document_id.clone(),
            payload: payload.to_vec(),
            status: EntryStatus::Active,
            created_at,
        };

        let log = inner.entries.entry(document_id.clone()).or_default();
        let key = entry.replay_key();
        let pos = log.partition_point(|e| e.replay_key() <= key);
        log.insert(pos, entry.clone());
        Ok(entry)
    }

    fn list_active(&self, document_id: &DocumentId) -> Result<Vec<LogEntry>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .entries
            .get(document_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.status == EntryStatus::Active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn archive_after(&self, document_id: &DocumentId, cutoff: Timestamp) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let Some(log) = inner.entries.get_mut(document_id) else {
            return Ok(0);
        };
        let mut archived = 0u64;
        for entry in log.iter_mut() {
            if entry.created_at > cutoff && entry.status == EntryStatus::Active {
                entry.status = EntryStatus::Archived;
                archived += 1;
            }
        }
        Ok(archived)
    }

    fn save_snapshot(&self, document_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner.snapshots.insert(document_id.clone(), snapshot.to_vec());
        Ok(())
    }

    fn load_snapshot(&self, document_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.read()?;
        Ok(inner.snapshots.get(document_id).cloned())
    }
}
