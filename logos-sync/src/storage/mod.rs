//! Update log storage for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   append     ┌────────────────┐
//! │ CollabHub   │ ───────────► │ UpdateLogStore │
//! │ (pipeline)  │              │                │
//! └─────────────┘              │  entries       │  active | archived
//!                              │  snapshots     │  best-effort only
//! ┌─────────────┐ list_active  │  sequence      │  next entry id
//! │ Reconstruct │ ◄─────────── │                │
//! └─────────────┘              └───────┬────────┘
//!                                      │
//! ┌─────────────┐ archive_after        │
//! │ Rollback    │ ─────────────────────┘
//! └─────────────┘
//! ```
//!
//! The log is the source of truth. Entries are never deleted: rollback
//! flips them from `Active` to `Archived`, and only active entries are
//! ever replayed. Snapshots are a convenience copy of the last known
//! state and are never read during reconstruction.

pub mod memory;
pub mod rocks;

pub use memory::MemoryLogStore;
pub use rocks::{RocksLogStore, StoreConfig};

use serde::{Deserialize, Serialize};

use crate::types::{DocumentId, Timestamp};

/// Lifecycle of a log entry. Transitions only `Active → Archived`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Active,
    Archived,
}

/// One accepted update fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: u64,
    pub document_id: DocumentId,
    pub payload: Vec<u8>,
    pub status: EntryStatus,
    pub created_at: Timestamp,
}

impl LogEntry {
    /// Replay order key: `created_at`, ties broken by `id`.
    pub fn replay_key(&self) -> (Timestamp, u64) {
        (self.created_at, self.id)
    }
}

/// Audit view of an active entry. Carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub entry_id: u64,
    pub created_at: Timestamp,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (RocksDB, lock poisoning)
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Backend temporarily unavailable
    Unavailable(String),
    /// Document identifier cannot be stored (empty or too long)
    InvalidDocument(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::DatabaseError(_) | StoreError::Unavailable(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            StoreError::InvalidDocument(id) => write!(f, "Invalid document id: {id:?}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Append-only update log with status transitions.
///
/// Implementations must serialize `append` and `archive_after` for the
/// same document: an append racing an archive lands on one side of the
/// cutoff by its own timestamp, never half-way.
pub trait UpdateLogStore: Send + Sync {
    /// Append an active entry with an explicit creation time.
    fn append_at(
        &self,
        document_id: &DocumentId,
        payload: &[u8],
        created_at: Timestamp,
    ) -> Result<LogEntry, StoreError>;

    /// Append an active entry stamped with the current wall clock.
    fn append(&self, document_id: &DocumentId, payload: &[u8]) -> Result<LogEntry, StoreError> {
        self.append_at(document_id, payload, Timestamp::now())
    }

    /// All active entries for a document in replay order.
    fn list_active(&self, document_id: &DocumentId) -> Result<Vec<LogEntry>, StoreError>;

    /// Archive every active entry with `created_at > cutoff`. Returns the count.
    fn archive_after(&self, document_id: &DocumentId, cutoff: Timestamp) -> Result<u64, StoreError>;

    /// Active entries, newest first, without payloads.
    fn list_history(&self, document_id: &DocumentId) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut history: Vec<HistoryEntry> = self
            .list_active(document_id)?
            .iter()
            .map(|entry| HistoryEntry {
                entry_id: entry.id,
                created_at: entry.created_at,
            })
            .collect();
        history.reverse();
        Ok(history)
    }

    /// Store the last known full state of a document (best effort).
    fn save_snapshot(&self, document_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError>;

    /// Last saved snapshot, if any. Never used for reconstruction.
    fn load_snapshot(&self, document_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(StoreError::DatabaseError("io".into()).is_transient());
        assert!(!StoreError::DeserializationError("bad".into()).is_transient());
        assert!(!StoreError::InvalidDocument(String::new()).is_transient());
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Unavailable("disk full".into());
        assert!(err.to_string().contains("unavailable"));
        let err = StoreError::DatabaseError("test".into());
        assert!(err.to_string().contains("Database error"));
    }

    #[test]
    fn test_history_entry_json_shape() {
        let entry = HistoryEntry {
            entry_id: 7,
            created_at: Timestamp::from_millis(1_000),
        };
        let json = serde_json::to_value(entry).unwrap();
        assert_eq!(json["entryId"], 7);
        assert_eq!(json["createdAt"], 1_000);
    }
}
