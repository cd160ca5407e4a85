//! Rebuilds a replica by replaying a document's active log entries.
//!
//! Replay runs as one batch inside a single Yrs write transaction, so
//! readers never observe a half-replayed document and Yrs bookkeeping
//! is paid once per rebuild instead of once per entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::replica::{MergeError, Replica};
use crate::storage::{StoreError, UpdateLogStore};
use crate::types::DocumentId;

/// Reconstruction errors. Fatal to the `get` that triggered them.
#[derive(Debug, Clone)]
pub enum ReconstructionError {
    /// Reading the log failed
    Store(StoreError),
    /// An active entry does not decode as an update fragment
    CorruptEntry { entry_id: u64, error: MergeError },
}

impl std::fmt::Display for ReconstructionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "Failed to read update log: {e}"),
            Self::CorruptEntry { entry_id, error } => {
                write!(f, "Log entry {entry_id} cannot be replayed: {error}")
            }
        }
    }
}

impl std::error::Error for ReconstructionError {}

impl From<StoreError> for ReconstructionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Replays the update log into fresh replicas.
pub struct ReconstructionEngine {
    store: Arc<dyn UpdateLogStore>,
    reconstructions: AtomicU64,
    entries_replayed: AtomicU64,
}

impl ReconstructionEngine {
    pub fn new(store: Arc<dyn UpdateLogStore>) -> Self {
        Self {
            store,
            reconstructions: AtomicU64::new(0),
            entries_replayed: AtomicU64::new(0),
        }
    }

    /// Build a replica equal to the replay of every active entry.
    ///
    /// A document with no active entries yields an empty replica.
    pub fn reconstruct(&self, document_id: &DocumentId) -> Result<Replica, ReconstructionError> {
        let started = Instant::now();
        let entries = self.store.list_active(document_id)?;

        let replica = Replica::new();
        replica
            .apply_batch(entries.iter().map(|e| e.payload.as_slice()))
            .map_err(|(index, error)| ReconstructionError::CorruptEntry {
                entry_id: entries[index].id,
                error,
            })?;

        self.reconstructions.fetch_add(1, Ordering::Relaxed);
        self.entries_replayed
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        log::debug!(
            "Reconstructed {document_id} from {} entries in {:?}",
            entries.len(),
            started.elapsed()
        );
        Ok(replica)
    }

    /// Number of successful reconstructions since startup.
    pub fn reconstructions(&self) -> u64 {
        self.reconstructions.load(Ordering::Relaxed)
    }

    /// Total entries replayed across all reconstructions.
    pub fn entries_replayed(&self) -> u64 {
        self.entries_replayed.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<dyn UpdateLogStore> {
        &self.store
    }
}
