//! Point-in-time rollback of a document.
//!
//! ```text
//! Requested ─► Validated ─► Archived ─► Evicted ─► Notified ─► Completed
//!     │            │            │
//!     └────────────┴────────────┴──► Rejected
//! ```
//!
//! Archiving flips later entries to `Archived`. Nothing is deleted, so a
//! rollback can be audited and a replay of the active log reproduces
//! the document as of the cutoff. The cached replica is evicted under
//! the document lock, which keeps an in-flight update from landing in a
//! replica that is about to be discarded.

use std::fmt;
use std::sync::Arc;

use crate::broadcast::RoomManager;
use crate::cache::DocumentCache;
use crate::storage::{StoreError, UpdateLogStore};
use crate::types::{DocumentId, InvalidTimestamp, Timestamp};

/// Reason sent with the resync notification.
pub const ROLLBACK_REASON: &str = "document rolled back";

/// Rollback progress, logged at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStage {
    Requested,
    Validated,
    Archived,
    Evicted,
    Notified,
    Completed,
    Rejected,
}

impl fmt::Display for RollbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RollbackStage::Requested => "requested",
            RollbackStage::Validated => "validated",
            RollbackStage::Archived => "archived",
            RollbackStage::Evicted => "evicted",
            RollbackStage::Notified => "notified",
            RollbackStage::Completed => "completed",
            RollbackStage::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Rollback errors.
#[derive(Debug, Clone)]
pub enum RollbackError {
    /// The cutoff does not name a point in time
    InvalidTimestamp(InvalidTimestamp),
    /// No active entry is newer than the cutoff. Nothing changed.
    NothingToRollBack {
        document_id: DocumentId,
        cutoff: Timestamp,
    },
    /// The log could not be updated. Nothing changed.
    Store(StoreError),
}

impl fmt::Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackError::InvalidTimestamp(e) => write!(f, "{e}"),
            RollbackError::NothingToRollBack { .. } => {
                write!(f, "Nothing to roll back after that time")
            }
            RollbackError::Store(e) => write!(f, "Rollback failed: {e}"),
        }
    }
}

impl std::error::Error for RollbackError {}

impl From<StoreError> for RollbackError {
    fn from(e: StoreError) -> Self {
        RollbackError::Store(e)
    }
}

impl From<InvalidTimestamp> for RollbackError {
    fn from(e: InvalidTimestamp) -> Self {
        RollbackError::InvalidTimestamp(e)
    }
}

/// Result of a completed rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub document_id: DocumentId,
    pub cutoff: Timestamp,
    pub archived_count: u64,
    /// Whether a cached replica was discarded
    pub evicted: bool,
    /// Connections reached by the resync notification
    pub notified: usize,
}

/// Archives, evicts and notifies.
pub struct RollbackCoordinator {
    store: Arc<dyn UpdateLogStore>,
    cache: Arc<DocumentCache>,
    rooms: Arc<RoomManager>,
}

impl RollbackCoordinator {
    pub fn new(
        store: Arc<dyn UpdateLogStore>,
        cache: Arc<DocumentCache>,
        rooms: Arc<RoomManager>,
    ) -> Self {
        Self { store, cache, rooms }
    }

    /// Roll back to a cutoff given as text (RFC 3339 or epoch millis).
    pub async fn rollback_at(
        &self,
        document_id: &DocumentId,
        cutoff: &str,
    ) -> Result<RollbackOutcome, RollbackError> {
        stage(document_id, RollbackStage::Requested);
        let cutoff = Timestamp::parse(cutoff).inspect_err(|_| {
            stage(document_id, RollbackStage::Rejected);
        })?;
        self.rollback(document_id, cutoff).await
    }

    /// Archive every active entry created after `cutoff`.
    ///
    /// Zero matching entries is reported as `NothingToRollBack`; the
    /// cache and connected clients are left alone, so retrying an
    /// already applied rollback has no effect.
    pub async fn rollback(
        &self,
        document_id: &DocumentId,
        cutoff: Timestamp,
    ) -> Result<RollbackOutcome, RollbackError> {
        stage(document_id, RollbackStage::Validated);

        let mut lock = self.cache.lock(document_id).await;

        let archived_count = match self.store.archive_after(document_id, cutoff) {
            Ok(0) => {
                stage(document_id, RollbackStage::Rejected);
                return Err(RollbackError::NothingToRollBack {
                    document_id: document_id.clone(),
                    cutoff,
                });
            }
            Ok(count) => count,
            Err(e) => {
                log::error!("Rollback of {document_id} could not archive entries: {e}");
                stage(document_id, RollbackStage::Rejected);
                return Err(e.into());
            }
        };
        stage(document_id, RollbackStage::Archived);

        let evicted = lock.evict();
        stage(document_id, RollbackStage::Evicted);

        // Still under the lock: no update can be broadcast between the
        // eviction and the resync notice.
        let notified = match self.rooms.notify_resync(document_id, ROLLBACK_REASON).await {
            Ok(count) => count,
            Err(e) => {
                log::error!("Failed to notify members of {document_id} after rollback: {e}");
                0
            }
        };
        stage(document_id, RollbackStage::Notified);
        drop(lock);

        log::info!(
            "Rolled back {document_id} to {cutoff}: {archived_count} entries archived, {notified} connections notified"
        );
        stage(document_id, RollbackStage::Completed);

        Ok(RollbackOutcome {
            document_id: document_id.clone(),
            cutoff,
            archived_count,
            evicted,
            notified,
        })
    }
}

fn stage(document_id: &DocumentId, stage: RollbackStage) {
    log::debug!("Rollback {document_id}: {stage}");
}
