//! Composition root: the update pipeline and the REST-facing operations.
//!
//! ```text
//!            submit_update                      rollback / history
//!                 │                                     │
//!                 ▼                                     ▼
//!   ┌────────────────────────────┐         ┌──────────────────────┐
//!   │ DocumentLock (per doc)     │         │ ProjectDirectory     │
//!   │  apply ─► append ─► fan-out│         │  access check        │
//!   └──────┬─────────┬───────────┘         └──────────┬───────────┘
//!          │         │                                │
//!     DocumentCache  UpdateLogStore ◄──── RollbackCoordinator
//!                    RoomManager  ◄───────────────────┘
//! ```
//!
//! One hub is shared by every connection of a server.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broadcast::{RoomFrame, RoomManager};
use crate::cache::{CacheError, DocumentCache};
use crate::directory::{check_access, Access, AccessDenied, IdentityProvider, ProjectDirectory, ProjectInfo};
use crate::protocol::{Frame, ProtocolError, ServerMessage};
use crate::reconstruct::ReconstructionError;
use crate::replica::MergeError;
use crate::rollback::{RollbackCoordinator, RollbackError};
use crate::storage::{HistoryEntry, LogEntry, StoreError, UpdateLogStore};
use crate::types::{ConnectionId, DocumentId, UserId};

/// Whether an accepted update is logged before or after peers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryOrder {
    /// Peers only ever see durable updates. Slower fan-out.
    #[default]
    AppendThenBroadcast,
    /// Peers see the update first. A failed append loses it.
    BroadcastThenAppend,
}

impl FromStr for DeliveryOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append-then-broadcast" | "append" => Ok(Self::AppendThenBroadcast),
            "broadcast-then-append" | "broadcast" => Ok(Self::BroadcastThenAppend),
            other => Err(format!("unknown delivery order {other:?}")),
        }
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub delivery_order: DeliveryOrder,
    /// Extra append attempts after a transient store failure
    pub append_retries: u32,
    /// Backoff before the first retry; doubles each attempt
    pub append_retry_delay_ms: u64,
    /// Frames buffered per room member
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            delivery_order: DeliveryOrder::AppendThenBroadcast,
            append_retries: 3,
            append_retry_delay_ms: 50,
            broadcast_capacity: 256,
        }
    }
}

impl HubConfig {
    pub fn for_testing() -> Self {
        Self {
            append_retries: 2,
            append_retry_delay_ms: 1,
            broadcast_capacity: 64,
            ..Self::default()
        }
    }
}

/// What happened to an accepted update.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// `None` only under `BroadcastThenAppend` when every append failed
    pub entry: Option<LogEntry>,
    /// Room receivers the fragment was handed to
    pub delivered: usize,
}

/// Why an update was not accepted.
#[derive(Debug, Clone)]
pub enum UpdateError {
    /// Fragment could not be merged; nothing was logged or broadcast
    Malformed(MergeError),
    /// The document could not be loaded
    Unavailable(ReconstructionError),
    /// Every append attempt failed; the replica was reverted to the log
    NotPersisted(StoreError),
    Encode(ProtocolError),
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::Malformed(e) => write!(f, "{e}"),
            UpdateError::Unavailable(e) => write!(f, "Document unavailable: {e}"),
            UpdateError::NotPersisted(e) => write!(f, "Update not persisted: {e}"),
            UpdateError::Encode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<CacheError> for UpdateError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Malformed(e) => UpdateError::Malformed(e),
            CacheError::Reconstruction(e) => UpdateError::Unavailable(e),
        }
    }
}

/// Body of a rollback call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub document_id: DocumentId,
    /// RFC 3339 or epoch milliseconds
    pub cutoff_timestamp: String,
}

/// Result of a rollback call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResponse {
    pub archived_count: u64,
}

/// JSON error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Errors of the REST-facing operations, with their HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Unavailable(_) => 503,
            ApiError::Internal(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(m)
            | ApiError::Forbidden(m)
            | ApiError::NotFound(m)
            | ApiError::Unavailable(m)
            | ApiError::Internal(m) => m,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.message().to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status_code(), self.message())
    }
}

impl std::error::Error for ApiError {}

impl From<AccessDenied> for ApiError {
    fn from(e: AccessDenied) -> Self {
        match e {
            AccessDenied::UnknownProject => ApiError::NotFound(e.to_string()),
            AccessDenied::Forbidden => ApiError::Forbidden(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            ApiError::Unavailable(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

impl From<RollbackError> for ApiError {
    fn from(e: RollbackError) -> Self {
        match e {
            RollbackError::InvalidTimestamp(_) | RollbackError::NothingToRollBack { .. } => {
                ApiError::BadRequest(e.to_string())
            }
            RollbackError::Store(e) => e.into(),
        }
    }
}

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub updates_accepted: u64,
    pub updates_rejected: u64,
    pub appends_failed: u64,
    pub snapshots_saved: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    updates_accepted: AtomicU64,
    updates_rejected: AtomicU64,
    appends_failed: AtomicU64,
    snapshots_saved: AtomicU64,
}

/// Shared state behind every connection.
pub struct CollabHub {
    config: HubConfig,
    store: Arc<dyn UpdateLogStore>,
    cache: Arc<DocumentCache>,
    rooms: Arc<RoomManager>,
    rollback: RollbackCoordinator,
    identity: Arc<dyn IdentityProvider>,
    directory: Arc<dyn ProjectDirectory>,
    stats: AtomicHubStats,
}

impl CollabHub {
    pub fn new(
        config: HubConfig,
        store: Arc<dyn UpdateLogStore>,
        identity: Arc<dyn IdentityProvider>,
        directory: Arc<dyn ProjectDirectory>,
    ) -> Self {
        let cache = Arc::new(DocumentCache::new(store.clone()));
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        let rollback = RollbackCoordinator::new(store.clone(), cache.clone(), rooms.clone());
        Self {
            config,
            store,
            cache,
            rooms,
            rollback,
            identity,
            directory,
            stats: AtomicHubStats::default(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn UpdateLogStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn authenticate(&self, token: &str) -> Option<UserId> {
        self.identity.authenticate(token)
    }

    pub fn authorize(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        access: Access,
    ) -> Result<ProjectInfo, AccessDenied> {
        check_access(self.directory.as_ref(), user, document_id, access)
    }

    /// Merge, log and fan out one update fragment.
    ///
    /// Runs under the document lock, so updates to one document are
    /// applied, logged and broadcast in a single total order, and a
    /// rollback cannot interleave.
    pub async fn submit_update(
        &self,
        origin: ConnectionId,
        document_id: &DocumentId,
        fragment: &[u8],
    ) -> Result<UpdateOutcome, UpdateError> {
        let mut lock = self.cache.lock(document_id).await;

        if let Err(e) = lock.apply(fragment) {
            self.stats.updates_rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!("Dropped update for {document_id} from {origin}: {e}");
            return Err(e.into());
        }

        let msg = ServerMessage::Update {
            document_id: document_id.clone(),
            fragment: fragment.to_vec(),
        };
        let frame = RoomFrame {
            origin: Some(origin),
            bytes: Arc::new(msg.encode().map_err(UpdateError::Encode)?),
        };

        let outcome = match self.config.delivery_order {
            DeliveryOrder::AppendThenBroadcast => {
                match self.append_with_retry(document_id, fragment).await {
                    Ok(entry) => UpdateOutcome {
                        entry: Some(entry),
                        delivered: self.deliver(document_id, frame).await,
                    },
                    Err(e) => {
                        // The replica holds an update the log does not
                        lock.evict();
                        self.stats.appends_failed.fetch_add(1, Ordering::Relaxed);
                        log::error!("Update for {document_id} not persisted, reverted to log: {e}");
                        return Err(UpdateError::NotPersisted(e));
                    }
                }
            }
            DeliveryOrder::BroadcastThenAppend => {
                let delivered = self.deliver(document_id, frame).await;
                let entry = match self.append_with_retry(document_id, fragment).await {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        self.stats.appends_failed.fetch_add(1, Ordering::Relaxed);
                        log::error!(
                            "Update for {document_id} delivered to {delivered} receivers but not persisted: {e}"
                        );
                        None
                    }
                };
                UpdateOutcome { entry, delivered }
            }
        };

        self.stats.updates_accepted.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    /// Roll a document back as its owner.
    pub async fn rollback(
        &self,
        caller: &UserId,
        request: RollbackRequest,
    ) -> Result<RollbackResponse, ApiError> {
        self.authorize(caller, &request.document_id, Access::Rollback)
            .inspect_err(|e| log::warn!("Rollback of {} by {caller} refused: {e}", request.document_id))?;
        let outcome = self
            .rollback
            .rollback_at(&request.document_id, &request.cutoff_timestamp)
            .await?;
        Ok(RollbackResponse {
            archived_count: outcome.archived_count,
        })
    }

    /// Active entries of a document, newest first.
    pub async fn history(
        &self,
        caller: &UserId,
        document_id: &DocumentId,
    ) -> Result<Vec<HistoryEntry>, ApiError> {
        self.authorize(caller, document_id, Access::History)?;
        Ok(self.store.list_history(document_id)?)
    }

    /// Last periodically saved state of a document, for its members.
    pub fn last_snapshot(
        &self,
        caller: &UserId,
        document_id: &DocumentId,
    ) -> Result<Option<Vec<u8>>, ApiError> {
        self.authorize(caller, document_id, Access::History)?;
        Ok(self.store.load_snapshot(document_id)?)
    }

    /// Save a snapshot of every resident replica. Returns how many were saved.
    ///
    /// Documents evicted since the scan are skipped rather than rebuilt, and
    /// idle cache slots are released afterwards.
    pub async fn snapshot_all(&self) -> usize {
        let mut saved = 0;
        for document_id in self.cache.resident_documents().await {
            let Some(snapshot) = self.cache.snapshot_if_resident(&document_id).await else {
                log::trace!("Skipping snapshot of {document_id}, no longer resident");
                continue;
            };
            match self.store.save_snapshot(&document_id, &snapshot) {
                Ok(()) => saved += 1,
                Err(e) => log::warn!("Failed to save snapshot of {document_id}: {e}"),
            }
        }
        self.stats.snapshots_saved.fetch_add(saved as u64, Ordering::Relaxed);
        if saved > 0 {
            log::debug!("Saved {saved} document snapshots");
        }
        self.cache.prune().await;
        saved
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            updates_accepted: self.stats.updates_accepted.load(Ordering::Relaxed),
            updates_rejected: self.stats.updates_rejected.load(Ordering::Relaxed),
            appends_failed: self.stats.appends_failed.load(Ordering::Relaxed),
            snapshots_saved: self.stats.snapshots_saved.load(Ordering::Relaxed),
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    async fn append_with_retry(
        &self,
        document_id: &DocumentId,
        fragment: &[u8],
    ) -> Result<LogEntry, StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.append(document_id, fragment) {
                Ok(entry) => return Ok(entry),
                Err(e) if e.is_transient() && attempt < self.config.append_retries => {
                    let delay = self.config.append_retry_delay_ms << attempt;
                    attempt += 1;
                    log::warn!(
                        "Append for {document_id} failed (attempt {attempt}), retrying in {delay}ms: {e}"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn deliver(&self, document_id: &DocumentId, frame: RoomFrame) -> usize {
        match self.rooms.get(document_id).await {
            Some(room) => room.broadcast_raw(frame),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::MemberInfo;
    use crate::directory::{MemoryDirectory, OpenDirectory, TokenAsUser};
    use crate::replica::Replica;
    use crate::storage::MemoryLogStore;
    use crate::types::Timestamp;
    use std::sync::atomic::AtomicU32;
    use uuid::Uuid;
    use yrs::{GetString, Text, WriteTxn};

    fn fragment(author: &Replica, text: &str) -> Vec<u8> {
        author.edit(|txn| {
            let root = txn.get_or_insert_text("content");
            let len = root.get_string(&*txn).len() as u32;
            root.insert(txn, len, text);
        })
    }

    /// Fails the first `failures` appends with a transient error.
    struct FlakyStore {
        inner: MemoryLogStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryLogStore::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    impl UpdateLogStore for FlakyStore {
        fn append_at(
            &self,
            document_id: &DocumentId,
            payload: &[u8],
            created_at: Timestamp,
        ) -> Result<LogEntry, StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("disk busy".into()));
            }
            self.inner.append_at(document_id, payload, created_at)
        }

        fn list_active(&self, document_id: &DocumentId) -> Result<Vec<LogEntry>, StoreError> {
            self.inner.list_active(document_id)
        }

        fn archive_after(&self, document_id: &DocumentId, cutoff: Timestamp) -> Result<u64, StoreError> {
            self.inner.archive_after(document_id, cutoff)
        }

        fn save_snapshot(&self, document_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
            self.inner.save_snapshot(document_id, snapshot)
        }

        fn load_snapshot(&self, document_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.load_snapshot(document_id)
        }
    }

    fn hub_with(store: Arc<dyn UpdateLogStore>, order: DeliveryOrder) -> CollabHub {
        let config = HubConfig {
            delivery_order: order,
            ..HubConfig::for_testing()
        };
        CollabHub::new(config, store, Arc::new(TokenAsUser), Arc::new(OpenDirectory))
    }

    async fn join(hub: &CollabHub, doc: &DocumentId) -> tokio::sync::broadcast::Receiver<RoomFrame> {
        hub.rooms()
            .get_or_create(doc)
            .await
            .add_member(MemberInfo {
                connection_id: Uuid::new_v4(),
                user_id: UserId::new("peer"),
            })
            .await
    }

    #[tokio::test]
    async fn test_update_is_logged_then_broadcast() {
        let store = Arc::new(MemoryLogStore::new());
        let hub = hub_with(store.clone(), DeliveryOrder::AppendThenBroadcast);
        let doc = DocumentId::new("doc1");
        let mut rx = join(&hub, &doc).await;
        let origin = Uuid::new_v4();
        let update = fragment(&Replica::new(), "hello");

        let outcome = hub.submit_update(origin, &doc, &update).await.unwrap();
        assert!(outcome.entry.is_some());
        assert_eq!(outcome.delivered, 1);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.origin, Some(origin));
        match ServerMessage::decode(&frame.bytes).unwrap() {
            ServerMessage::Update { fragment: f, .. } => assert_eq!(f, update),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.list_active(&doc).unwrap()[0].payload, update);
        assert_eq!(hub.cache().get(&doc).await.unwrap().text("content"), "hello");
    }

    #[tokio::test]
    async fn test_malformed_update_not_logged_nor_broadcast() {
        let store = Arc::new(MemoryLogStore::new());
        let hub = hub_with(store.clone(), DeliveryOrder::AppendThenBroadcast);
        let doc = DocumentId::new("doc1");
        let mut rx = join(&hub, &doc).await;
        hub.submit_update(Uuid::new_v4(), &doc, &fragment(&Replica::new(), "ok"))
            .await
            .unwrap();
        rx.recv().await.unwrap();
        let before = hub.cache().snapshot(&doc).await.unwrap();

        let err = hub
            .submit_update(Uuid::new_v4(), &doc, &[0xFF, 0xFE, 0xFD])
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Malformed(_)));
        assert_eq!(store.list_active(&doc).unwrap().len(), 1);
        assert_eq!(hub.cache().snapshot(&doc).await.unwrap(), before);
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.stats().updates_rejected, 1);
    }

    #[tokio::test]
    async fn test_transient_append_failure_is_retried() {
        let store = Arc::new(FlakyStore::new(2));
        let hub = hub_with(store.clone(), DeliveryOrder::AppendThenBroadcast);
        let doc = DocumentId::new("doc1");

        let outcome = hub
            .submit_update(Uuid::new_v4(), &doc, &fragment(&Replica::new(), "x"))
            .await
            .unwrap();
        assert!(outcome.entry.is_some());
        assert_eq!(store.list_active(&doc).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_append_reverts_and_skips_broadcast() {
        let store = Arc::new(FlakyStore::new(10));
        let hub = hub_with(store.clone(), DeliveryOrder::AppendThenBroadcast);
        let doc = DocumentId::new("doc1");
        let mut rx = join(&hub, &doc).await;

        let err = hub
            .submit_update(Uuid::new_v4(), &doc, &fragment(&Replica::new(), "lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::NotPersisted(_)));
        assert!(rx.try_recv().is_err());
        assert!(!hub.cache().contains(&doc).await);
        assert_eq!(hub.cache().get(&doc).await.unwrap().text("content"), "");
        assert_eq!(hub.stats().appends_failed, 1);
    }

    #[tokio::test]
    async fn test_broadcast_first_accepts_loss() {
        let store = Arc::new(FlakyStore::new(10));
        let hub = hub_with(store.clone(), DeliveryOrder::BroadcastThenAppend);
        let doc = DocumentId::new("doc1");
        let mut rx = join(&hub, &doc).await;

        let outcome = hub
            .submit_update(Uuid::new_v4(), &doc, &fragment(&Replica::new(), "seen"))
            .await
            .unwrap();
        assert!(outcome.entry.is_none());
        assert_eq!(outcome.delivered, 1);
        assert!(rx.recv().await.is_ok());
        assert!(store.list_active(&doc).unwrap().is_empty());
    }

    fn owned_hub() -> (Arc<MemoryLogStore>, CollabHub) {
        let store = Arc::new(MemoryLogStore::new());
        let directory = MemoryDirectory::new().with_project(
            ProjectInfo::new("p1", "Plans", UserId::new("owner")).with_member(UserId::new("editor")),
        );
        let hub = CollabHub::new(
            HubConfig::for_testing(),
            store.clone(),
            Arc::new(TokenAsUser),
            Arc::new(directory),
        );
        (store, hub)
    }

    #[tokio::test]
    async fn test_rollback_api_status_codes() {
        let (store, hub) = owned_hub();
        let doc = DocumentId::new("p1");
        let author = Replica::new();
        store.append_at(&doc, &fragment(&author, "a"), Timestamp::from_millis(10)).unwrap();
        store.append_at(&doc, &fragment(&author, "b"), Timestamp::from_millis(20)).unwrap();

        let request = |cutoff: &str| RollbackRequest {
            document_id: doc.clone(),
            cutoff_timestamp: cutoff.to_string(),
        };

        let err = hub.rollback(&UserId::new("editor"), request("15")).await.unwrap_err();
        assert_eq!(err.status_code(), 403);

        let err = hub.rollback(&UserId::new("owner"), request("soon")).await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let ok = hub.rollback(&UserId::new("owner"), request("15")).await.unwrap();
        assert_eq!(ok.archived_count, 1);

        let err = hub.rollback(&UserId::new("owner"), request("15")).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.message(), "Nothing to roll back after that time");

        let missing = RollbackRequest {
            document_id: DocumentId::new("nope"),
            cutoff_timestamp: "15".into(),
        };
        assert_eq!(hub.rollback(&UserId::new("owner"), missing).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_history_requires_membership() {
        let (store, hub) = owned_hub();
        let doc = DocumentId::new("p1");
        let a = store.append_at(&doc, b"a", Timestamp::from_millis(10)).unwrap();
        let b = store.append_at(&doc, b"b", Timestamp::from_millis(20)).unwrap();

        let history = hub.history(&UserId::new("editor"), &doc).await.unwrap();
        let ids: Vec<u64> = history.iter().map(|h| h.entry_id).collect();
        assert_eq!(ids, vec![b.id, a.id]);

        let err = hub.history(&UserId::new("stranger"), &doc).await.unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_rollback_json_shapes() {
        let request: RollbackRequest =
            serde_json::from_str(r#"{"documentId":"p1","cutoffTimestamp":"2024-01-01T00:00:00Z"}"#)
                .unwrap();
        assert_eq!(request.document_id, DocumentId::new("p1"));

        let response = serde_json::to_string(&RollbackResponse { archived_count: 3 }).unwrap();
        assert_eq!(response, r#"{"archivedCount":3}"#);

        let body = serde_json::to_string(&ApiError::Unavailable("down".into()).body()).unwrap();
        assert_eq!(body, r#"{"error":"down"}"#);
    }

    #[test]
    fn test_store_error_maps_to_status() {
        assert_eq!(ApiError::from(StoreError::Unavailable("x".into())).status_code(), 503);
        assert_eq!(ApiError::from(StoreError::DeserializationError("x".into())).status_code(), 500);
    }

    #[test]
    fn test_delivery_order_parse() {
        assert_eq!(
            "append-then-broadcast".parse::<DeliveryOrder>(),
            Ok(DeliveryOrder::AppendThenBroadcast)
        );
        assert_eq!(
            "Broadcast".parse::<DeliveryOrder>(),
            Ok(DeliveryOrder::BroadcastThenAppend)
        );
        assert!("sideways".parse::<DeliveryOrder>().is_err());
    }

    #[tokio::test]
    async fn test_snapshot_all_saves_resident_documents() {
        let store = Arc::new(MemoryLogStore::new());
        let hub = hub_with(store.clone(), DeliveryOrder::AppendThenBroadcast);
        let doc = DocumentId::new("doc1");
        hub.submit_update(Uuid::new_v4(), &doc, &fragment(&Replica::new(), "saved"))
            .await
            .unwrap();

        assert_eq!(hub.snapshot_all().await, 1);
        let saved = hub.last_snapshot(&UserId::new("peer"), &doc).unwrap().unwrap();
        assert_eq!(Replica::from_snapshot(&saved).unwrap().text("content"), "saved");
        assert_eq!(hub.stats().snapshots_saved, 1);
    }

    #[tokio::test]
    async fn test_snapshot_all_skips_evicted_documents() {
        let store = Arc::new(MemoryLogStore::new());
        let hub = hub_with(store.clone(), DeliveryOrder::AppendThenBroadcast);
        let doc = DocumentId::new("doc1");
        hub.submit_update(Uuid::new_v4(), &doc, &fragment(&Replica::new(), "gone"))
            .await
            .unwrap();
        hub.cache().evict(&doc).await;

        let rebuilt_before = hub.cache().stats().reconstructions;
        assert_eq!(hub.snapshot_all().await, 0);
        assert_eq!(hub.cache().stats().reconstructions, rebuilt_before);
        assert!(store.load_snapshot(&doc).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_snapshot_requires_membership() {
        let (store, hub) = owned_hub();
        let doc = DocumentId::new("p1");
        store.save_snapshot(&doc, b"state").unwrap();

        assert_eq!(
            hub.last_snapshot(&UserId::new("editor"), &doc).unwrap(),
            Some(b"state".to_vec())
        );
        let err = hub.last_snapshot(&UserId::new("stranger"), &doc).unwrap_err();
        assert_eq!(err.status_code(), 403);
        let err = hub
            .last_snapshot(&UserId::new("editor"), &DocumentId::new("nope"))
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
