//! Document cache: at most one live replica per document.
//!
//! Each document gets a slot guarded by its own async `RwLock`:
//!
//! ```text
//!   slots: DocumentId ──► Arc<RwLock<Option<Arc<Replica>>>>
//!                                     │
//!        read  ── snapshot encode, hit path of get()
//!        write ── miss (reconstruct), apply, evict
//! ```
//!
//! A miss takes the slot's write lock and re-checks before rebuilding, so
//! concurrent misses for one document wait on the first and reuse its
//! replica instead of replaying the log again. Writers (apply + append,
//! archive + evict) hold the same write lock through [`DocumentLock`],
//! which keeps eviction from racing an in-flight apply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::reconstruct::{ReconstructionEngine, ReconstructionError};
use crate::replica::{MergeError, Replica};
use crate::storage::UpdateLogStore;
use crate::types::DocumentId;

type Slot = RwLock<Option<Arc<Replica>>>;

/// Cache errors.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// Building the replica from the log failed
    Reconstruction(ReconstructionError),
    /// The update fragment was rejected; the replica kept its prior state
    Malformed(MergeError),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Reconstruction(e) => write!(f, "Reconstruction failed: {e}"),
            CacheError::Malformed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<ReconstructionError> for CacheError {
    fn from(e: ReconstructionError) -> Self {
        CacheError::Reconstruction(e)
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub reconstructions: u64,
}

/// Owned registry of live replicas.
pub struct DocumentCache {
    engine: ReconstructionEngine,
    slots: RwLock<HashMap<DocumentId, Arc<Slot>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DocumentCache {
    pub fn new(store: Arc<dyn UpdateLogStore>) -> Self {
        Self {
            engine: ReconstructionEngine::new(store),
            slots: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Live replica for `document_id`, reconstructing it on a miss.
    pub async fn get(&self, document_id: &DocumentId) -> Result<Arc<Replica>, CacheError> {
        let slot = self.slot(document_id).await;
        {
            let guard = slot.read().await;
            if let Some(replica) = guard.as_ref() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(replica.clone());
            }
        }
        let mut guard = slot.write().await;
        self.populate(document_id, &mut guard)
    }

    /// Full-state encoding of the document, taken under the read lock.
    pub async fn snapshot(&self, document_id: &DocumentId) -> Result<Vec<u8>, CacheError> {
        let slot = self.slot(document_id).await;
        {
            let guard = slot.read().await;
            if let Some(replica) = guard.as_ref() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(replica.encode_snapshot());
            }
        }
        let mut guard = slot.write().await;
        let replica = self.populate(document_id, &mut guard)?;
        let _read = guard.downgrade();
        Ok(replica.encode_snapshot())
    }

    /// Drop the cached replica, if any. The log is untouched.
    pub async fn evict(&self, document_id: &DocumentId) -> bool {
        let Some(slot) = self.existing_slot(document_id).await else {
            return false;
        };
        let evicted = {
            let mut guard = slot.write().await;
            self.take(document_id, &mut guard)
        };
        drop(slot);
        self.remove_idle_slot(document_id).await;
        evicted
    }

    /// Full-state encoding of a resident replica. Never rebuilds.
    pub async fn snapshot_if_resident(&self, document_id: &DocumentId) -> Option<Vec<u8>> {
        let slot = self.existing_slot(document_id).await?;
        let guard = slot.read().await;
        guard.as_ref().map(|replica| replica.encode_snapshot())
    }

    /// Drop every slot that holds no replica and that no task is using.
    /// Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| !is_idle(slot));
        let removed = before - slots.len();
        if removed > 0 {
            log::trace!("Pruned {removed} idle cache slots");
        }
        removed
    }

    /// Number of slots currently tracked, resident or not.
    pub async fn slot_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Apply an update fragment to the live replica.
    pub async fn apply_local(&self, document_id: &DocumentId, payload: &[u8]) -> Result<(), CacheError> {
        let mut lock = self.lock(document_id).await;
        lock.apply(payload)
    }

    /// Exclusive access to one document until the returned lock drops.
    pub async fn lock(&self, document_id: &DocumentId) -> DocumentLock<'_> {
        let slot = self.slot(document_id).await;
        DocumentLock {
            cache: self,
            document_id: document_id.clone(),
            guard: slot.write_owned().await,
        }
    }

    /// Whether a replica is currently resident.
    pub async fn contains(&self, document_id: &DocumentId) -> bool {
        let Some(slot) = self.existing_slot(document_id).await else {
            return false;
        };
        let resident = slot.read().await.is_some();
        resident
    }

    /// Identifiers of every resident replica.
    pub async fn resident_documents(&self) -> Vec<DocumentId> {
        let slots: Vec<(DocumentId, Arc<Slot>)> = {
            let slots = self.slots.read().await;
            slots.iter().map(|(id, slot)| (id.clone(), slot.clone())).collect()
        };
        let mut resident = Vec::new();
        for (id, slot) in slots {
            if slot.read().await.is_some() {
                resident.push(id);
            }
        }
        resident
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reconstructions: self.engine.reconstructions(),
        }
    }

    pub fn engine(&self) -> &ReconstructionEngine {
        &self.engine
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get or create the slot for a document.
    async fn slot(&self, document_id: &DocumentId) -> Arc<Slot> {
        // Fast path: read lock
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(document_id) {
                return slot.clone();
            }
        }

        // Slow path: write lock, double-check
        let mut slots = self.slots.write().await;
        slots
            .entry(document_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(None)))
            .clone()
    }

    async fn existing_slot(&self, document_id: &DocumentId) -> Option<Arc<Slot>> {
        self.slots.read().await.get(document_id).cloned()
    }

    /// Remove one slot if it is idle. Holding the map's write lock means
    /// no task can pick the slot up while it is checked.
    async fn remove_idle_slot(&self, document_id: &DocumentId) {
        let mut slots = self.slots.write().await;
        if slots.get(document_id).is_some_and(is_idle) {
            slots.remove(document_id);
        }
    }

    /// Fill an empty slot from the log. Caller holds the slot's write lock.
    fn populate(
        &self,
        document_id: &DocumentId,
        slot: &mut Option<Arc<Replica>>,
    ) -> Result<Arc<Replica>, CacheError> {
        if let Some(replica) = slot.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(replica.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let replica = Arc::new(self.engine.reconstruct(document_id)?);
        *slot = Some(replica.clone());
        log::debug!("Cached replica for {document_id}");
        Ok(replica)
    }

    fn take(&self, document_id: &DocumentId, slot: &mut Option<Arc<Replica>>) -> bool {
        if slot.take().is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            log::debug!("Evicted replica for {document_id}");
            true
        } else {
            false
        }
    }
}

/// Empty, unlocked, and referenced only by the slot map.
fn is_idle(slot: &Arc<Slot>) -> bool {
    Arc::strong_count(slot) == 1 && slot.try_read().is_ok_and(|guard| guard.is_none())
}

/// Exclusive per-document guard.
///
/// While held, no other task can apply to, rebuild, evict or snapshot the
/// document, so apply + append (or archive + evict) run as one unit.
pub struct DocumentLock<'a> {
    cache: &'a DocumentCache,
    document_id: DocumentId,
    guard: OwnedRwLockWriteGuard<Option<Arc<Replica>>>,
}

impl DocumentLock<'_> {
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// The live replica, reconstructing it if the slot is empty.
    pub fn replica(&mut self) -> Result<Arc<Replica>, CacheError> {
        self.cache.populate(&self.document_id, &mut self.guard)
    }

    /// Apply an update fragment.
    ///
    /// A fragment that fails to decode leaves the replica untouched. If it
    /// decodes but Yrs refuses it, the replica is evicted so the next
    /// access rebuilds the pre-apply state from the log.
    pub fn apply(&mut self, payload: &[u8]) -> Result<(), CacheError> {
        let replica = self.replica()?;
        match replica.apply_update(payload) {
            Ok(()) => Ok(()),
            Err(e @ MergeError::Decode(_)) => Err(CacheError::Malformed(e)),
            Err(e) => {
                log::warn!(
                    "Update rejected mid-apply for {}, discarding replica: {e}",
                    self.document_id
                );
                self.evict();
                Err(CacheError::Malformed(e))
            }
        }
    }

    /// Evict the replica while still holding the lock.
    pub fn evict(&mut self) -> bool {
        self.cache.take(&self.document_id, &mut self.guard)
    }

    pub fn is_resident(&self) -> bool {
        self.guard.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStore;
    use crate::types::Timestamp;
    use yrs::{GetString, Text, WriteTxn};

    fn fragment(author: &Replica, text: &str) -> Vec<u8> {
        author.edit(|txn| {
            let root = txn.get_or_insert_text("content");
            let len = root.get_string(&*txn).len() as u32;
            root.insert(txn, len, text);
        })
    }

    fn setup() -> (Arc<MemoryLogStore>, Arc<DocumentCache>) {
        let store = Arc::new(MemoryLogStore::new());
        let cache = Arc::new(DocumentCache::new(store.clone()));
        (store, cache)
    }

    #[tokio::test]
    async fn test_get_miss_then_hit() {
        let (_store, cache) = setup();
        let doc = DocumentId::new("doc1");

        let first = cache.get(&doc).await.unwrap();
        let second = cache.get(&doc).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.reconstructions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_coalesce() {
        let (store, cache) = setup();
        let doc = DocumentId::new("never-seen");
        let author = Replica::new();
        for i in 0..50 {
            store
                .append_at(&doc, &fragment(&author, "x"), Timestamp::from_millis(i))
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let doc = doc.clone();
            handles.push(tokio::spawn(async move { cache.get(&doc).await.unwrap() }));
        }
        let mut replicas = Vec::new();
        for handle in handles {
            replicas.push(handle.await.unwrap());
        }

        assert_eq!(cache.engine().reconstructions(), 1);
        assert!(replicas.iter().all(|r| Arc::ptr_eq(r, &replicas[0])));
        assert_eq!(replicas[0].text("content").len(), 50);
    }

    #[tokio::test]
    async fn test_evict_forces_reconstruction() {
        let (_store, cache) = setup();
        let doc = DocumentId::new("doc1");

        let before = cache.get(&doc).await.unwrap();
        assert!(cache.evict(&doc).await);
        assert!(!cache.contains(&doc).await);
        let after = cache.get(&doc).await.unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(cache.stats().reconstructions, 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_evict_absent_is_noop() {
        let (_store, cache) = setup();
        assert!(!cache.evict(&DocumentId::new("missing")).await);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_apply_local_updates_replica_only() {
        let (store, cache) = setup();
        let doc = DocumentId::new("doc1");
        let author = Replica::new();

        cache.apply_local(&doc, &fragment(&author, "hi")).await.unwrap();
        assert_eq!(cache.get(&doc).await.unwrap().text("content"), "hi");
        // The cache never writes the log
        assert!(store.list_active(&doc).unwrap().is_empty());

        // Unlogged edits do not survive eviction: the log is authoritative
        cache.evict(&doc).await;
        assert_eq!(cache.get(&doc).await.unwrap().text("content"), "");
    }

    #[tokio::test]
    async fn test_malformed_update_leaves_snapshot_unchanged() {
        let (_store, cache) = setup();
        let doc = DocumentId::new("doc1");
        let author = Replica::new();
        cache.apply_local(&doc, &fragment(&author, "ok")).await.unwrap();
        let before = cache.snapshot(&doc).await.unwrap();

        let err = cache.apply_local(&doc, &[0xFF, 0xFE, 0xFD]).await.unwrap_err();
        assert!(matches!(err, CacheError::Malformed(MergeError::Decode(_))));
        assert_eq!(cache.snapshot(&doc).await.unwrap(), before);
        assert!(cache.contains(&doc).await);
    }

    #[tokio::test]
    async fn test_snapshot_reconstructs_on_miss() {
        let (store, cache) = setup();
        let doc = DocumentId::new("doc1");
        let author = Replica::new();
        store.append(&doc, &fragment(&author, "from log")).unwrap();

        let snapshot = cache.snapshot(&doc).await.unwrap();
        let loaded = Replica::from_snapshot(&snapshot).unwrap();
        assert_eq!(loaded.text("content"), "from log");
        assert_eq!(cache.resident_documents().await, vec![doc]);
    }

    #[tokio::test]
    async fn test_lock_evict_under_guard() {
        let (_store, cache) = setup();
        let doc = DocumentId::new("doc1");
        cache.get(&doc).await.unwrap();

        let mut lock = cache.lock(&doc).await;
        assert!(lock.is_resident());
        assert!(lock.evict());
        assert!(!lock.evict());
        drop(lock);

        assert!(!cache.contains(&doc).await);
    }

    #[tokio::test]
    async fn test_reconstruction_failure_surfaces() {
        let (store, cache) = setup();
        let doc = DocumentId::new("corrupt");
        store.append(&doc, &[0xFF, 0xFE, 0xFD]).unwrap();

        let err = cache.get(&doc).await.unwrap_err();
        assert!(matches!(err, CacheError::Reconstruction(_)));
        assert!(!cache.contains(&doc).await);
    }

    #[tokio::test]
    async fn test_evicted_slots_are_released() {
        let (_store, cache) = setup();
        for i in 0..10 {
            let doc = DocumentId::new(format!("doc{i}"));
            cache.get(&doc).await.unwrap();
            cache.evict(&doc).await;
        }
        assert_eq!(cache.slot_count().await, 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_slots_in_use() {
        let (store, cache) = setup();
        let failed = DocumentId::new("corrupt");
        store.append(&failed, &[0xFF, 0xFE, 0xFD]).unwrap();
        assert!(cache.get(&failed).await.is_err());

        let resident = DocumentId::new("resident");
        cache.get(&resident).await.unwrap();

        let locked = DocumentId::new("locked");
        let mut lock = cache.lock(&locked).await;
        lock.evict();

        assert_eq!(cache.slot_count().await, 3);
        assert_eq!(cache.prune().await, 1);
        assert!(cache.contains(&resident).await);
        drop(lock);
        assert_eq!(cache.prune().await, 1);
        assert_eq!(cache.slot_count().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_if_resident_never_rebuilds() {
        let (store, cache) = setup();
        let doc = DocumentId::new("doc1");
        store.append(&doc, &fragment(&Replica::new(), "logged")).unwrap();

        assert!(cache.snapshot_if_resident(&doc).await.is_none());
        assert_eq!(cache.stats().reconstructions, 0);
        assert_eq!(cache.slot_count().await, 0);

        cache.get(&doc).await.unwrap();
        let snapshot = cache.snapshot_if_resident(&doc).await.unwrap();
        assert_eq!(Replica::from_snapshot(&snapshot).unwrap().text("content"), "logged");
    }
}
