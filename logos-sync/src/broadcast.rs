//! Per-document rooms with fan-out to every member.
//!
//! Each room owns one tokio broadcast channel. Frames are encoded once
//! and shared as `Arc<Vec<u8>>`; every member's forwarder holds its own
//! receiver buffering up to `capacity` frames. A forwarder that falls
//! further behind than that lags, and its connection is told to resync.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{Frame, ProtocolError, ServerMessage};
use crate::types::{ConnectionId, DocumentId, UserId};

/// One encoded server message travelling through a room.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    /// Connection that caused the frame; its own forwarder skips it
    pub origin: Option<ConnectionId>,
    pub bytes: Arc<Vec<u8>>,
}

impl RoomFrame {
    /// Whether the frame should be delivered to `connection_id`.
    pub fn is_for(&self, connection_id: &ConnectionId) -> bool {
        self.origin.as_ref() != Some(connection_id)
    }
}

/// A connection present in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    document_id: DocumentId,
    sender: broadcast::Sender<RoomFrame>,
    members: RwLock<HashMap<ConnectionId, MemberInfo>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per member before
    /// a slow member starts lagging.
    pub fn new(document_id: DocumentId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            document_id,
            sender,
            members: RwLock::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Add a member. Returns its receiver.
    ///
    /// The receiver only sees frames sent after this call.
    pub async fn add_member(&self, info: MemberInfo) -> broadcast::Receiver<RoomFrame> {
        let mut members = self.members.write().await;
        members.insert(info.connection_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, connection_id: &ConnectionId) -> Option<MemberInfo> {
        let mut members = self.members.write().await;
        members.remove(connection_id)
    }

    /// Encode once and fan out to every receiver.
    ///
    /// Returns the number of receivers, including the origin's, which
    /// filters the frame itself.
    pub fn broadcast(
        &self,
        origin: Option<ConnectionId>,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let frame = RoomFrame {
            origin,
            bytes: Arc::new(msg.encode()?),
        };
        Ok(self.broadcast_raw(frame))
    }

    /// Fan out an already encoded frame.
    pub fn broadcast_raw(&self, frame: RoomFrame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, connection_id: &ConnectionId) -> bool {
        self.members.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let members = self.members.read().await;
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_members: members.len(),
        }
    }
}

/// Room manager: maps document IDs to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<DocumentId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for a document.
    pub async fn get_or_create(&self, document_id: &DocumentId) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(document_id) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(document_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(document_id.clone(), self.default_capacity));
        rooms.insert(document_id.clone(), room.clone());
        log::debug!("Opened room for {document_id}");
        room
    }

    /// Existing room, if any.
    pub async fn get(&self, document_id: &DocumentId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    /// Remove a room once its last member has left.
    pub async fn remove_if_empty(&self, document_id: &DocumentId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(document_id) {
            if room.member_count().await == 0 {
                rooms.remove(document_id);
                log::debug!("Closed room for {document_id}");
                return true;
            }
        }
        false
    }

    /// Tell every member of a document's room to discard local state.
    ///
    /// Returns the number of receivers reached; zero when nobody is
    /// connected.
    pub async fn notify_resync(&self, document_id: &DocumentId, reason: &str) -> Result<usize, ProtocolError> {
        let Some(room) = self.get(document_id).await else {
            return Ok(0);
        };
        let msg = ServerMessage::ForceResync {
            document_id: document_id.clone(),
            reason: reason.to_string(),
        };
        room.broadcast(None, &msg)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
