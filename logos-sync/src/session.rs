//! Per-connection protocol state machine.
//!
//! ```text
//! Connected ──Authenticate──► Authenticated ──Join──► Joined ──SyncRequest──► Active
//!     │ bad token                    ▲                  │                       │
//!     └──► closed                    └──── Leave ───────┴───────────────────────┘
//!
//! any state ── socket closed ──► Disconnected
//! ```
//!
//! A session knows nothing about sockets. It consumes decoded
//! [`ClientMessage`]s and writes encoded [`ServerMessage`]s into an
//! outbox; the server's writer task turns those into WebSocket frames.
//! Messages from one connection are handled one at a time, so a
//! connection's updates reach the hub in the order they arrived.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastGroup, MemberInfo, RoomFrame};
use crate::directory::Access;
use crate::hub::{CollabHub, UpdateError};
use crate::protocol::{ClientMessage, Frame, ProtocolError, RejectKind, ServerMessage};
use crate::types::{ConnectionId, DocumentId, UserId};

/// Encoded server frames waiting for the socket writer.
pub type Outbox = mpsc::Sender<Arc<Vec<u8>>>;

/// Reason sent when a forwarder falls behind its room.
pub const LAGGED_REASON: &str = "connection fell behind";

/// Reason sent when an update could not be made durable.
pub const NOT_PERSISTED_REASON: &str = "update was not persisted";

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated,
    /// Member of at least one room, no full sync sent yet
    Joined,
    /// Received a full sync of at least one joined document
    Active,
    Disconnected,
}

/// What the transport should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

struct Membership {
    room: Arc<BroadcastGroup>,
    forwarder: JoinHandle<()>,
    synced: bool,
}

/// One client connection.
pub struct Session {
    connection_id: ConnectionId,
    hub: Arc<CollabHub>,
    outbox: Outbox,
    user: Option<UserId>,
    rooms: HashMap<DocumentId, Membership>,
    disconnected: bool,
}

impl Session {
    pub fn new(connection_id: ConnectionId, hub: Arc<CollabHub>, outbox: Outbox) -> Self {
        Self {
            connection_id,
            hub,
            outbox,
            user: None,
            rooms: HashMap::new(),
            disconnected: false,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    pub fn state(&self) -> SessionState {
        if self.disconnected {
            SessionState::Disconnected
        } else if self.user.is_none() {
            SessionState::Connected
        } else if self.rooms.is_empty() {
            SessionState::Authenticated
        } else if self.rooms.values().any(|m| m.synced) {
            SessionState::Active
        } else {
            SessionState::Joined
        }
    }

    pub fn is_member(&self, document_id: &DocumentId) -> bool {
        self.rooms.contains_key(document_id)
    }

    /// Handle one client message.
    ///
    /// Errors only when the outbox is gone, i.e. the connection is dead.
    pub async fn handle(&mut self, msg: ClientMessage) -> Result<Flow, ProtocolError> {
        if self.disconnected {
            return Err(ProtocolError::ConnectionClosed);
        }
        match msg {
            ClientMessage::Authenticate { token } => self.on_authenticate(&token).await,
            ClientMessage::Ping => {
                self.send(&ServerMessage::Pong).await?;
                Ok(Flow::Continue)
            }
            other => {
                let Some(user) = self.user.clone() else {
                    self.reject(
                        document_of(&other),
                        RejectKind::Unauthenticated,
                        "authenticate first",
                    )
                    .await?;
                    return Ok(Flow::Continue);
                };
                match other {
                    ClientMessage::Join { document_id } => self.on_join(user, document_id).await?,
                    ClientMessage::Leave { document_id } => self.on_leave(document_id).await?,
                    ClientMessage::SyncRequest { document_id } => self.on_sync_request(document_id).await?,
                    ClientMessage::Update { document_id, fragment } => {
                        self.on_update(document_id, fragment).await?
                    }
                    ClientMessage::Authenticate { .. } | ClientMessage::Ping => {}
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// Leave every room and stop all forwarders.
    pub async fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        let joined: Vec<DocumentId> = self.rooms.keys().cloned().collect();
        for document_id in joined {
            self.leave_room(&document_id).await;
        }
        self.disconnected = true;
        log::info!(
            "Connection {} ({}) disconnected",
            self.connection_id,
            self.user.as_ref().map_or("anonymous", |u| u.as_str())
        );
    }

    // ─── Handlers ─────────────────────────────────────────────────────

    async fn on_authenticate(&mut self, token: &str) -> Result<Flow, ProtocolError> {
        match self.hub.authenticate(token) {
            Some(user) => {
                log::info!("Connection {} authenticated as {user}", self.connection_id);
                self.user = Some(user.clone());
                self.send(&ServerMessage::Authenticated {
                    connection_id: self.connection_id,
                    user_id: user,
                })
                .await?;
                Ok(Flow::Continue)
            }
            None => {
                log::warn!("Connection {} failed authentication", self.connection_id);
                self.reject(None, RejectKind::Unauthenticated, "invalid token").await?;
                Ok(Flow::Close)
            }
        }
    }

    async fn on_join(&mut self, user: UserId, document_id: DocumentId) -> Result<(), ProtocolError> {
        if self.is_member(&document_id) {
            return self.send(&ServerMessage::Joined { document_id }).await;
        }
        if !document_id.is_valid() {
            return self
                .reject(Some(document_id), RejectKind::Forbidden, "invalid document id")
                .await;
        }
        if let Err(e) = self.hub.authorize(&user, &document_id, Access::Join) {
            log::warn!("{user} may not join {document_id}: {e}");
            return self
                .reject(Some(document_id), RejectKind::Forbidden, e.to_string())
                .await;
        }

        let room = self.hub.rooms().get_or_create(&document_id).await;
        let rx = room
            .add_member(MemberInfo {
                connection_id: self.connection_id,
                user_id: user.clone(),
            })
            .await;
        let forwarder = tokio::spawn(forward(
            rx,
            self.outbox.clone(),
            self.connection_id,
            room.clone(),
        ));
        self.rooms.insert(
            document_id.clone(),
            Membership {
                room: room.clone(),
                forwarder,
                synced: false,
            },
        );

        self.send(&ServerMessage::Joined {
            document_id: document_id.clone(),
        })
        .await?;
        let joined = ServerMessage::MemberJoined {
            document_id: document_id.clone(),
            user_id: user.clone(),
        };
        if let Err(e) = room.broadcast(Some(self.connection_id), &joined) {
            log::warn!("Failed to announce {user} in {document_id}: {e}");
        }
        log::info!("{user} ({}) joined {document_id}", self.connection_id);
        Ok(())
    }

    async fn on_leave(&mut self, document_id: DocumentId) -> Result<(), ProtocolError> {
        if !self.is_member(&document_id) {
            return self
                .reject(Some(document_id), RejectKind::NotJoined, "not a member of this document")
                .await;
        }
        self.leave_room(&document_id).await;
        self.send(&ServerMessage::Left { document_id }).await
    }

    async fn on_sync_request(&mut self, document_id: DocumentId) -> Result<(), ProtocolError> {
        if !self.is_member(&document_id) {
            return self
                .reject(Some(document_id), RejectKind::NotJoined, "join before syncing")
                .await;
        }
        match self.hub.cache().snapshot(&document_id).await {
            Ok(snapshot) => {
                self.send(&ServerMessage::FullSync {
                    document_id: document_id.clone(),
                    snapshot,
                })
                .await?;
                if let Some(membership) = self.rooms.get_mut(&document_id) {
                    membership.synced = true;
                }
                Ok(())
            }
            Err(e) => {
                log::error!("Full sync of {document_id} failed: {e}");
                self.reject(Some(document_id), RejectKind::SyncFailed, e.to_string())
                    .await
            }
        }
    }

    async fn on_update(&mut self, document_id: DocumentId, fragment: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.is_member(&document_id) {
            return self
                .reject(Some(document_id), RejectKind::NotJoined, "join before editing")
                .await;
        }
        match self
            .hub
            .submit_update(self.connection_id, &document_id, &fragment)
            .await
        {
            Ok(outcome) => {
                log::trace!(
                    "Update for {document_id} from {} delivered to {} receivers",
                    self.connection_id,
                    outcome.delivered
                );
                Ok(())
            }
            Err(UpdateError::Malformed(e)) => {
                self.reject(Some(document_id), RejectKind::MalformedUpdate, e.to_string())
                    .await
            }
            Err(UpdateError::Unavailable(e)) => {
                self.reject(Some(document_id), RejectKind::SyncFailed, e.to_string())
                    .await
            }
            Err(UpdateError::NotPersisted(_)) => {
                self.send(&ServerMessage::ForceResync {
                    document_id,
                    reason: NOT_PERSISTED_REASON.to_string(),
                })
                .await
            }
            Err(UpdateError::Encode(e)) => {
                log::error!("Failed to encode update for {document_id}: {e}");
                Ok(())
            }
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    async fn leave_room(&mut self, document_id: &DocumentId) {
        let Some(membership) = self.rooms.remove(document_id) else {
            return;
        };
        membership.forwarder.abort();
        let room = membership.room;
        if let Some(info) = room.remove_member(&self.connection_id).await {
            let left = ServerMessage::MemberLeft {
                document_id: document_id.clone(),
                user_id: info.user_id,
            };
            if let Err(e) = room.broadcast(Some(self.connection_id), &left) {
                log::warn!("Failed to announce departure from {document_id}: {e}");
            }
        }
        self.hub.rooms().remove_if_empty(document_id).await;
    }

    async fn send(&self, msg: &ServerMessage) -> Result<(), ProtocolError> {
        let bytes = msg.encode()?;
        self.outbox
            .send(Arc::new(bytes))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn reject(
        &self,
        document_id: Option<DocumentId>,
        kind: RejectKind,
        reason: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(&ServerMessage::rejected(document_id, kind, reason))
            .await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for membership in self.rooms.values() {
            membership.forwarder.abort();
        }
    }
}

fn document_of(msg: &ClientMessage) -> Option<DocumentId> {
    match msg {
        ClientMessage::Join { document_id }
        | ClientMessage::Leave { document_id }
        | ClientMessage::SyncRequest { document_id }
        | ClientMessage::Update { document_id, .. } => Some(document_id.clone()),
        ClientMessage::Authenticate { .. } | ClientMessage::Ping => None,
    }
}

/// Copy room frames into a connection's outbox, skipping its own.
async fn forward(
    mut rx: broadcast::Receiver<RoomFrame>,
    outbox: Outbox,
    connection_id: ConnectionId,
    room: Arc<BroadcastGroup>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if !frame.is_for(&connection_id) {
                    continue;
                }
                if outbox.send(frame.bytes).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                room.record_dropped(skipped);
                log::warn!(
                    "Connection {connection_id} lagged by {skipped} frames in {}, forcing resync",
                    room.document_id()
                );
                let resync = ServerMessage::ForceResync {
                    document_id: room.document_id().clone(),
                    reason: LAGGED_REASON.to_string(),
                };
                match resync.encode() {
                    Ok(bytes) => {
                        if outbox.send(Arc::new(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("Failed to encode resync notice: {e}"),
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}
