//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (authenticate, join, initial full sync)
//! - Local edits turned into update fragments and sent to the server
//! - Remote fragments merged into the local replica
//! - Forced resync: local state discarded, full sync requested again
//! - Offline queue for edits made while disconnected

use std::collections::VecDeque;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use yrs::TransactionMut;

use crate::protocol::{ClientMessage, Frame, ProtocolError, RejectKind, ServerMessage};
use crate::replica::Replica;
use crate::types::{ConnectionId, DocumentId, UserId};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Authenticated {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    Joined,
    /// A full sync was merged into the local replica
    Synced,
    /// A fragment from another member was merged
    RemoteUpdate(Vec<u8>),
    /// Local state was discarded; a new full sync is on its way
    ResyncForced(String),
    MemberJoined(UserId),
    MemberLeft(UserId),
    Rejected { kind: RejectKind, reason: String },
    Pong,
    Disconnected,
}

/// Offline queue for edits made while disconnected.
///
/// Queued fragments are replayed, in order, after the next connect.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a fragment. Returns false when full.
    pub fn enqueue(&mut self, fragment: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(fragment);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

/// The sync client for one document.
pub struct SyncClient {
    token: String,
    document_id: DocumentId,
    server_url: String,

    /// Local copy of the document
    replica: Arc<RwLock<Replica>>,
    state: Arc<RwLock<ConnectionState>>,
    connection_id: Arc<RwLock<Option<ConnectionId>>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(
        token: impl Into<String>,
        document_id: impl Into<DocumentId>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            token: token.into(),
            document_id: document_id.into(),
            server_url: server_url.into(),
            replica: Arc::new(RwLock::new(Replica::new())),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connection_id: Arc::new(RwLock::new(None)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, authenticate, join and request a full sync.
    ///
    /// Edits queued while offline are sent right after the join.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: outgoing channel → socket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx.clone());

        let document_id = self.document_id.clone();
        for msg in [
            ClientMessage::Authenticate {
                token: self.token.clone(),
            },
            ClientMessage::Join {
                document_id: document_id.clone(),
            },
            ClientMessage::SyncRequest {
                document_id: document_id.clone(),
            },
        ] {
            self.send(&msg).await?;
        }

        *self.state.write().await = ConnectionState::Connected;

        // Replay offline queue
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
            for fragment in queued {
                self.send(&ClientMessage::Update {
                    document_id: document_id.clone(),
                    fragment,
                })
                .await?;
            }
        }

        // Reader task: socket → replica + events
        let reader = Reader {
            document_id,
            replica: self.replica.clone(),
            connection_id: self.connection_id.clone(),
            outgoing_tx: out_tx.downgrade(),
            event_tx: self.event_tx.clone(),
        };
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => reader.handle(server_msg).await,
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Edit the local replica and send the resulting fragment.
    pub async fn edit<F>(&self, f: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let fragment = self.replica.read().await.edit(f);
        self.send_update(fragment).await
    }

    /// Send an update fragment, or queue it while offline.
    pub async fn send_update(&self, fragment: Vec<u8>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(fragment) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        self.send(&ClientMessage::Update {
            document_id: self.document_id.clone(),
            fragment,
        })
        .await
    }

    pub async fn request_sync(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::SyncRequest {
            document_id: self.document_id.clone(),
        })
        .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Leave the document and close the connection.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        let result = self
            .send(&ClientMessage::Leave {
                document_id: self.document_id.clone(),
            })
            .await;
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        result
    }

    /// Current content of a root text of the local replica.
    pub async fn text(&self, name: &str) -> String {
        self.replica.read().await.text(name)
    }

    /// Full state of the local replica.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.replica.read().await.encode_snapshot()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn connection_id(&self) -> Option<ConnectionId> {
        *self.connection_id.read().await
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

/// State shared with the reader task.
struct Reader {
    document_id: DocumentId,
    replica: Arc<RwLock<Replica>>,
    connection_id: Arc<RwLock<Option<ConnectionId>>>,
    /// Weak so that `disconnect` closing the channel closes the socket
    outgoing_tx: mpsc::WeakSender<Vec<u8>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl Reader {
    async fn handle(&self, msg: ServerMessage) {
        if let Some(document_id) = msg.document_id() {
            if document_id != &self.document_id {
                log::debug!("Ignoring message for {document_id}");
                return;
            }
        }
        let event = match msg {
            ServerMessage::Authenticated { connection_id, user_id } => {
                *self.connection_id.write().await = Some(connection_id);
                Some(SyncEvent::Authenticated { connection_id, user_id })
            }
            ServerMessage::Joined { .. } => Some(SyncEvent::Joined),
            ServerMessage::Left { .. } => None,
            ServerMessage::FullSync { snapshot, .. } => {
                match self.replica.read().await.apply_update(&snapshot) {
                    Ok(()) => Some(SyncEvent::Synced),
                    Err(e) => {
                        log::error!("Full sync of {} could not be applied: {e}", self.document_id);
                        None
                    }
                }
            }
            ServerMessage::Update { fragment, .. } => {
                match self.replica.read().await.apply_update(&fragment) {
                    Ok(()) => Some(SyncEvent::RemoteUpdate(fragment)),
                    Err(e) => {
                        log::warn!("Remote update for {} dropped: {e}", self.document_id);
                        None
                    }
                }
            }
            ServerMessage::ForceResync { reason, .. } => {
                log::info!("Resync of {} forced: {reason}", self.document_id);
                *self.replica.write().await = Replica::new();
                let request = ClientMessage::SyncRequest {
                    document_id: self.document_id.clone(),
                };
                match (request.encode(), self.outgoing_tx.upgrade()) {
                    (Ok(bytes), Some(tx)) => {
                        let _ = tx.send(bytes).await;
                    }
                    (Ok(_), None) => log::debug!("Connection closed before resync request"),
                    (Err(e), _) => log::error!("Failed to encode sync request: {e}"),
                }
                Some(SyncEvent::ResyncForced(reason))
            }
            ServerMessage::MemberJoined { user_id, .. } => Some(SyncEvent::MemberJoined(user_id)),
            ServerMessage::MemberLeft { user_id, .. } => Some(SyncEvent::MemberLeft(user_id)),
            ServerMessage::Rejected { kind, reason, .. } => {
                log::warn!("Server rejected a message ({kind:?}): {reason}");
                Some(SyncEvent::Rejected { kind, reason })
            }
            ServerMessage::Pong => Some(SyncEvent::Pong),
        };
        if let Some(event) = event {
            let _ = self.event_tx.send(event).await;
        }
    }
}
