//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── DocumentCache ── Replica (per doc)
//!            ├── Session ── Hub ───┼── UpdateLogStore (RocksDB | memory)
//! Client B ──┘      │              └── RoomManager ── BroadcastGroup
//!                   │                                     │
//!                outbox ◄──────── forwarder ◄─────────────┘
//!                   │
//!              writer task ──► socket (binary, or base64 text)
//! ```
//!
//! Each connection runs a reader loop feeding its [`Session`] and a writer
//! task draining the session's outbox. A connection that sent a text
//! frame is answered in text frames from then on.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::directory::{IdentityProvider, OpenDirectory, ProjectDirectory, TokenAsUser};
use crate::hub::{CollabHub, DeliveryOrder, HubConfig};
use crate::protocol::{binary_to_text, ClientMessage, Frame};
use crate::session::{Flow, Session};
use crate::storage::{MemoryLogStore, RocksLogStore, StoreConfig, StoreError, UpdateLogStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory log, lost on exit)
    pub storage_path: Option<PathBuf>,
    pub delivery_order: DeliveryOrder,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Encoded frames buffered per connection before forwarders block
    pub outbox_capacity: usize,
    /// Extra append attempts after a transient store failure
    pub append_retries: u32,
    /// Seconds between snapshot saves of resident documents (0 = never)
    pub snapshot_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            delivery_order: DeliveryOrder::AppendThenBroadcast,
            broadcast_capacity: 256,
            outbox_capacity: 256,
            append_retries: 3,
            snapshot_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory log, no periodic snapshots.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            outbox_capacity: 64,
            append_retries: 2,
            snapshot_interval_secs: 0,
            ..Self::default()
        }
    }

    /// Defaults overridden by `LOGOS_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(bind) = lookup("LOGOS_SYNC_BIND") {
            config.bind_addr = bind;
        }
        if let Some(path) = lookup("LOGOS_SYNC_DATA").filter(|p| !p.trim().is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(order) = lookup("LOGOS_SYNC_DELIVERY") {
            config.delivery_order = order
                .parse::<DeliveryOrder>()
                .map_err(|e| ConfigError::new("LOGOS_SYNC_DELIVERY", e))?;
        }
        if let Some(secs) = lookup("LOGOS_SYNC_SNAPSHOT_SECS") {
            config.snapshot_interval_secs = secs
                .trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::new("LOGOS_SYNC_SNAPSHOT_SECS", e.to_string()))?;
        }
        Ok(config)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            delivery_order: self.delivery_order,
            append_retries: self.append_retries,
            broadcast_capacity: self.broadcast_capacity,
            ..HubConfig::default()
        }
    }
}

/// An environment variable with an unusable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: &'static str,
    pub message: String,
}

impl ConfigError {
    fn new(key: &'static str, message: impl Into<String>) -> Self {
        Self {
            key,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<CollabHub>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Open the configured log store and build the hub.
    pub fn new(
        config: ServerConfig,
        identity: Arc<dyn IdentityProvider>,
        directory: Arc<dyn ProjectDirectory>,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn UpdateLogStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksLogStore::open(store_config)?)
            }
            None => {
                log::warn!("No storage path configured, update log is in memory only");
                Arc::new(MemoryLogStore::new())
            }
        };
        let hub = CollabHub::new(config.hub_config(), store, identity, directory);
        Ok(Self::with_hub(config, Arc::new(hub)))
    }

    /// Development server: any token is a user, every document is open.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        Self::new(config, Arc::new(TokenAsUser), Arc::new(OpenDirectory))
    }

    pub fn with_hub(config: ServerConfig, hub: Arc<CollabHub>) -> Self {
        Self {
            config,
            hub,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let snapshots = self.spawn_snapshot_task();

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let outbox_capacity = self.config.outbox_capacity;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, outbox_capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        if let Some(task) = snapshots {
            task.abort();
        }
        result
    }

    /// Periodically save a snapshot of every resident document.
    fn spawn_snapshot_task(&self) -> Option<JoinHandle<()>> {
        if self.config.snapshot_interval_secs == 0 {
            return None;
        }
        let hub = self.hub.clone();
        let period = Duration::from_secs(self.config.snapshot_interval_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                hub.snapshot_all().await;
            }
        }))
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<CollabHub>,
        stats: Arc<AtomicServerStats>,
        outbox_capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection_id = Uuid::new_v4();
        log::info!("WebSocket connection {connection_id} established from {addr}");
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (outbox, mut outbox_rx) = mpsc::channel::<Arc<Vec<u8>>>(outbox_capacity.max(1));
        let text_mode = Arc::new(AtomicBool::new(false));

        // Writer task: outbox → socket
        let writer_text_mode = text_mode.clone();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = outbox_rx.recv().await {
                let msg = if writer_text_mode.load(Ordering::Relaxed) {
                    Message::Text(binary_to_text(&bytes).into())
                } else {
                    Message::Binary(bytes.to_vec().into())
                };
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut session = Session::new(connection_id, hub, outbox);

        while let Some(msg) = ws_receiver.next().await {
            let decoded = match msg {
                Ok(Message::Binary(data)) => {
                    stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                    ClientMessage::decode(&data)
                }
                Ok(Message::Text(text)) => {
                    stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);
                    text_mode.store(true, Ordering::Relaxed);
                    ClientMessage::decode_text(text.as_str())
                }
                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
            };
            stats.total_messages.fetch_add(1, Ordering::Relaxed);

            let msg = match decoded {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("Failed to decode message from {addr}: {e}");
                    continue;
                }
            };
            match session.handle(msg).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    log::debug!("Connection {connection_id} outbox closed: {e}");
                    break;
                }
            }
        }

        // Cleanup: leave rooms, then let the writer flush what is queued
        session.disconnect().await;
        drop(session);
        let _ = writer.await;

        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.hub.rooms().room_count().await,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<CollabHub> {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.snapshot_interval_secs, 30);
        assert_eq!(config.delivery_order, DeliveryOrder::AppendThenBroadcast);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("LOGOS_SYNC_BIND", "0.0.0.0:7000"),
            ("LOGOS_SYNC_DATA", "/var/lib/logos-sync"),
            ("LOGOS_SYNC_DELIVERY", "broadcast-then-append"),
            ("LOGOS_SYNC_SNAPSHOT_SECS", "5"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/logos-sync")));
        assert_eq!(config.delivery_order, DeliveryOrder::BroadcastThenAppend);
        assert_eq!(config.snapshot_interval_secs, 5);
        assert_eq!(config.hub_config().delivery_order, DeliveryOrder::BroadcastThenAppend);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let err = ServerConfig::from_lookup(|k| {
            (k == "LOGOS_SYNC_SNAPSHOT_SECS").then(|| "often".to_string())
        })
        .unwrap_err();
        assert_eq!(err.key, "LOGOS_SYNC_SNAPSHOT_SECS");

        let err = ServerConfig::from_lookup(|k| {
            (k == "LOGOS_SYNC_DELIVERY").then(|| "eventually".to_string())
        })
        .unwrap_err();
        assert_eq!(err.key, "LOGOS_SYNC_DELIVERY");
    }

    #[tokio::test]
    async fn test_server_in_memory() {
        let server = SyncServer::open(ServerConfig::for_testing()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::open(config).unwrap();
        assert!(server.hub().store().list_active(&"doc".into()).unwrap().is_empty());
    }
}
