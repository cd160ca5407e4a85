//! # logos-sync — Real-time collaborative document sync engine
//!
//! Many clients edit shared documents concurrently over WebSocket. Edits
//! are CRDT update fragments (Yrs), merged without loss, recorded in an
//! append-only log, and replayed on demand to rebuild a document.
//! Documents roll back to a point in time by archiving later entries.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer  │
//! │ (per user)  │   bincode frames   │  Sessions   │
//! └──────┬──────┘                    └──────┬──────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌─────────────┐      ┌────────────────┐
//! │ Replica     │                    │ CollabHub   │ ───► │ UpdateLogStore │
//! │ (local)     │                    │             │      │ (RocksDB)      │
//! └─────────────┘                    └──────┬──────┘      └───────┬────────┘
//!                                           │                     │ replay
//!                              ┌────────────┼─────────────┐       │
//!                              ▼            ▼             ▼       ▼
//!                        RoomManager  RollbackCoord.  DocumentCache
//!                        (fan-out)    (archive/evict)  (one replica per doc)
//! ```
//!
//! ## Modules
//!
//! - [`storage`] — Update log: append, archive, replay order, snapshots
//! - [`replica`] — Byte-oriented wrapper over a Yrs document
//! - [`reconstruct`] — Rebuild a replica from the active log
//! - [`cache`] — At most one live replica per document, coalesced misses
//! - [`rollback`] — Archive, evict, force resync
//! - [`protocol`] — Wire messages (bincode, base64 for text frames)
//! - [`broadcast`] — Room-based fan-out with backpressure
//! - [`session`] — Per-connection state machine
//! - [`hub`] — Update pipeline and REST-facing operations
//! - [`directory`] — Identity and project membership traits
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with offline queue

pub mod types;
pub mod replica;
pub mod storage;
pub mod reconstruct;
pub mod cache;
pub mod rollback;
pub mod protocol;
pub mod broadcast;
pub mod directory;
pub mod hub;
pub mod session;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use types::{ConnectionId, DocumentId, InvalidTimestamp, Timestamp, UserId};
pub use replica::{MergeError, Replica};
pub use storage::{
    EntryStatus, HistoryEntry, LogEntry, MemoryLogStore, RocksLogStore, StoreConfig,
    StoreError, UpdateLogStore,
};
pub use reconstruct::{ReconstructionEngine, ReconstructionError};
pub use cache::{CacheError, CacheStats, DocumentCache, DocumentLock};
pub use rollback::{RollbackCoordinator, RollbackError, RollbackOutcome, RollbackStage};
pub use protocol::{ClientMessage, Frame, ProtocolError, RejectKind, ServerMessage};
pub use broadcast::{BroadcastGroup, BroadcastStats, MemberInfo, RoomFrame, RoomManager};
pub use directory::{
    Access, IdentityProvider, MemoryDirectory, OpenDirectory, ProjectDirectory, ProjectInfo,
    StaticIdentity, TokenAsUser,
};
pub use hub::{
    ApiError, CollabHub, DeliveryOrder, HubConfig, RollbackRequest, RollbackResponse,
    UpdateError, UpdateOutcome,
};
pub use session::{Session, SessionState};
pub use server::{ConfigError, ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
