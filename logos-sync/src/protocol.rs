//! Wire protocol between sync clients and the server.
//!
//! Every WebSocket message carries one bincode-encoded frame:
//! ```text
//! ┌──────────────┬──────────────────────────────────────────┐
//! │ variant tag  │ fields (varint lengths, raw byte blobs)  │
//! │ varint       │ document_id, fragment / snapshot, ...    │
//! └──────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Binary WebSocket frames carry the bytes as-is. Text frames carry the
//! same bytes base64-encoded, for clients that cannot send binary.
//! Update fragments and snapshots are opaque Yrs v1 encodings.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::types::{ConnectionId, DocumentId, UserId};

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first message on a connection
    Authenticate { token: String },
    /// Join the room of a document
    Join { document_id: DocumentId },
    /// Leave the room of a document
    Leave { document_id: DocumentId },
    /// Ask for the full current state
    SyncRequest { document_id: DocumentId },
    /// Submit a locally produced update fragment
    Update {
        document_id: DocumentId,
        fragment: Vec<u8>,
    },
    /// Heartbeat
    Ping,
}

/// Why a client message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectKind {
    /// No successful `Authenticate` yet, or the token was refused
    Unauthenticated,
    /// Authenticated but not a member of the document's project
    Forbidden,
    /// The connection has not joined the document's room
    NotJoined,
    /// The document could not be loaded
    SyncFailed,
    /// The update fragment could not be merged
    MalformedUpdate,
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Authenticated {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    Joined { document_id: DocumentId },
    Left { document_id: DocumentId },
    /// Full encoded state of a document
    FullSync {
        document_id: DocumentId,
        snapshot: Vec<u8>,
    },
    /// A fragment accepted from another member, forwarded verbatim
    Update {
        document_id: DocumentId,
        fragment: Vec<u8>,
    },
    /// Local state is stale: discard it and request a full sync
    ForceResync {
        document_id: DocumentId,
        reason: String,
    },
    MemberJoined {
        document_id: DocumentId,
        user_id: UserId,
    },
    MemberLeft {
        document_id: DocumentId,
        user_id: UserId,
    },
    Rejected {
        document_id: Option<DocumentId>,
        kind: RejectKind,
        reason: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn rejected(document_id: Option<DocumentId>, kind: RejectKind, reason: impl Into<String>) -> Self {
        Self::Rejected {
            document_id,
            kind,
            reason: reason.into(),
        }
    }

    /// Document the message refers to, if any.
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            Self::Joined { document_id }
            | Self::Left { document_id }
            | Self::FullSync { document_id, .. }
            | Self::Update { document_id, .. }
            | Self::ForceResync { document_id, .. }
            | Self::MemberJoined { document_id, .. }
            | Self::MemberLeft { document_id, .. } => Some(document_id),
            Self::Rejected { document_id, .. } => document_id.as_ref(),
            Self::Authenticated { .. } | Self::Pong => None,
        }
    }
}

/// Frame encoding shared by both message directions.
pub trait Frame: Serialize + DeserializeOwned + Sized {
    /// Serialize to binary wire format.
    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::DeserializationError(format!(
                "{} trailing bytes",
                bytes.len() - read
            )));
        }
        Ok(msg)
    }

    /// Serialize for a text frame.
    fn encode_text(&self) -> Result<String, ProtocolError> {
        Ok(STANDARD.encode(self.encode()?))
    }

    /// Deserialize from a text frame.
    fn decode_text(text: &str) -> Result<Self, ProtocolError> {
        Self::decode(&text_to_binary(text)?)
    }
}

impl Frame for ClientMessage {}
impl Frame for ServerMessage {}

/// Re-encode a binary frame for a text-mode connection.
pub fn binary_to_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode the base64 body of a text frame.
pub fn text_to_binary(text: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| ProtocolError::InvalidEncoding(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Text frame body is not valid base64
    InvalidEncoding(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidEncoding(e) => write!(f, "Invalid text frame: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn doc() -> DocumentId {
        DocumentId::new("project-42")
    }

    #[test]
    fn test_update_roundtrip_keeps_fragment_verbatim() {
        let fragment = vec![1, 0, 200, 7, 3];
        let msg = ClientMessage::Update {
            document_id: doc(),
            fragment: fragment.clone(),
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ClientMessage::Update { document_id, fragment: f } => {
                assert_eq!(document_id, doc());
                assert_eq!(f, fragment);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_server_messages_roundtrip() {
        let messages = vec![
            ServerMessage::Authenticated {
                connection_id: Uuid::new_v4(),
                user_id: UserId::new("alice"),
            },
            ServerMessage::FullSync {
                document_id: doc(),
                snapshot: vec![0; 128],
            },
            ServerMessage::ForceResync {
                document_id: doc(),
                reason: "rolled back".into(),
            },
            ServerMessage::rejected(None, RejectKind::Unauthenticated, "authenticate first"),
            ServerMessage::Pong,
        ];
        for msg in messages {
            let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_text_frame_is_base64_of_binary() {
        let msg = ClientMessage::Join { document_id: doc() };
        let binary = msg.encode().unwrap();
        let text = msg.encode_text().unwrap();

        assert_eq!(text, binary_to_text(&binary));
        assert_eq!(ClientMessage::decode_text(&text).unwrap(), msg);
    }

    #[test]
    fn test_text_frame_rejects_invalid_base64() {
        let err = ClientMessage::decode_text("not base64 at all!").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEncoding(_)));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ClientMessage::decode(&garbage).is_err());
        assert!(ServerMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = ClientMessage::Ping.encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            ClientMessage::decode(&bytes),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_update_frame_overhead_small() {
        let msg = ServerMessage::Update {
            document_id: doc(),
            fragment: vec![0u8; 50],
        };
        let encoded = msg.encode().unwrap();
        // tag + doc id + length prefixes
        assert!(encoded.len() < 50 + 24, "encoded size {}", encoded.len());
    }

    #[test]
    fn test_document_id_accessor() {
        assert_eq!(
            ServerMessage::Joined { document_id: doc() }.document_id(),
            Some(&doc())
        );
        assert_eq!(ServerMessage::Pong.document_id(), None);
        assert_eq!(
            ServerMessage::rejected(Some(doc()), RejectKind::NotJoined, "join first").document_id(),
            Some(&doc())
        );
    }
}
