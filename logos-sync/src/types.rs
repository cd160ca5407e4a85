//! Identifiers and timestamps shared by every layer of the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

/// Per-connection identifier, assigned when the socket is accepted.
pub type ConnectionId = Uuid;

/// Opaque document identifier. Equal to the owning project's identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Empty identifiers are rejected at the protocol boundary.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= u16::MAX as usize
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque user identifier supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(millis as u64)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Parse a rollback cutoff.
    ///
    /// Accepts RFC 3339 (`2024-05-01T12:00:00Z`, any offset) or a bare
    /// integer number of milliseconds since the epoch. Instants before the
    /// epoch are rejected.
    pub fn parse(input: &str) -> Result<Self, InvalidTimestamp> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(InvalidTimestamp(input.to_string()));
        }
        if let Ok(millis) = trimmed.parse::<u64>() {
            return Ok(Self(millis));
        }
        let parsed = chrono::DateTime::parse_from_rfc3339(trimmed)
            .map_err(|_| InvalidTimestamp(input.to_string()))?;
        let millis = parsed.timestamp_millis();
        if millis < 0 {
            return Err(InvalidTimestamp(input.to_string()));
        }
        Ok(Self(millis as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A cutoff string that is not a valid point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTimestamp(pub String);

impl fmt::Display for InvalidTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid timestamp: {:?}", self.0)
    }
}

impl std::error::Error for InvalidTimestamp {}
