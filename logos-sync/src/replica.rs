//! Replica: an in-memory Yrs document behind a byte-oriented interface.
//!
//! Everything outside this module treats update fragments and snapshots
//! as opaque bytes (Yrs v1 encoding). The three operations the engine
//! relies on:
//!
//! - apply a fragment (commutative, associative, idempotent)
//! - encode the full state as a snapshot
//! - compute the minimal fragment for newly committed local changes
//!
//! Server-side replicas are only mutated through [`crate::cache::DocumentLock`],
//! which serializes writers per document.

use std::fmt;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, TransactionMut, Update};

/// Errors raised by the merge capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// The bytes are not a valid update fragment. Nothing was applied.
    Decode(String),
    /// The fragment decoded but the document refused it.
    Apply(String),
    /// A state vector sent by a peer could not be decoded.
    StateVector(String),
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::Decode(e) => write!(f, "Malformed update fragment: {e}"),
            MergeError::Apply(e) => write!(f, "Update rejected by document: {e}"),
            MergeError::StateVector(e) => write!(f, "Malformed state vector: {e}"),
        }
    }
}

impl std::error::Error for MergeError {}

/// A live CRDT document instance.
pub struct Replica {
    doc: Doc,
}

impl Replica {
    /// Create an empty replica.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Build a replica from a full-state snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, MergeError> {
        let replica = Self::new();
        replica.apply_update(snapshot)?;
        Ok(replica)
    }

    /// Apply one update fragment.
    ///
    /// The fragment is fully decoded before the document is touched, so a
    /// `MergeError::Decode` guarantees the replica is unchanged.
    pub fn apply_update(&self, fragment: &[u8]) -> Result<(), MergeError> {
        let update =
            Update::decode_v1(fragment).map_err(|e| MergeError::Decode(format!("{e:?}")))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| MergeError::Apply(format!("{e:?}")))
    }

    /// Apply many fragments inside one write transaction.
    ///
    /// All fragments are decoded up front; if any of them is malformed
    /// nothing is applied and the index of the offending fragment is
    /// returned in the error.
    pub fn apply_batch<'a, I>(&self, fragments: I) -> Result<usize, (usize, MergeError)>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut updates = Vec::new();
        for (index, fragment) in fragments.into_iter().enumerate() {
            let update = Update::decode_v1(fragment)
                .map_err(|e| (index, MergeError::Decode(format!("{e:?}"))))?;
            updates.push(update);
        }

        let count = updates.len();
        if count == 0 {
            return Ok(0);
        }

        let mut txn = self.doc.transact_mut();
        for (index, update) in updates.into_iter().enumerate() {
            txn.apply_update(update)
                .map_err(|e| (index, MergeError::Apply(format!("{e:?}"))))?;
        }
        Ok(count)
    }

    /// Encode the full document state.
    pub fn encode_snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector (what this replica has seen, per client).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Fragment containing everything this replica has that `remote_sv` lacks.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, MergeError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| MergeError::StateVector(format!("{e:?}")))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Run a local edit and return the fragment it produced.
    ///
    /// The fragment is encoded from the edit's own transaction, so a
    /// remote update applied concurrently never leaks into it.
    pub fn edit<F>(&self, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let mut txn = self.doc.transact_mut();
        f(&mut txn);
        txn.encode_update_v1()
    }

    /// Current contents of a root text type (empty if it does not exist).
    pub fn text(&self, name: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(name)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Underlying Yrs document, for callers that need shared types directly.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("client_id", &self.doc.client_id())
            .finish()
    }
}
