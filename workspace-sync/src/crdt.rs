//! Replicated document adaptor over a Yrs `Doc`.
//!
//! The engine only needs four capabilities from the CRDT library: import a
//! stored state, fork into an independent replica, export in one of three
//! modes, and report the document's version vector. Merge semantics are the
//! library's, never re-implemented here.
//!
//! ```text
//! import(bytes) ──► CrdtDocument ──► export(Snapshot)            full state
//!                        │      └──► export(ShallowSnapshot(f))   full state anchored at f
//!                        │      └──► export(UpdateSince(vv))      ops missing from vv
//!                        └── fork() ──► CrdtDocument (new client id, same content)
//! ```

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use crate::error::{SyncError, SyncResult};

/// Summary of the operations a replica has integrated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionVector(StateVector);

impl VersionVector {
    /// Decode a v1-encoded state vector. Empty input is the empty vector
    /// (a replica that has seen nothing).
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        // Each entry takes at least two bytes; refuse absurd declared lengths
        // before the decoder sizes its map from them.
        match leading_varint(bytes) {
            Some(entries) if entries <= bytes.len() as u64 => {}
            _ => return Err(SyncError::BadRequest("malformed version vector header".into())),
        }
        StateVector::decode_v1(bytes)
            .map(Self)
            .map_err(|e| SyncError::BadRequest(format!("malformed version vector: {e}")))
    }

    pub fn encode(&self) -> Vec<u8> {
        self.0.encode_v1()
    }

    /// Whether every operation summarized by `other` is also summarized here.
    pub fn includes(&self, other: &VersionVector) -> bool {
        other
            .0
            .iter()
            .all(|(client, clock)| self.0.get(client) >= *clock)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Read an unsigned LEB128 prefix (at most 5 bytes, the width of a u32).
fn leading_varint(bytes: &[u8]) -> Option<u64> {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().take(5).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

/// Export modes supported by the adaptor.
#[derive(Debug, Clone, Copy)]
pub enum ExportMode<'a> {
    /// Entire document state.
    Snapshot,
    /// Document state anchored at the given frontiers. Yrs garbage-collects
    /// deleted content on its own, so this is the compacted full state; the
    /// frontiers must already be integrated.
    ShallowSnapshot(&'a VersionVector),
    /// Only the operations not summarized by the given version vector.
    UpdateSince(&'a VersionVector),
}

/// A replicated document.
pub struct CrdtDocument {
    doc: Doc,
}

impl CrdtDocument {
    /// Empty document with a fresh replica id.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Build a document from stored bytes (snapshot or update).
    pub fn import(bytes: &[u8]) -> SyncResult<Self> {
        let document = Self::new();
        document.apply(bytes)?;
        Ok(document)
    }

    /// Integrate an update. Malformed payloads are rejected without touching
    /// the document.
    pub fn apply(&self, update: &[u8]) -> SyncResult<()> {
        let update = Update::decode_v1(update)
            .map_err(|e| SyncError::Crdt(format!("undecodable update: {e}")))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| SyncError::Crdt(format!("update rejected: {e}")))
    }

    /// Independent replica with identical content and a new replica id.
    /// Edits to either side never reach the other unless exchanged explicitly.
    pub fn fork(&self) -> SyncResult<Self> {
        let state = self.export(ExportMode::Snapshot)?;
        Self::import(&state)
    }

    pub fn export(&self, mode: ExportMode<'_>) -> SyncResult<Vec<u8>> {
        let txn = self.doc.transact();
        match mode {
            ExportMode::Snapshot => Ok(txn.encode_state_as_update_v1(&StateVector::default())),
            ExportMode::ShallowSnapshot(frontiers) => {
                let current = VersionVector(txn.state_vector());
                if !current.includes(frontiers) {
                    return Err(SyncError::Crdt(
                        "shallow snapshot frontiers are ahead of the document".into(),
                    ));
                }
                Ok(txn.encode_state_as_update_v1(&StateVector::default()))
            }
            ExportMode::UpdateSince(since) => Ok(txn.encode_state_as_update_v1(&since.0)),
        }
    }

    /// Current version vector ("frontiers").
    pub fn frontiers(&self) -> VersionVector {
        let txn = self.doc.transact();
        VersionVector(txn.state_vector())
    }

    pub fn is_empty(&self) -> bool {
        self.frontiers().is_empty()
    }

    /// Read a root text type. Missing roots read as empty.
    pub fn text(&self, name: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(name)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Append to a root text type and return the update produced by the edit.
    pub fn append_text(&self, name: &str, content: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(name);
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, content);
        txn.encode_update_v1()
    }
}

impl Default for CrdtDocument {
    fn default() -> Self {
        Self::new()
    }
}
