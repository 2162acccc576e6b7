//! Mergeable document capability and its Yrs binding.
//!
//! The replication layer never looks inside updates: it only needs to apply
//! them, produce a full-state snapshot, and merge a batch of updates into one.
//! [`YrsDocument`] provides that on top of a `yrs::Doc` with the editor's
//! conventional top-level structures:
//!
//! ```text
//! files      Map<file_id, Text>   file contents
//! fileIndex  Map<name, file_id>   path lookup
//! meta       Map<key, Any>        room-level settings (language, title, ...)
//! ```

use thiserror::Error;
use yrs::types::text::TextPrelim;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, GetString, Map, MapRef, Out, ReadTxn, StateVector, Text, Transact, Update};

pub const FILES: &str = "files";
pub const FILE_INDEX: &str = "fileIndex";
pub const META: &str = "meta";

#[derive(Debug, Clone, Error)]
pub enum DocumentError {
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),
    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("Failed to apply update: {0}")]
    ApplyFailed(String),
}

/// Opaque CRDT capability consumed by the runtime.
pub trait MergeableDocument: Send + Sync {
    /// Create an empty document.
    fn empty() -> Self
    where
        Self: Sized;

    /// Merge a binary update into this document.
    fn apply(&self, update: &[u8]) -> Result<(), DocumentError>;

    /// Encode the whole document as a single update.
    fn full_state(&self) -> Vec<u8>;

    fn state_vector(&self) -> Vec<u8>;

    /// Encode everything the holder of `state_vector` is missing.
    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError>;

    /// Fold `base` (if any) and `updates`, in order, into one full-state update.
    fn merge(base: Option<&[u8]>, updates: &[Vec<u8>]) -> Result<Vec<u8>, DocumentError>
    where
        Self: Sized,
    {
        let doc = Self::empty();
        if let Some(base) = base {
            doc.apply(base)?;
        }
        for update in updates {
            doc.apply(update)?;
        }
        Ok(doc.full_state())
    }
}

/// Yrs-backed document with the editor's file table.
pub struct YrsDocument {
    doc: Doc,
}

impl YrsDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        doc.get_or_insert_map(FILES);
        doc.get_or_insert_map(FILE_INDEX);
        doc.get_or_insert_map(META);
        Self { doc }
    }

    // Root lookups must happen before a transaction is opened.
    fn root(&self, name: &str) -> MapRef {
        self.doc.get_or_insert_map(name)
    }

    /// Append `content` to a file (creating it and its index entry if needed)
    /// and return the resulting update.
    pub fn write_file(&self, file_id: &str, name: &str, content: &str) -> Vec<u8> {
        let files = self.root(FILES);
        let index = self.root(FILE_INDEX);
        let mut txn = self.doc.transact_mut();
        let text = match files.get(&txn, file_id) {
            Some(Out::YText(text)) => text,
            _ => files.insert(&mut txn, file_id, TextPrelim::new("")),
        };
        let len = text.len(&txn);
        text.insert(&mut txn, len, content);
        if index.get(&txn, name).is_none() {
            index.insert(&mut txn, name, file_id.to_string());
        }
        txn.encode_update_v1()
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Vec<u8> {
        let meta = self.root(META);
        let mut txn = self.doc.transact_mut();
        meta.insert(&mut txn, key, value.to_string());
        txn.encode_update_v1()
    }

    pub fn file_text(&self, file_id: &str) -> Option<String> {
        let files = self.root(FILES);
        let txn = self.doc.transact();
        match files.get(&txn, file_id) {
            Some(Out::YText(text)) => Some(text.get_string(&txn)),
            _ => None,
        }
    }

    pub fn file_id(&self, name: &str) -> Option<String> {
        let index = self.root(FILE_INDEX);
        let txn = self.doc.transact();
        match index.get(&txn, name) {
            Some(Out::Any(Any::String(id))) => Some(id.to_string()),
            _ => None,
        }
    }

    pub fn meta(&self, key: &str) -> Option<String> {
        let meta = self.root(META);
        let txn = self.doc.transact();
        match meta.get(&txn, key) {
            Some(Out::Any(Any::String(value))) => Some(value.to_string()),
            _ => None,
        }
    }

    pub fn file_count(&self) -> u32 {
        let files = self.root(FILES);
        let txn = self.doc.transact();
        files.len(&txn)
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeableDocument for YrsDocument {
    fn empty() -> Self {
        Self::new()
    }

    fn apply(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update =
            Update::decode_v1(update).map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::ApplyFailed(e.to_string()))
    }

    fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::MalformedStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }
}
