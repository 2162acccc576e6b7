//! Per-document replication log handle.
//!
//! Clock arithmetic: entry `i` (0-based) of the live list has clock
//! `offset + i + 1`, so after any push `clock == offset + length`. Only
//! [`ReplicationLog::commit`] advances the offset.

use std::sync::Arc;

use uuid::Uuid;

use crate::coordination::{CoordinationResult, CoordinationStore, LogPush, LogRange};

/// Entries drained by [`ReplicationLog::compact`], not yet trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compaction {
    /// Offset the entries are relative to.
    pub offset: u64,
    pub updates: Vec<Vec<u8>>,
}

impl Compaction {
    /// Offset once the drained entries are folded into the snapshot.
    pub fn new_offset(&self) -> u64 {
        self.offset + self.updates.len() as u64
    }

    pub fn byte_len(&self) -> u64 {
        self.updates.iter().map(|u| u.len() as u64).sum()
    }
}

#[derive(Clone)]
pub struct ReplicationLog {
    doc_id: Uuid,
    store: Arc<dyn CoordinationStore>,
}

impl ReplicationLog {
    pub fn new(doc_id: Uuid, store: Arc<dyn CoordinationStore>) -> Self {
        Self { doc_id, store }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Append one update. The caller derives its clock with [`LogPush::clock`].
    pub async fn push(&self, update: &[u8]) -> CoordinationResult<LogPush> {
        self.store.push(self.doc_id, update).await
    }

    /// Entries with clock greater than `since`.
    pub async fn pull(&self, since: u64) -> CoordinationResult<LogRange> {
        self.store.pull(self.doc_id, since).await
    }

    pub async fn byte_len(&self) -> CoordinationResult<u64> {
        self.store.byte_len(self.doc_id).await
    }

    /// Read the whole log and its offset. `None` when there is nothing to fold.
    ///
    /// Nothing is removed until [`commit`](Self::commit) succeeds, so the caller
    /// must persist the merged snapshot first.
    pub async fn compact(&self) -> CoordinationResult<Option<Compaction>> {
        let range = self.store.pull(self.doc_id, 0).await?;
        if range.updates.is_empty() {
            return Ok(None);
        }
        Ok(Some(Compaction {
            offset: range.offset,
            updates: range.updates,
        }))
    }

    /// Trim exactly the drained entries if no other compaction got there first.
    /// Returns the new offset, or `None` when the offset moved.
    pub async fn commit(&self, compaction: &Compaction) -> CoordinationResult<Option<u64>> {
        self.store
            .trim(
                self.doc_id,
                compaction.offset,
                compaction.updates.len() as u64,
            )
            .await
    }

    /// Delete the log and its offset. Irreversible.
    pub async fn remove(&self) -> CoordinationResult<()> {
        self.store.remove(self.doc_id).await
    }

    pub async fn publish(&self, clock: u64) -> CoordinationResult<()> {
        self.store.publish(self.doc_id, clock).await
    }

    pub async fn subscribe(&self) -> CoordinationResult<()> {
        self.store.subscribe(self.doc_id).await
    }

    pub async fn unsubscribe(&self) -> CoordinationResult<()> {
        self.store.unsubscribe(self.doc_id).await
    }
}
