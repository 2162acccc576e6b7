//! Durable snapshot storage: one row per document.
//!
//! ```text
//! ┌─────────────────┐  compaction only  ┌──────────────────────────────────┐
//! │ DocumentRuntime │ ────────────────► │ SnapshotStore                    │
//! └───────┬─────────┘                   │  doc_id → { room_id, content,    │
//!         │ hydration (read)            │             clock, timestamps }  │
//!         ◄─────────────────────────────┤                                  │
//!                                       └──────────────────────────────────┘
//! ```
//!
//! Rows are never written per keystroke. A save carrying a clock older than
//! the stored one is ignored, so concurrent compactions resolve to the most
//! advanced snapshot.

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, StoreConfig};

/// Durable state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableSnapshot {
    pub doc_id: Uuid,
    /// Owning room.
    pub room_id: Uuid,
    /// Merged document state; `None` until the first compaction.
    pub content: Option<Vec<u8>>,
    /// Log offset folded into `content`.
    pub clock: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl DurableSnapshot {
    pub fn new(doc_id: Uuid, room_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            room_id,
            content: None,
            clock: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn content_len(&self) -> u64 {
        self.content.as_ref().map_or(0, |c| c.len() as u64)
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Document not found: {0}")]
    NotFound(Uuid),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Create the row for a new room's document. Returns the existing row if
    /// one is already present.
    async fn create(&self, doc_id: Uuid, room_id: Uuid) -> StoreResult<DurableSnapshot>;

    async fn load(&self, doc_id: Uuid) -> StoreResult<DurableSnapshot>;

    /// Replace the content if `clock` is not older than the stored clock.
    /// Returns whether the row was written.
    async fn save(&self, doc_id: Uuid, content: &[u8], clock: u64) -> StoreResult<bool>;

    /// Returns whether a row existed.
    async fn delete(&self, doc_id: Uuid) -> StoreResult<bool>;

    async fn list(&self) -> StoreResult<Vec<Uuid>>;
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
