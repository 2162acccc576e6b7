//! Coordination store: the shared replication log plus cross-process signals.
//!
//! ```text
//!  process A                 coordination store                 process B
//! ┌──────────┐  push script  ┌──────────────────────────┐
//! │ runtime  │ ────────────► │ <doc>:log     [u1,u2,..] │
//! │          │               │ <doc>:offset  n          │  pull script ┌──────────┐
//! │          │ ── publish ─► │ <doc>:bytes   b          │ ◄─────────── │ runtime  │
//! └──────────┘   (clock)     │ channel <doc>            │ ── clock ──► │          │
//!                            └──────────────────────────┘              └──────────┘
//! ```
//!
//! Published messages carry only a clock: they are an invalidation signal,
//! not a transport. Log keys are mutated only by the push and trim scripts
//! (and `remove` when a room is destroyed).

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use memory::{MemoryHub, MemoryStore};
pub use self::redis::RedisStore;

/// Result of an atomic append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPush {
    /// List length after the append.
    pub length: u64,
    /// Entries already folded into the durable snapshot.
    pub offset: u64,
}

impl LogPush {
    /// Logical clock of the appended entry.
    pub fn clock(&self) -> u64 {
        self.offset + self.length
    }
}

/// Entries read by one atomic pull, relative to `offset`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRange {
    pub offset: u64,
    /// Index (in the live list) of the first returned entry.
    pub start: u64,
    pub updates: Vec<Vec<u8>>,
}

impl LogRange {
    /// Clock of the first returned entry.
    pub fn first_clock(&self) -> u64 {
        self.offset + self.start + 1
    }

    /// Clock reached once every returned entry is applied.
    pub fn end_clock(&self) -> u64 {
        self.offset + self.start + self.updates.len() as u64
    }
}

/// Cross-process signal delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Someone pushed up to `clock` on `doc_id`.
    Clock { doc_id: Uuid, clock: u64 },
    /// The subscription was re-established; signals may have been lost.
    Resync,
}

#[derive(Debug, Clone, Error)]
pub enum CoordinationError {
    #[error("Coordination store connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Coordination store command failed: {0}")]
    CommandFailed(String),
    #[error("Unexpected reply from coordination store: {0}")]
    InvalidReply(String),
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Shared key-value + pub/sub service backing the replication log.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Append `update` and return the new length and current offset, atomically.
    async fn push(&self, doc_id: Uuid, update: &[u8]) -> CoordinationResult<LogPush>;

    /// Read entries from `max(0, since - offset)` to the end, atomically with the offset.
    async fn pull(&self, doc_id: Uuid, since: u64) -> CoordinationResult<LogRange>;

    /// Total byte size of the entries currently in the log.
    async fn byte_len(&self, doc_id: Uuid) -> CoordinationResult<u64>;

    /// Drop the first `count` entries and advance the offset by `count`, but only
    /// if the offset still equals `expected_offset`. Returns the new offset.
    async fn trim(
        &self,
        doc_id: Uuid,
        expected_offset: u64,
        count: u64,
    ) -> CoordinationResult<Option<u64>>;

    /// Delete the log, offset and byte counter.
    async fn remove(&self, doc_id: Uuid) -> CoordinationResult<()>;

    async fn publish(&self, doc_id: Uuid, clock: u64) -> CoordinationResult<()>;

    async fn subscribe(&self, doc_id: Uuid) -> CoordinationResult<()>;

    async fn unsubscribe(&self, doc_id: Uuid) -> CoordinationResult<()>;

    /// Stream of signals for the channels this handle subscribed to.
    fn notifications(&self) -> broadcast::Receiver<Notification>;
}

/// Parse a published clock payload.
pub(crate) fn parse_clock(payload: &str) -> Option<u64> {
    payload.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_push_clock() {
        let push = LogPush { length: 3, offset: 7 };
        assert_eq!(push.clock(), 10);
    }

    #[test]
    fn test_log_range_clocks() {
        let range = LogRange {
            offset: 4,
            start: 2,
            updates: vec![vec![1], vec![2]],
        };
        assert_eq!(range.first_clock(), 7);
        assert_eq!(range.end_clock(), 8);

        let empty = LogRange { offset: 4, start: 0, updates: Vec::new() };
        assert_eq!(empty.end_clock(), 4);
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("42"), Some(42));
        assert_eq!(parse_clock(" 7\n"), Some(7));
        assert_eq!(parse_clock("nope"), None);
    }
}
