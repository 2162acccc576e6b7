//! In-process coordination store.
//!
//! A [`MemoryHub`] plays the shared service; every [`MemoryStore::connect`]
//! handle behaves like one server process with its own subscriptions, so
//! multi-process replication can be exercised inside a single test.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{CoordinationResult, CoordinationStore, LogPush, LogRange, Notification};

#[derive(Debug, Default)]
struct DocLog {
    entries: Vec<Vec<u8>>,
    offset: u64,
    bytes: u64,
}

/// Shared state standing in for the coordination service.
#[derive(Default)]
pub struct MemoryHub {
    logs: Mutex<HashMap<Uuid, DocLog>>,
    handles: Mutex<Vec<Weak<HandleInner>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current `(length, offset)` of a log, for assertions.
    pub fn log_state(&self, doc_id: Uuid) -> (u64, u64) {
        let logs = self.logs.lock();
        logs.get(&doc_id)
            .map(|log| (log.entries.len() as u64, log.offset))
            .unwrap_or((0, 0))
    }

    pub fn contains(&self, doc_id: Uuid) -> bool {
        self.logs.lock().contains_key(&doc_id)
    }

    fn fan_out(&self, doc_id: Uuid, clock: u64) -> usize {
        let mut handles = self.handles.lock();
        handles.retain(|h| h.strong_count() > 0);
        let mut delivered = 0;
        for handle in handles.iter().filter_map(Weak::upgrade) {
            if handle.subscriptions.lock().contains(&doc_id) {
                if handle.sender.send(Notification::Clock { doc_id, clock }).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

struct HandleInner {
    subscriptions: Mutex<HashSet<Uuid>>,
    sender: broadcast::Sender<Notification>,
}

/// One "process" connected to a [`MemoryHub`].
pub struct MemoryStore {
    hub: Arc<MemoryHub>,
    inner: Arc<HandleInner>,
    /// When set, published signals are dropped (simulates lost messages).
    mute: AtomicBool,
}

impl MemoryStore {
    pub fn connect(hub: &Arc<MemoryHub>) -> Self {
        let (sender, _) = broadcast::channel(1024);
        let inner = Arc::new(HandleInner {
            subscriptions: Mutex::new(HashSet::new()),
            sender,
        });
        hub.handles.lock().push(Arc::downgrade(&inner));
        Self {
            hub: hub.clone(),
            inner,
            mute: AtomicBool::new(false),
        }
    }

    /// Stop delivering this handle's publishes to other handles.
    pub fn set_muted(&self, muted: bool) {
        self.mute.store(muted, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self, doc_id: Uuid) -> bool {
        self.inner.subscriptions.lock().contains(&doc_id)
    }

    /// Deliver a `Resync` signal as a reconnecting subscriber would.
    pub fn simulate_reconnect(&self) {
        let _ = self.inner.sender.send(Notification::Resync);
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn push(&self, doc_id: Uuid, update: &[u8]) -> CoordinationResult<LogPush> {
        let mut logs = self.hub.logs.lock();
        let log = logs.entry(doc_id).or_default();
        log.entries.push(update.to_vec());
        log.bytes += update.len() as u64;
        Ok(LogPush {
            length: log.entries.len() as u64,
            offset: log.offset,
        })
    }

    async fn pull(&self, doc_id: Uuid, since: u64) -> CoordinationResult<LogRange> {
        let logs = self.hub.logs.lock();
        let Some(log) = logs.get(&doc_id) else {
            return Ok(LogRange::default());
        };
        let len = log.entries.len() as u64;
        let start = since.saturating_sub(log.offset).min(len);
        Ok(LogRange {
            offset: log.offset,
            start,
            updates: log.entries[start as usize..].to_vec(),
        })
    }

    async fn byte_len(&self, doc_id: Uuid) -> CoordinationResult<u64> {
        Ok(self.hub.logs.lock().get(&doc_id).map_or(0, |log| log.bytes))
    }

    async fn trim(
        &self,
        doc_id: Uuid,
        expected_offset: u64,
        count: u64,
    ) -> CoordinationResult<Option<u64>> {
        let mut logs = self.hub.logs.lock();
        let log = logs.entry(doc_id).or_default();
        if log.offset != expected_offset {
            return Ok(None);
        }
        let count = (count as usize).min(log.entries.len());
        let drained: u64 = log.entries.drain(..count).map(|e| e.len() as u64).sum();
        log.bytes -= drained;
        log.offset += count as u64;
        Ok(Some(log.offset))
    }

    async fn remove(&self, doc_id: Uuid) -> CoordinationResult<()> {
        self.hub.logs.lock().remove(&doc_id);
        Ok(())
    }

    async fn publish(&self, doc_id: Uuid, clock: u64) -> CoordinationResult<()> {
        if !self.mute.load(Ordering::SeqCst) {
            self.hub.fan_out(doc_id, clock);
        }
        Ok(())
    }

    async fn subscribe(&self, doc_id: Uuid) -> CoordinationResult<()> {
        self.inner.subscriptions.lock().insert(doc_id);
        Ok(())
    }

    async fn unsubscribe(&self, doc_id: Uuid) -> CoordinationResult<()> {
        self.inner.subscriptions.lock().remove(&doc_id);
        Ok(())
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.sender.subscribe()
    }
}
