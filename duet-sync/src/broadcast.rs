//! Fan-out of encoded server frames to the local connections of one document.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Every
//! frame is tagged with the connection it originated from; that connection's
//! receiver skips it, so a sender never sees its own update or awareness
//! delta echoed back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, Role, ServerMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters updated on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A connection attached to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub connection_id: Uuid,
    pub participant_id: Uuid,
    pub role: Role,
}

/// One pre-encoded frame plus the connection that caused it.
#[derive(Debug)]
pub struct Envelope {
    /// `None` for frames caused by remote processes.
    pub origin: Option<Uuid>,
    pub frame: Arc<Vec<u8>>,
}

/// Per-connection receiving end.
pub struct PeerReceiver {
    connection_id: Uuid,
    receiver: broadcast::Receiver<Arc<Envelope>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl PeerReceiver {
    /// Next frame not originated by this connection. `None` once the group is gone.
    ///
    /// A receiver that falls more than `capacity` frames behind loses the
    /// oldest ones; the client recovers with `RequestDoc`.
    pub async fn recv(&mut self) -> Option<Arc<Vec<u8>>> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.origin == Some(self.connection_id) => continue,
                Ok(envelope) => return Some(envelope.frame.clone()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Connection {} lagged, {skipped} frames dropped",
                        self.connection_id
                    );
                    self.stats
                        .messages_dropped
                        .fetch_add(skipped, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<Vec<u8>>> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) if envelope.origin == Some(self.connection_id) => continue,
                Ok(envelope) => return Some(envelope.frame.clone()),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.stats
                        .messages_dropped
                        .fetch_add(skipped, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

/// Broadcast group of one document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    /// Attached connections, keyed by connection id
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before slow peers lag.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    pub fn add_peer(&self, info: PeerInfo) -> PeerReceiver {
        let connection_id = info.connection_id;
        self.peers.write().insert(connection_id, info);
        PeerReceiver {
            connection_id,
            receiver: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    pub fn remove_peer(&self, connection_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().remove(connection_id)
    }

    /// Encode once and send to every peer except `origin`.
    /// Returns the number of receivers the frame was queued for.
    pub fn broadcast(
        &self,
        msg: &ServerMessage,
        origin: Option<Uuid>,
    ) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?), origin))
    }

    /// Send pre-encoded bytes (zero-copy fast path).
    pub fn broadcast_raw(&self, frame: Arc<Vec<u8>>, origin: Option<Uuid>) -> usize {
        let count = self
            .sender
            .send(Arc::new(Envelope { origin, frame }))
            .unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().values().cloned().collect()
    }

    pub fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().contains_key(connection_id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
