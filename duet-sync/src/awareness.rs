//! Ephemeral per-client presence (cursor, selection, current file).
//!
//! ```text
//! client A ── UpdateAwareness{delta} ──► AwarenessChannel::apply_update
//!                                              │ AwarenessChange { added, updated, removed }
//!                                              ▼
//!                                   encode_update(changed ids)
//!                                              │
//!                          BroadcastGroup (origin = A, never echoed)
//!                                   ┌──────────┴──────────┐
//!                                   ▼                     ▼
//!                               client B              client C
//! ```
//!
//! Each client id carries a clock. An entry is accepted when its clock is
//! newer than the known one, or equal with a null state (removal wins ties).
//! Nothing here is persisted or replicated through the log.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::ProtocolError;

/// One client's entry on the wire. `state` is JSON text, `"null"` for removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: String,
}

impl AwarenessEntry {
    pub fn new(client_id: u64, clock: u64, state: Option<&Value>) -> Self {
        let state = match state {
            Some(value) => value.to_string(),
            None => "null".to_string(),
        };
        Self { client_id, clock, state }
    }

    /// Parsed state; `None` for removals.
    pub fn parse_state(&self) -> Result<Option<Value>, ProtocolError> {
        if self.state.is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(&self.state)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok((!value.is_null()).then_some(value))
    }
}

/// Encoded delta carried by `UpdateAwareness` and `RoomAwareness`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(update)
    }
}

/// Client ids touched by one update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every id whose visible state changed.
    pub fn changed(&self) -> Vec<u64> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone)]
struct ClientState {
    clock: u64,
    state: Option<Value>,
    last_updated: Instant,
}

/// Presence table of one document.
#[derive(Default)]
pub struct AwarenessChannel {
    clients: RwLock<HashMap<u64, ClientState>>,
}

impl AwarenessChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a decoded delta.
    pub fn apply_update(&self, update: &AwarenessUpdate) -> Result<AwarenessChange, ProtocolError> {
        let parsed = update
            .entries
            .iter()
            .map(|entry| Ok((entry, entry.parse_state()?)))
            .collect::<Result<Vec<_>, ProtocolError>>()?;

        let mut change = AwarenessChange::default();
        let mut clients = self.clients.write();

        for (entry, state) in parsed {
            let previous = clients.get(&entry.client_id);
            let known_clock = previous.map_or(0, |p| p.clock);
            let had_state = previous.is_some_and(|p| p.state.is_some());

            let accept = entry.clock > known_clock
                || (entry.clock == known_clock && state.is_none() && had_state);
            if !accept {
                continue;
            }

            match (&state, previous.and_then(|p| p.state.as_ref())) {
                (Some(_), None) => change.added.push(entry.client_id),
                (None, Some(_)) => change.removed.push(entry.client_id),
                (Some(new), Some(old)) if new != old => change.updated.push(entry.client_id),
                _ => {}
            }

            clients.insert(
                entry.client_id,
                ClientState {
                    clock: entry.clock,
                    state,
                    last_updated: Instant::now(),
                },
            );
        }

        Ok(change)
    }

    /// Decode and merge a delta received from a client.
    pub fn apply_encoded(&self, bytes: &[u8]) -> Result<AwarenessChange, ProtocolError> {
        self.apply_update(&AwarenessUpdate::decode(bytes)?)
    }

    /// Delta covering only `client_ids` (unknown ids are skipped).
    pub fn encode_update(&self, client_ids: &[u64]) -> Result<Vec<u8>, ProtocolError> {
        let clients = self.clients.read();
        let entries = client_ids
            .iter()
            .filter_map(|id| {
                clients
                    .get(id)
                    .map(|c| AwarenessEntry::new(*id, c.clock, c.state.as_ref()))
            })
            .collect();
        AwarenessUpdate { entries }.encode()
    }

    /// Every client with a live state.
    pub fn encode_all(&self) -> Result<Vec<u8>, ProtocolError> {
        let clients = self.clients.read();
        let entries = clients
            .iter()
            .filter(|(_, c)| c.state.is_some())
            .map(|(id, c)| AwarenessEntry::new(*id, c.clock, c.state.as_ref()))
            .collect();
        AwarenessUpdate { entries }.encode()
    }

    /// Null out the given clients, bumping their clocks so peers accept it.
    pub fn remove_states(&self, client_ids: &[u64]) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        let mut clients = self.clients.write();
        for id in client_ids {
            if let Some(client) = clients.get_mut(id) {
                if client.state.take().is_some() {
                    client.clock += 1;
                    client.last_updated = Instant::now();
                    change.removed.push(*id);
                }
            }
        }
        change
    }

    /// Set a client's state from the server side.
    pub fn set_local_state(&self, client_id: u64, state: Option<Value>) -> AwarenessChange {
        let clock = self.clock(client_id).unwrap_or(0) + 1;
        let update = AwarenessUpdate {
            entries: vec![AwarenessEntry::new(client_id, clock, state.as_ref())],
        };
        // A serialized serde_json::Value always parses back.
        self.apply_update(&update).unwrap_or_default()
    }

    pub fn state(&self, client_id: u64) -> Option<Value> {
        self.clients.read().get(&client_id).and_then(|c| c.state.clone())
    }

    pub fn clock(&self, client_id: u64) -> Option<u64> {
        self.clients.read().get(&client_id).map(|c| c.clock)
    }

    /// Live states keyed by client id.
    pub fn states(&self) -> HashMap<u64, Value> {
        self.clients
            .read()
            .iter()
            .filter_map(|(id, c)| c.state.clone().map(|s| (*id, s)))
            .collect()
    }

    /// Number of clients with a live state.
    pub fn len(&self) -> usize {
        self.clients.read().values().filter(|c| c.state.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries removed at least `grace` ago. Returns how many went.
    ///
    /// A removed entry keeps its clock for a while so a late update carrying
    /// an older clock cannot resurrect it.
    pub fn prune_removed(&self, grace: Duration) -> usize {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|_, c| c.state.is_some() || c.last_updated.elapsed() < grace);
        before - clients.len()
    }

    /// Known client ids, removed ones included.
    pub fn tracked(&self) -> usize {
        self.clients.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(entries: &[(u64, u64, Value)]) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: entries
                .iter()
                .map(|(id, clock, state)| {
                    AwarenessEntry::new(*id, *clock, Some(state).filter(|s| !s.is_null()))
                })
                .collect(),
        }
    }

    #[test]
    fn test_added_updated_removed() {
        let channel = AwarenessChannel::new();

        let change = channel
            .apply_update(&update(&[(1, 1, json!({"cursor": 3}))]))
            .unwrap();
        assert_eq!(change.added, vec![1]);

        let change = channel
            .apply_update(&update(&[(1, 2, json!({"cursor": 9}))]))
            .unwrap();
        assert_eq!(change.updated, vec![1]);
        assert_eq!(channel.state(1), Some(json!({"cursor": 9})));

        let change = channel.apply_update(&update(&[(1, 3, Value::Null)])).unwrap();
        assert_eq!(change.removed, vec![1]);
        assert!(channel.state(1).is_none());
        assert!(channel.is_empty());
    }

    #[test]
    fn test_stale_clock_ignored() {
        let channel = AwarenessChannel::new();
        channel.apply_update(&update(&[(7, 5, json!("new"))])).unwrap();

        let change = channel.apply_update(&update(&[(7, 4, json!("old"))])).unwrap();
        assert!(change.is_empty());
        assert_eq!(channel.state(7), Some(json!("new")));
    }

    #[test]
    fn test_removal_wins_equal_clock() {
        let channel = AwarenessChannel::new();
        channel.apply_update(&update(&[(7, 5, json!("here"))])).unwrap();

        let change = channel.apply_update(&update(&[(7, 5, Value::Null)])).unwrap();
        assert_eq!(change.removed, vec![7]);
    }

    #[test]
    fn test_refresh_is_not_a_change() {
        let channel = AwarenessChannel::new();
        channel.apply_update(&update(&[(2, 1, json!({"file": "a.rs"}))])).unwrap();

        let change = channel
            .apply_update(&update(&[(2, 2, json!({"file": "a.rs"}))]))
            .unwrap();
        assert!(change.is_empty());
        assert_eq!(channel.clock(2), Some(2));
    }

    #[test]
    fn test_encode_update_only_listed_ids() {
        let channel = AwarenessChannel::new();
        channel
            .apply_update(&update(&[(1, 1, json!("a")), (2, 1, json!("b")), (3, 1, json!("c"))]))
            .unwrap();

        let delta = AwarenessUpdate::decode(&channel.encode_update(&[2, 99]).unwrap()).unwrap();
        assert_eq!(delta.entries.len(), 1);
        assert_eq!(delta.entries[0].client_id, 2);

        let all = AwarenessUpdate::decode(&channel.encode_all().unwrap()).unwrap();
        assert_eq!(all.entries.len(), 3);
    }

    #[test]
    fn test_remove_states_propagates_to_peer() {
        let server = AwarenessChannel::new();
        let peer = AwarenessChannel::new();
        let join = update(&[(1, 1, json!("a")), (2, 1, json!("b"))]);
        server.apply_update(&join).unwrap();
        peer.apply_update(&join).unwrap();

        let change = server.remove_states(&[1]);
        assert_eq!(change.removed, vec![1]);
        assert_eq!(server.state(2), Some(json!("b")));

        let delta = server.encode_update(&change.changed()).unwrap();
        let applied = peer.apply_encoded(&delta).unwrap();
        assert_eq!(applied.removed, vec![1]);
        assert_eq!(peer.state(2), Some(json!("b")));
        assert_eq!(peer.len(), 1);
    }

    #[test]
    fn test_remove_unknown_client_is_noop() {
        let channel = AwarenessChannel::new();
        assert!(channel.remove_states(&[42]).is_empty());
    }

    #[test]
    fn test_prune_forgets_removed_clients_only() {
        let channel = AwarenessChannel::new();
        channel
            .apply_update(&update(&[(1, 1, json!("a")), (2, 1, json!("b"))]))
            .unwrap();
        channel.remove_states(&[1]);
        assert_eq!(channel.tracked(), 2);

        // Still inside the grace period.
        assert_eq!(channel.prune_removed(Duration::from_secs(60)), 0);
        assert_eq!(channel.clock(1), Some(2));
        assert!(channel
            .apply_update(&update(&[(1, 1, json!("stale"))]))
            .unwrap()
            .is_empty());

        assert_eq!(channel.prune_removed(Duration::ZERO), 1);
        assert_eq!(channel.tracked(), 1);
        assert_eq!(channel.clock(1), None);
        assert_eq!(channel.state(2), Some(json!("b")));
    }

    #[test]
    fn test_set_local_state_bumps_clock() {
        let channel = AwarenessChannel::new();
        let change = channel.set_local_state(10, Some(json!({"name": "server"})));
        assert_eq!(change.added, vec![10]);
        assert_eq!(channel.clock(10), Some(1));

        let change = channel.set_local_state(10, None);
        assert_eq!(change.removed, vec![10]);
        assert_eq!(channel.clock(10), Some(2));
    }

    #[test]
    fn test_malformed_state_rejected() {
        let channel = AwarenessChannel::new();
        let bad = AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: 1,
                clock: 1,
                state: "{not json".into(),
            }],
        };
        assert!(channel.apply_update(&bad).is_err());
        assert!(channel.apply_encoded(&[0xFF, 0xFF]).is_err());
    }
}
