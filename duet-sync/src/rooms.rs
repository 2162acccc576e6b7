//! Room and participant collaborators.
//!
//! The sync layer only needs to resolve a room code to its document, learn a
//! participant's role, and enumerate expired rooms for cleanup.
//! [`RoomDirectory`] keeps all of that in memory for single-node deployments
//! and tests; a deployment with a relational room table implements the two
//! traits against it instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::protocol::Role;
use crate::storage::{unix_now, SnapshotStore};

/// A room and the document it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: Uuid,
    pub doc_id: Uuid,
    /// Short code clients join with.
    pub code: String,
    pub created_at: u64,
    /// Seconds since epoch; `None` never expires.
    pub expires_at: Option<u64>,
}

impl RoomRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: Uuid,
    pub room_id: Uuid,
    pub handle: String,
    pub role: Role,
}

#[async_trait]
pub trait RoomService: Send + Sync {
    async fn find_room_by_code(&self, code: &str) -> SyncResult<RoomRecord>;

    /// Rooms whose expiry is at or before `now` (seconds since epoch).
    async fn expired_rooms(&self, now: u64) -> SyncResult<Vec<RoomRecord>>;

    async fn delete_room(&self, room_id: Uuid) -> SyncResult<()>;
}

#[async_trait]
pub trait ParticipantService: Send + Sync {
    /// Resolve (or register) a participant. A known `participant_id` keeps its
    /// role; a new participant is assigned one.
    async fn join(
        &self,
        room_id: Uuid,
        handle: &str,
        participant_id: Option<Uuid>,
    ) -> SyncResult<Participant>;
}

#[derive(Default)]
struct DirectoryState {
    rooms: HashMap<Uuid, RoomRecord>,
    codes: HashMap<String, Uuid>,
    participants: HashMap<Uuid, Participant>,
}

/// In-memory room and participant directory.
///
/// The first participant of a room becomes its owner, later ones editors.
pub struct RoomDirectory {
    snapshots: Arc<dyn SnapshotStore>,
    state: RwLock<DirectoryState>,
}

impl RoomDirectory {
    pub fn new(snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            snapshots,
            state: RwLock::new(DirectoryState::default()),
        }
    }

    /// Create a room, its document id and its (empty) durable row.
    pub async fn create_room(
        &self,
        code: impl Into<String>,
        ttl: Option<Duration>,
    ) -> SyncResult<RoomRecord> {
        let code = code.into();
        if let Some(existing) = self.lookup(&code) {
            return Ok(existing);
        }

        let now = unix_now();
        let room = RoomRecord {
            room_id: Uuid::new_v4(),
            doc_id: Uuid::new_v4(),
            code: code.clone(),
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl.as_secs()),
        };
        self.snapshots.create(room.doc_id, room.room_id).await?;

        let mut state = self.state.write();
        state.codes.insert(code, room.room_id);
        state.rooms.insert(room.room_id, room.clone());
        log::info!("Created room {} ({})", room.code, room.room_id);
        Ok(room)
    }

    fn lookup(&self, code: &str) -> Option<RoomRecord> {
        let state = self.state.read();
        state.codes.get(code).and_then(|id| state.rooms.get(id)).cloned()
    }

    pub fn set_role(&self, participant_id: Uuid, role: Role) -> SyncResult<()> {
        let mut state = self.state.write();
        let participant = state
            .participants
            .get_mut(&participant_id)
            .ok_or(SyncError::NotFound(participant_id))?;
        participant.role = role;
        Ok(())
    }

    /// Push a room's expiry (e.g. while participants are still present).
    pub fn extend(&self, room_id: Uuid, ttl: Duration) -> SyncResult<()> {
        let mut state = self.state.write();
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or(SyncError::NotFound(room_id))?;
        room.expires_at = Some(unix_now() + ttl.as_secs());
        Ok(())
    }

    pub fn room(&self, room_id: Uuid) -> Option<RoomRecord> {
        self.state.read().rooms.get(&room_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.state.read().rooms.len()
    }
}

#[async_trait]
impl RoomService for RoomDirectory {
    async fn find_room_by_code(&self, code: &str) -> SyncResult<RoomRecord> {
        self.lookup(code)
            .ok_or_else(|| SyncError::RoomNotFound(code.to_string()))
    }

    async fn expired_rooms(&self, now: u64) -> SyncResult<Vec<RoomRecord>> {
        Ok(self
            .state
            .read()
            .rooms
            .values()
            .filter(|room| room.is_expired(now))
            .cloned()
            .collect())
    }

    async fn delete_room(&self, room_id: Uuid) -> SyncResult<()> {
        let mut state = self.state.write();
        if let Some(room) = state.rooms.remove(&room_id) {
            state.codes.remove(&room.code);
            state.participants.retain(|_, p| p.room_id != room_id);
            log::info!("Deleted room {} ({room_id})", room.code);
        }
        Ok(())
    }
}

#[async_trait]
impl ParticipantService for RoomDirectory {
    async fn join(
        &self,
        room_id: Uuid,
        handle: &str,
        participant_id: Option<Uuid>,
    ) -> SyncResult<Participant> {
        let mut state = self.state.write();
        if !state.rooms.contains_key(&room_id) {
            return Err(SyncError::NotFound(room_id));
        }

        if let Some(id) = participant_id {
            if let Some(known) = state.participants.get_mut(&id) {
                if known.room_id == room_id {
                    known.handle = handle.to_string();
                    return Ok(known.clone());
                }
            }
        }

        let first = !state.participants.values().any(|p| p.room_id == room_id);
        let participant = Participant {
            participant_id: participant_id.unwrap_or_else(Uuid::new_v4),
            room_id,
            handle: handle.to_string(),
            role: if first { Role::Owner } else { Role::Editor },
        };
        state
            .participants
            .insert(participant.participant_id, participant.clone());
        Ok(participant)
    }
}
