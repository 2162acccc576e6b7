//! Per-connection protocol surface.
//!
//! A [`Session`] is created by [`SyncGateway::join`] and owned by the
//! connection task. Every operation takes the session so role gating and
//! broadcast origin come from the connection, never from the message.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::awareness::AwarenessUpdate;
use crate::broadcast::{PeerInfo, PeerReceiver};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{Role, ServerMessage, SyncPayload};
use crate::rooms::{ParticipantService, RoomService};
use crate::runtime::{DocumentRegistry, DocumentRuntime};

/// State of one joined connection.
pub struct Session {
    pub connection_id: Uuid,
    pub doc_id: Uuid,
    pub room_id: Uuid,
    pub participant_id: Uuid,
    pub role: Role,
    /// Awareness client ids introduced through this connection.
    controlled: HashSet<u64>,
    runtime: Arc<DocumentRuntime>,
}

impl Session {
    pub fn runtime(&self) -> &Arc<DocumentRuntime> {
        &self.runtime
    }

    pub fn controlled_clients(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.controlled.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Message confirming the join to the client.
    pub fn joined(&self) -> ServerMessage {
        ServerMessage::Joined {
            doc_id: self.doc_id,
            room_id: self.room_id,
            participant_id: self.participant_id,
            role: self.role,
        }
    }
}

pub struct SyncGateway {
    registry: Arc<DocumentRegistry>,
    rooms: Arc<dyn RoomService>,
    participants: Arc<dyn ParticipantService>,
}

impl SyncGateway {
    pub fn new(
        registry: Arc<DocumentRegistry>,
        rooms: Arc<dyn RoomService>,
        participants: Arc<dyn ParticipantService>,
    ) -> Self {
        Self {
            registry,
            rooms,
            participants,
        }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// Resolve the room and participant, make the document ready, and attach
    /// the connection to its broadcast group.
    pub async fn join(
        &self,
        connection_id: Uuid,
        room_code: &str,
        client_handle: &str,
        participant_id: Option<Uuid>,
    ) -> SyncResult<(Session, PeerReceiver)> {
        let room = self.rooms.find_room_by_code(room_code).await?;
        let participant = self
            .participants
            .join(room.room_id, client_handle, participant_id)
            .await?;
        let runtime = self.prepare_doc(room.doc_id).await?;

        let receiver = runtime.broadcast().add_peer(PeerInfo {
            connection_id,
            participant_id: participant.participant_id,
            role: participant.role,
        });
        runtime.touch();

        log::info!(
            "{client_handle} ({}) joined room {} as {:?}",
            participant.participant_id,
            room.code,
            participant.role
        );

        let session = Session {
            connection_id,
            doc_id: room.doc_id,
            room_id: room.room_id,
            participant_id: participant.participant_id,
            role: participant.role,
            controlled: HashSet::new(),
            runtime,
        };
        Ok((session, receiver))
    }

    /// Ready runtime for the document, hydrating it if needed.
    pub async fn prepare_doc(&self, doc_id: Uuid) -> SyncResult<Arc<DocumentRuntime>> {
        self.registry.create(doc_id).await
    }

    /// Whole document, for bootstrapping a newly joined client.
    pub fn request_full_state(&self, session: &Session) -> SyncResult<ServerMessage> {
        let runtime = self.ready(session)?;
        let message = SyncPayload::Step2(runtime.full_state()).encode()?;
        Ok(ServerMessage::RoomDoc {
            doc_id: session.doc_id,
            message,
        })
    }

    pub fn request_awareness(&self, session: &Session) -> SyncResult<ServerMessage> {
        let runtime = self.ready(session)?;
        Ok(ServerMessage::RoomAwareness {
            doc_id: session.doc_id,
            message: runtime.awareness().encode_all()?,
        })
    }

    /// Size-check, decode and apply a client `UpdateFile` message.
    ///
    /// Returns a reply meant for the sender only (the answer to a `Step1`).
    /// Nothing is applied when the size check or decoding fails.
    pub async fn apply_client_update(
        &self,
        session: &Session,
        message: &[u8],
    ) -> SyncResult<Option<ServerMessage>> {
        if !session.role.can_edit() {
            log::warn!(
                "Participant {} ({:?}) tried to edit {}",
                session.participant_id,
                session.role,
                session.doc_id
            );
            return Err(SyncError::Forbidden);
        }

        let runtime = self.ready(session)?;
        let mut writer = runtime.writer().await?;
        writer.ensure_capacity(message.len() as u64).await?;

        match SyncPayload::decode(message)? {
            SyncPayload::Step1(state_vector) => {
                let reply = SyncPayload::Step2(runtime.diff(&state_vector)?).encode()?;
                Ok(Some(ServerMessage::UpdateFile { message: reply }))
            }
            SyncPayload::Step2(update) | SyncPayload::Update(update) => {
                writer.apply(&update, Some(session.connection_id)).await?;
                Ok(None)
            }
        }
    }

    /// Merge an awareness delta and relay the changed entries to the other
    /// connections of the document. A connection may only remove client ids
    /// it introduced; other removals are dropped.
    pub fn apply_awareness_update(&self, session: &mut Session, message: &[u8]) -> SyncResult<()> {
        let runtime = self.ready(session)?.clone();
        let awareness = runtime.awareness();

        let mut update = AwarenessUpdate::decode(message)?;
        let received = update.entries.len();
        update.entries.retain(|entry| {
            session.controlled.contains(&entry.client_id) || !matches!(entry.parse_state(), Ok(None))
        });
        if update.entries.len() < received {
            log::debug!(
                "Connection {} sent {} awareness removals for clients it does not own",
                session.connection_id,
                received - update.entries.len()
            );
        }

        let change = awareness.apply_update(&update)?;
        if change.is_empty() {
            return Ok(());
        }

        session.controlled.extend(&change.added);
        for id in &change.removed {
            session.controlled.remove(id);
        }

        let delta = awareness.encode_update(&change.changed())?;
        runtime.broadcast().broadcast(
            &ServerMessage::UpdateAwareness { message: delta },
            Some(session.connection_id),
        )?;
        runtime.touch();
        Ok(())
    }

    /// Strip the awareness entries this connection introduced and broadcast
    /// the removal.
    pub fn remove_awareness(&self, session: &mut Session) -> SyncResult<()> {
        let ids: Vec<u64> = session.controlled.drain().collect();
        if ids.is_empty() {
            return Ok(());
        }
        let runtime = session.runtime.clone();
        let change = runtime.awareness().remove_states(&ids);
        if change.is_empty() {
            return Ok(());
        }
        let delta = runtime.awareness().encode_update(&change.removed)?;
        runtime.broadcast().broadcast(
            &ServerMessage::UpdateAwareness { message: delta },
            Some(session.connection_id),
        )?;
        Ok(())
    }

    /// Disconnect cleanup: awareness removal and broadcast detach.
    pub fn leave(&self, mut session: Session) {
        if let Err(e) = self.remove_awareness(&mut session) {
            log::warn!(
                "Awareness cleanup failed for connection {}: {e}",
                session.connection_id
            );
        }
        session.runtime.broadcast().remove_peer(&session.connection_id);
        session.runtime.touch();
        log::info!(
            "Participant {} left document {}",
            session.participant_id,
            session.doc_id
        );
    }

    fn ready<'a>(&self, session: &'a Session) -> SyncResult<&'a Arc<DocumentRuntime>> {
        if session.runtime.is_ready() {
            Ok(&session.runtime)
        } else {
            Err(SyncError::NotReady(session.doc_id))
        }
    }
}
