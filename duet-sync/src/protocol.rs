//! Binary wire protocol between browser clients and the sync gateway.
//!
//! Every WebSocket binary frame carries one bincode-encoded message:
//! ```text
//! client ──► ClientMessage { JoinRoom | RequestDoc | RequestAwareness
//!                          | UpdateFile | UpdateAwareness | Ping }
//! server ──► ServerMessage { Joined | RoomDoc | RoomAwareness
//!                          | UpdateFile | UpdateAwareness | Pong | Error }
//! ```
//!
//! `UpdateFile.message` is itself a bincode [`SyncPayload`] (the document sync
//! protocol), and `UpdateAwareness.message` an encoded
//! [`AwarenessUpdate`](crate::awareness::AwarenessUpdate). Both stay opaque to
//! the outer envelope so they can be relayed without re-encoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Participant permission level inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Editor,
    /// Read-only: may watch the document and share presence, never edit.
    Viewer,
}

impl Role {
    pub fn can_edit(&self) -> bool {
        !matches!(self, Role::Viewer)
    }
}

/// Document sync sub-protocol carried inside `UpdateFile` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPayload {
    /// Sender's state vector; the receiver answers with the missing diff.
    Step1(Vec<u8>),
    /// Diff (or full state) answering a `Step1`.
    Step2(Vec<u8>),
    /// Incremental CRDT update.
    Update(Vec<u8>),
}

impl SyncPayload {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    JoinRoom {
        room_code: String,
        client_handle: String,
        participant_id: Option<Uuid>,
    },
    RequestDoc,
    RequestAwareness,
    UpdateFile { message: Vec<u8> },
    UpdateAwareness { message: Vec<u8> },
    Ping,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Failure category reported to the originating connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    NotJoined,
    Forbidden,
    DocumentTooLarge,
    Malformed,
    Unavailable,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Joined {
        doc_id: Uuid,
        room_id: Uuid,
        participant_id: Uuid,
        role: Role,
    },
    RoomDoc { doc_id: Uuid, message: Vec<u8> },
    RoomAwareness { doc_id: Uuid, message: Vec<u8> },
    UpdateFile { message: Vec<u8> },
    UpdateAwareness { message: Vec<u8> },
    Pong,
    Error { kind: ErrorKind, message: String },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}
