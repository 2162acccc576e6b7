use thiserror::Error;
use uuid::Uuid;

use crate::coordination::CoordinationError;
use crate::document::DocumentError;
use crate::protocol::{ErrorKind, ProtocolError};
use crate::storage::StoreError;

/// Errors surfaced by the runtime and the gateway.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// No room or durable row backs this id.
    #[error("Not found: {0}")]
    NotFound(Uuid),

    #[error("No room with code {0:?}")]
    RoomNotFound(String),

    #[error("Document too large: {expected} bytes exceeds limit of {limit}")]
    DocumentTooLarge { expected: u64, limit: u64 },

    #[error("Operation not permitted for this participant")]
    Forbidden,

    /// The runtime is hydrating, closed, or removed.
    #[error("Document {0} is not ready")]
    NotReady(Uuid),

    #[error("Connection has not joined a room")]
    NotJoined,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SyncError::NotFound(id),
            other => SyncError::Storage(other),
        }
    }
}

impl SyncError {
    /// Category reported to the client.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) | SyncError::RoomNotFound(_) => ErrorKind::NotFound,
            SyncError::DocumentTooLarge { .. } => ErrorKind::DocumentTooLarge,
            SyncError::Forbidden => ErrorKind::Forbidden,
            SyncError::NotJoined => ErrorKind::NotJoined,
            SyncError::Protocol(_) | SyncError::Document(_) => ErrorKind::Malformed,
            SyncError::NotReady(_) | SyncError::Coordination(_) | SyncError::Storage(_) => {
                ErrorKind::Unavailable
            }
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let id = Uuid::new_v4();
        let err: SyncError = StoreError::NotFound(id).into();
        assert!(matches!(err, SyncError::NotFound(found) if found == id));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: SyncError = StoreError::DatabaseError("io".into()).into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SyncError::DocumentTooLarge { expected: 11, limit: 10 }.kind(),
            ErrorKind::DocumentTooLarge
        );
        assert_eq!(
            SyncError::from(ProtocolError::DeserializationError("eof".into())).kind(),
            ErrorKind::Malformed
        );
        assert_eq!(
            SyncError::from(CoordinationError::CommandFailed("down".into())).kind(),
            ErrorKind::Unavailable
        );
    }

    #[test]
    fn test_display() {
        let err = SyncError::DocumentTooLarge { expected: 11, limit: 10 };
        assert_eq!(
            err.to_string(),
            "Document too large: 11 bytes exceeds limit of 10"
        );
    }
}
