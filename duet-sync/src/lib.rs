//! # duet-sync: real-time sync backend for a collaborative code editor
//!
//! Every document is a Yrs CRDT holding a map of files. Any number of server
//! processes may host the same document; they agree on its history through a
//! shared replication log and converge by merging updates.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  WebSocket   ┌─────────────┐        ┌──────────────────┐
//! │ editor      │ ◄──────────► │ SyncServer  │        │ coordination     │
//! │ client      │  bincode     │ SyncGateway │        │ (Redis / memory) │
//! └─────────────┘              └──────┬──────┘        │  log + pub/sub   │
//!                                     │               └────────▲─────────┘
//!                                     ▼                        │ push / pull
//!                              ┌─────────────┐   replicate     │
//!                              │ Document    │ ────────────────┘
//!                              │ Runtime     │ ◄── clock notifications
//!                              └──────┬──────┘
//!                     fan-out ┌───────┴───────┐ compaction
//!                             ▼               ▼
//!                      BroadcastGroup   SnapshotStore (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: client/server wire messages
//! - [`document`]: the Yrs document and its root maps
//! - [`coordination`]: replication log and pub/sub backends
//! - [`replication`]: per-document view of the log, compaction protocol
//! - [`storage`]: durable snapshot rows
//! - [`runtime`]: hydration, catch-up, writes, document registry
//! - [`awareness`]: ephemeral presence states
//! - [`broadcast`]: per-document fan-out to connections
//! - [`rooms`]: room and participant lookup
//! - [`gateway`]: per-connection operations with role gating
//! - [`server`]: WebSocket transport
//! - [`maintenance`]: expiry, compaction and idle-close pass

pub mod awareness;
pub mod broadcast;
pub mod config;
pub mod coordination;
pub mod document;
pub mod error;
pub mod gateway;
pub mod maintenance;
pub mod protocol;
pub mod replication;
pub mod rooms;
pub mod runtime;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use awareness::{AwarenessChannel, AwarenessChange, AwarenessEntry, AwarenessUpdate};
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerInfo, PeerReceiver};
pub use config::{ConfigError, CoordinationConfig, MaintenanceConfig, RuntimeConfig, ServerConfig};
pub use coordination::{
    CoordinationError, CoordinationStore, LogPush, LogRange, MemoryHub, MemoryStore,
    Notification, RedisStore,
};
pub use document::{DocumentError, MergeableDocument, YrsDocument};
pub use error::{SyncError, SyncResult};
pub use gateway::{Session, SyncGateway};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use protocol::{ClientMessage, ErrorKind, ProtocolError, Role, ServerMessage, SyncPayload};
pub use replication::{Compaction, ReplicationLog};
pub use rooms::{Participant, ParticipantService, RoomDirectory, RoomRecord, RoomService};
pub use runtime::{
    compact_document, CompactionOutcome, DocumentRegistry, DocumentRuntime, DocumentStatus,
    DocumentWriter,
};
pub use server::{ServerStats, SyncServer};
pub use storage::{
    DurableSnapshot, MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig,
    StoreError,
};
