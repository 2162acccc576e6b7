//! Gateway tests across connections, rooms and processes.

use std::sync::Arc;

use duet_sync::awareness::{AwarenessEntry, AwarenessUpdate};
use duet_sync::broadcast::PeerReceiver;
use duet_sync::config::RuntimeConfig;
use duet_sync::coordination::{MemoryHub, MemoryStore};
use duet_sync::document::{MergeableDocument, YrsDocument};
use duet_sync::error::SyncError;
use duet_sync::gateway::{Session, SyncGateway};
use duet_sync::protocol::{Role, ServerMessage, SyncPayload};
use duet_sync::rooms::RoomDirectory;
use duet_sync::runtime::DocumentRegistry;
use duet_sync::storage::MemorySnapshotStore;
use serde_json::json;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

struct Backend {
    hub: Arc<MemoryHub>,
    snapshots: Arc<MemorySnapshotStore>,
    directory: Arc<RoomDirectory>,
}

impl Backend {
    fn new() -> Self {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        Self {
            hub: MemoryHub::new(),
            directory: Arc::new(RoomDirectory::new(snapshots.clone())),
            snapshots,
        }
    }

    /// One server process with its own registry.
    fn gateway(&self, config: RuntimeConfig) -> SyncGateway {
        let registry = DocumentRegistry::new(
            Arc::new(MemoryStore::connect(&self.hub)),
            self.snapshots.clone(),
            config,
        );
        SyncGateway::new(registry, self.directory.clone(), self.directory.clone())
    }
}

async fn join(gateway: &SyncGateway, room: &str, handle: &str) -> (Session, PeerReceiver) {
    gateway
        .join(Uuid::new_v4(), room, handle, None)
        .await
        .unwrap()
}

async fn next_message(rx: &mut PeerReceiver) -> ServerMessage {
    let frame = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no frame within timeout")
        .expect("broadcast closed");
    ServerMessage::decode(&frame).unwrap()
}

fn update_message(update: Vec<u8>) -> Vec<u8> {
    SyncPayload::Update(update).encode().unwrap()
}

fn presence(client_id: u64, clock: u64, state: Option<serde_json::Value>) -> Vec<u8> {
    AwarenessUpdate {
        entries: vec![AwarenessEntry::new(client_id, clock, state.as_ref())],
    }
    .encode()
    .unwrap()
}

#[tokio::test]
async fn test_size_guard_boundary() {
    let author = YrsDocument::new();
    let first = author.write_file("f", "f.rs", "hello ");
    let second = update_message(author.write_file("f", "f.rs", "world"));
    let third = update_message(author.write_file("f", "f.rs", "!"));

    // After `first`, exactly `second` still fits.
    let limit = first.len() as u64 + second.len() as u64;
    let backend = Backend::new();
    let room = backend.directory.create_room("sized", None).await.unwrap();
    let gateway = backend.gateway(RuntimeConfig {
        max_document_bytes: limit,
        ..RuntimeConfig::for_testing()
    });
    let (session, _rx) = join(&gateway, "sized", "alice").await;

    gateway
        .apply_client_update(&session, &update_message(first))
        .await
        .unwrap();
    gateway.apply_client_update(&session, &second).await.unwrap();
    assert_eq!(backend.hub.log_state(room.doc_id), (2, 0));

    let before = session.runtime().full_state();
    let err = gateway
        .apply_client_update(&session, &third)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::DocumentTooLarge { limit: l, .. } if l == limit));
    assert_eq!(session.runtime().full_state(), before);
    assert_eq!(backend.hub.log_state(room.doc_id), (2, 0));
    assert_eq!(session.runtime().clock(), 2);
}

#[tokio::test]
async fn test_size_guard_one_byte_over() {
    let author = YrsDocument::new();
    let first = author.write_file("f", "f.rs", "hello ");
    let second = update_message(author.write_file("f", "f.rs", "world"));

    let backend = Backend::new();
    let room = backend.directory.create_room("tight", None).await.unwrap();
    let gateway = backend.gateway(RuntimeConfig {
        max_document_bytes: first.len() as u64 + second.len() as u64 - 1,
        ..RuntimeConfig::for_testing()
    });
    let (session, _rx) = join(&gateway, "tight", "alice").await;
    gateway
        .apply_client_update(&session, &update_message(first))
        .await
        .unwrap();

    let before = session.runtime().full_state();
    assert!(matches!(
        gateway.apply_client_update(&session, &second).await,
        Err(SyncError::DocumentTooLarge { .. })
    ));
    assert_eq!(session.runtime().full_state(), before);
    assert_eq!(session.runtime().document().file_text("f").as_deref(), Some("hello "));
    assert_eq!(backend.hub.log_state(room.doc_id), (1, 0));
}

#[tokio::test]
async fn test_awareness_stays_in_its_document() {
    let backend = Backend::new();
    backend.directory.create_room("one", None).await.unwrap();
    backend.directory.create_room("two", None).await.unwrap();
    let gateway = backend.gateway(RuntimeConfig::for_testing());

    let (mut a, mut rx_a) = join(&gateway, "one", "alice").await;
    let (_b, mut rx_b) = join(&gateway, "one", "bob").await;
    let (_c, mut rx_c) = join(&gateway, "two", "carol").await;

    gateway
        .apply_awareness_update(&mut a, &presence(7, 1, Some(json!({"cursor": 3}))))
        .unwrap();

    match next_message(&mut rx_b).await {
        ServerMessage::UpdateAwareness { message } => {
            let update = AwarenessUpdate::decode(&message).unwrap();
            assert_eq!(update.entries.len(), 1);
            assert_eq!(update.entries[0].client_id, 7);
            assert_eq!(update.entries[0].parse_state().unwrap(), Some(json!({"cursor": 3})));
        }
        other => panic!("Expected UpdateAwareness, got {other:?}"),
    }
    assert!(rx_a.try_recv().is_none(), "sender must not get its own update");
    assert!(rx_c.try_recv().is_none(), "other documents must not see it");
    assert_eq!(a.controlled_clients(), vec![7]);

    gateway.leave(a);
    match next_message(&mut rx_b).await {
        ServerMessage::UpdateAwareness { message } => {
            let update = AwarenessUpdate::decode(&message).unwrap();
            assert_eq!(update.entries[0].client_id, 7);
            assert_eq!(update.entries[0].clock, 2);
            assert_eq!(update.entries[0].parse_state().unwrap(), None);
        }
        other => panic!("Expected awareness removal, got {other:?}"),
    }
    assert!(rx_c.try_recv().is_none());
}

#[tokio::test]
async fn test_late_joiner_gets_current_awareness() {
    let backend = Backend::new();
    backend.directory.create_room("room", None).await.unwrap();
    let gateway = backend.gateway(RuntimeConfig::for_testing());

    let (mut a, _rx_a) = join(&gateway, "room", "alice").await;
    gateway
        .apply_awareness_update(&mut a, &presence(1, 4, Some(json!({"name": "alice"}))))
        .unwrap();

    let (b, _rx_b) = join(&gateway, "room", "bob").await;
    match gateway.request_awareness(&b).unwrap() {
        ServerMessage::RoomAwareness { doc_id, message } => {
            assert_eq!(doc_id, b.doc_id);
            let update = AwarenessUpdate::decode(&message).unwrap();
            assert_eq!(update.entries, vec![AwarenessEntry::new(1, 4, Some(&json!({"name": "alice"})))]);
        }
        other => panic!("Expected RoomAwareness, got {other:?}"),
    }
}

#[tokio::test]
async fn test_viewer_is_rejected_but_can_read() {
    let backend = Backend::new();
    backend.directory.create_room("room", None).await.unwrap();
    let gateway = backend.gateway(RuntimeConfig::for_testing());

    let (owner, _rx_owner) = join(&gateway, "room", "owner").await;
    let (viewer, _) = join(&gateway, "room", "viewer").await;
    backend
        .directory
        .set_role(viewer.participant_id, Role::Viewer)
        .unwrap();
    let participant_id = viewer.participant_id;
    gateway.leave(viewer);
    let (viewer, _rx_viewer) = gateway
        .join(Uuid::new_v4(), "room", "viewer", Some(participant_id))
        .await
        .unwrap();
    assert_eq!(viewer.role, Role::Viewer);

    let author = YrsDocument::new();
    let edit = update_message(author.write_file("f", "f.rs", "nope"));
    assert!(matches!(
        gateway.apply_client_update(&viewer, &edit).await,
        Err(SyncError::Forbidden)
    ));
    assert_eq!(owner.runtime().clock(), 0);

    // Reading is still allowed.
    assert!(matches!(
        gateway.request_full_state(&viewer).unwrap(),
        ServerMessage::RoomDoc { .. }
    ));
}

#[tokio::test]
async fn test_step1_reply_contains_missing_updates() {
    let backend = Backend::new();
    backend.directory.create_room("room", None).await.unwrap();
    let gateway = backend.gateway(RuntimeConfig::for_testing());
    let (session, _rx) = join(&gateway, "room", "alice").await;

    let author = YrsDocument::new();
    gateway
        .apply_client_update(&session, &update_message(author.write_file("f", "f.rs", "abc")))
        .await
        .unwrap();

    let fresh = YrsDocument::new();
    let step1 = SyncPayload::Step1(fresh.state_vector()).encode().unwrap();
    let reply = gateway
        .apply_client_update(&session, &step1)
        .await
        .unwrap()
        .expect("Step1 must be answered");

    let ServerMessage::UpdateFile { message } = reply else {
        panic!("Expected UpdateFile reply, got {reply:?}");
    };
    match SyncPayload::decode(&message).unwrap() {
        SyncPayload::Step2(diff) => fresh.apply(&diff).unwrap(),
        other => panic!("Expected Step2, got {other:?}"),
    }
    assert_eq!(fresh.file_text("f").as_deref(), Some("abc"));
    assert_eq!(session.runtime().clock(), 1, "Step1 must not write to the log");
}

#[tokio::test]
async fn test_edit_reaches_connection_on_other_process() {
    let backend = Backend::new();
    backend.directory.create_room("room", None).await.unwrap();
    let node_a = backend.gateway(RuntimeConfig::for_testing());
    let node_b = backend.gateway(RuntimeConfig::for_testing());

    let (alice, _rx_alice) = join(&node_a, "room", "alice").await;
    let (bob, mut rx_bob) = join(&node_b, "room", "bob").await;
    assert_eq!(alice.doc_id, bob.doc_id);

    let author = YrsDocument::new();
    let update = author.write_file("f", "f.rs", "shared");
    node_a
        .apply_client_update(&alice, &update_message(update.clone()))
        .await
        .unwrap();

    match next_message(&mut rx_bob).await {
        ServerMessage::UpdateFile { message } => {
            assert_eq!(SyncPayload::decode(&message).unwrap(), SyncPayload::Update(update));
        }
        other => panic!("Expected UpdateFile, got {other:?}"),
    }
    assert_eq!(bob.runtime().document().file_text("f").as_deref(), Some("shared"));
}
