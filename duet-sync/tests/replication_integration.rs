//! Multi-process replication tests.
//!
//! Each `Node` is one server process: its own coordination handle and its own
//! document registry. All nodes share one `MemoryHub` (the Redis stand-in)
//! and one snapshot store (the durable database).

use std::sync::Arc;

use duet_sync::config::RuntimeConfig;
use duet_sync::coordination::{MemoryHub, MemoryStore};
use duet_sync::document::{MergeableDocument, YrsDocument};
use duet_sync::error::SyncError;
use duet_sync::runtime::{DocumentRegistry, DocumentRuntime};
use duet_sync::storage::{MemorySnapshotStore, SnapshotStore};
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

struct Cluster {
    hub: Arc<MemoryHub>,
    snapshots: Arc<MemorySnapshotStore>,
}

struct Node {
    store: Arc<MemoryStore>,
    registry: Arc<DocumentRegistry>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
            snapshots: Arc::new(MemorySnapshotStore::new()),
        }
    }

    fn node(&self) -> Node {
        self.node_with(RuntimeConfig::for_testing())
    }

    fn node_with(&self, config: RuntimeConfig) -> Node {
        let store = Arc::new(MemoryStore::connect(&self.hub));
        let registry = DocumentRegistry::new(store.clone(), self.snapshots.clone(), config);
        Node { store, registry }
    }

    async fn new_document(&self) -> Uuid {
        let doc_id = Uuid::new_v4();
        self.snapshots.create(doc_id, Uuid::new_v4()).await.unwrap();
        doc_id
    }
}

/// Poll until `check` holds, failing after two seconds.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let result = timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Timed out waiting for {what}");
}

fn text(runtime: &DocumentRuntime, file_id: &str) -> Option<String> {
    runtime.document().file_text(file_id)
}

#[tokio::test]
async fn test_update_reaches_other_process() {
    let cluster = Cluster::new();
    let doc_id = cluster.new_document().await;
    let a = cluster.node();
    let b = cluster.node();

    let rt_a = a.registry.create(doc_id).await.unwrap();
    let rt_b = b.registry.create(doc_id).await.unwrap();

    let author = YrsDocument::new();
    let clock = rt_a
        .apply_local(&author.write_file("main", "main.rs", "fn main() {}"), None)
        .await
        .unwrap();
    assert_eq!(clock, 1);

    eventually("B to catch up", || rt_b.clock() == 1).await;
    assert_eq!(text(&rt_b, "main").as_deref(), Some("fn main() {}"));
}

#[tokio::test]
async fn test_clocks_are_gapless_under_interleaving() {
    let cluster = Cluster::new();
    let doc_id = cluster.new_document().await;
    let a = cluster.node();
    let b = cluster.node();
    let rt_a = a.registry.create(doc_id).await.unwrap();
    let rt_b = b.registry.create(doc_id).await.unwrap();

    let writer_a = YrsDocument::new();
    let writer_b = YrsDocument::new();

    let task_a = {
        let rt = rt_a.clone();
        tokio::spawn(async move {
            let mut clocks = Vec::new();
            for i in 0..20 {
                let update = writer_a.write_file("a", "a.rs", &format!("a{i};"));
                clocks.push(rt.apply_local(&update, None).await.unwrap());
            }
            clocks
        })
    };
    let task_b = {
        let rt = rt_b.clone();
        tokio::spawn(async move {
            let mut clocks = Vec::new();
            for i in 0..20 {
                let update = writer_b.write_file("b", "b.rs", &format!("b{i};"));
                clocks.push(rt.apply_local(&update, None).await.unwrap());
            }
            clocks
        })
    };

    let mut clocks = task_a.await.unwrap();
    clocks.extend(task_b.await.unwrap());
    clocks.sort_unstable();
    assert_eq!(clocks, (1..=40).collect::<Vec<u64>>());

    eventually("both nodes at clock 40", || {
        rt_a.clock() == 40 && rt_b.clock() == 40
    })
    .await;
    assert_eq!(text(&rt_a, "a"), text(&rt_b, "a"));
    assert_eq!(text(&rt_a, "b"), text(&rt_b, "b"));
}

#[tokio::test]
async fn test_lost_notifications_recovered_on_resync() {
    let cluster = Cluster::new();
    let doc_id = cluster.new_document().await;
    let a = cluster.node();
    let b = cluster.node();
    let rt_a = a.registry.create(doc_id).await.unwrap();
    let rt_b = b.registry.create(doc_id).await.unwrap();

    a.store.set_muted(true);
    let author = YrsDocument::new();
    for i in 0..3 {
        rt_a.apply_local(&author.write_file("f", "f.rs", &format!("{i}")), None)
            .await
            .unwrap();
    }

    sleep(Duration::from_millis(50)).await;
    assert_eq!(rt_b.clock(), 0, "muted publishes must not arrive");

    b.store.simulate_reconnect();
    eventually("B to resync", || rt_b.clock() == 3).await;
    assert_eq!(text(&rt_b, "f").as_deref(), Some("012"));
}

#[tokio::test]
async fn test_compaction_then_fresh_hydration() {
    let cluster = Cluster::new();
    let doc_id = cluster.new_document().await;
    let a = cluster.node();
    let rt_a = a.registry.create(doc_id).await.unwrap();

    let author = YrsDocument::new();
    rt_a.apply_local(&author.write_file("f", "f.rs", "one "), None)
        .await
        .unwrap();
    rt_a.apply_local(&author.write_file("f", "f.rs", "two "), None)
        .await
        .unwrap();

    assert_eq!(rt_a.compact().await.unwrap(), Some(2));
    assert_eq!(cluster.hub.log_state(doc_id), (0, 2));

    rt_a.apply_local(&author.write_file("f", "f.rs", "three"), None)
        .await
        .unwrap();
    assert_eq!(cluster.hub.log_state(doc_id), (1, 2));

    // A process that never saw the document hydrates from snapshot + tail.
    let c = cluster.node();
    let rt_c = c.registry.create(doc_id).await.unwrap();
    assert_eq!(rt_c.clock(), 3);
    assert_eq!(text(&rt_c, "f").as_deref(), Some("one two three"));
}

#[tokio::test]
async fn test_lagging_process_reloads_snapshot_after_compaction() {
    let cluster = Cluster::new();
    let doc_id = cluster.new_document().await;
    let a = cluster.node();
    let b = cluster.node();
    let rt_a = a.registry.create(doc_id).await.unwrap();
    let rt_b = b.registry.create(doc_id).await.unwrap();

    a.store.set_muted(true);
    let author = YrsDocument::new();
    for word in ["alpha ", "beta ", "gamma"] {
        rt_a.apply_local(&author.write_file("f", "f.rs", word), None)
            .await
            .unwrap();
    }
    assert_eq!(rt_a.compact().await.unwrap(), Some(3));
    assert_eq!(rt_b.clock(), 0);

    // B's entries 1..=3 are gone from the log; it must take the snapshot.
    b.store.simulate_reconnect();
    eventually("B to reload the snapshot", || rt_b.clock() == 3).await;
    assert_eq!(text(&rt_b, "f").as_deref(), Some("alpha beta gamma"));
}

#[tokio::test]
async fn test_concurrent_compactions_fold_once() {
    let cluster = Cluster::new();
    let doc_id = cluster.new_document().await;
    let a = cluster.node();
    let b = cluster.node();
    let rt_a = a.registry.create(doc_id).await.unwrap();

    let author = YrsDocument::new();
    for i in 0..5 {
        rt_a.apply_local(&author.write_file("f", "f.rs", &format!("{i}")), None)
            .await
            .unwrap();
    }

    let (first, second) = tokio::join!(a.registry.compact(doc_id), b.registry.compact(doc_id));
    let committed: Vec<u64> = [first.unwrap(), second.unwrap()].into_iter().flatten().collect();
    assert!(!committed.is_empty());
    assert!(committed.iter().all(|offset| *offset == 5));
    assert_eq!(cluster.hub.log_state(doc_id), (0, 5));

    let row = cluster.snapshots.load(doc_id).await.unwrap();
    assert_eq!(row.clock, 5);
    let restored = YrsDocument::new();
    restored.apply(row.content.as_deref().unwrap()).unwrap();
    assert_eq!(restored.file_text("f").as_deref(), Some("01234"));
}

#[tokio::test]
async fn test_concurrent_create_shares_one_runtime() {
    let cluster = Cluster::new();
    let doc_id = cluster.new_document().await;
    let node = cluster.node();

    let (first, second) = tokio::join!(node.registry.create(doc_id), node.registry.create(doc_id));
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(node.registry.len(), 1);
    assert!(node.store.is_subscribed(doc_id));
}

#[tokio::test]
async fn test_unknown_document_fails_hydration() {
    let cluster = Cluster::new();
    let node = cluster.node();
    let missing = Uuid::new_v4();

    assert!(node.registry.create(missing).await.is_err());
    assert!(node.registry.is_empty());
    assert!(!node.store.is_subscribed(missing));
}

#[tokio::test]
async fn test_closed_document_rehydrates_with_history() {
    let cluster = Cluster::new();
    let doc_id = cluster.new_document().await;
    let node = cluster.node();

    let rt = node.registry.create(doc_id).await.unwrap();
    rt.apply_local(&YrsDocument::new().write_file("f", "f.rs", "kept"), None)
        .await
        .unwrap();
    assert!(node.registry.close(doc_id).await);
    assert!(!rt.is_ready());
    assert!(!node.store.is_subscribed(doc_id));

    let again = node.registry.create(doc_id).await.unwrap();
    assert!(!Arc::ptr_eq(&rt, &again));
    assert_eq!(again.clock(), 1);
    assert_eq!(text(&again, "f").as_deref(), Some("kept"));
}

#[tokio::test]
async fn test_size_guard_counts_snapshot_compacted_elsewhere() {
    let cluster = Cluster::new();
    let doc_id = cluster.new_document().await;
    let a = cluster.node_with(RuntimeConfig {
        max_document_bytes: 1_000,
        ..RuntimeConfig::for_testing()
    });
    let b = cluster.node();
    let rt_a = a.registry.create(doc_id).await.unwrap();

    let body = "x".repeat(4_000);
    rt_a.apply_local(&YrsDocument::new().write_file("f", "f.rs", &body), None)
        .await
        .unwrap();

    // B folds A's entry into the durable row; the log is now empty.
    assert_eq!(b.registry.compact(doc_id).await.unwrap(), Some(1));
    assert_eq!(cluster.hub.log_state(doc_id), (0, 1));
    let durable = cluster.snapshots.load(doc_id).await.unwrap().content_len();
    assert!(durable >= 4_000);

    let writer = rt_a.writer().await.unwrap();
    let result = writer.ensure_capacity(16).await;
    drop(writer);
    assert!(matches!(
        result,
        Err(SyncError::DocumentTooLarge { expected, limit: 1_000 }) if expected == durable + 16
    ));
    assert_eq!(rt_a.snapshot_len(), durable);
}
