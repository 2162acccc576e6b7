//! In-memory document runtimes and the process-wide registry.
//!
//! ```text
//!             create(doc)                    close(doc) / remove(doc)
//! (absent) ──────────────► Hydrating ──► Ready ──────────────────────► Closed | Removed
//!                              │
//!                              ├─ load durable snapshot, apply content
//!                              ├─ subscribe to the document channel
//!                              └─ pull the log from snapshot.clock
//! ```
//!
//! Local writes serialize on a per-document async lock held across
//! apply → size check → push → publish. Fetched (remote) entries are applied
//! under the same lock with the applying-fetched flag set, so the local-update
//! hook never pushes them back into the log.
//!
//! Catch-up is single-flight per document: a notification carrying a clock
//! ahead of the local one raises the fetch target and starts a pull task only
//! if none is running. The task keeps pulling while the target is ahead, and
//! gives up on the target when a pull returns nothing new.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, MutexGuard};
use uuid::Uuid;

use crate::awareness::AwarenessChannel;
use crate::broadcast::BroadcastGroup;
use crate::config::RuntimeConfig;
use crate::coordination::{CoordinationStore, LogRange, Notification};
use crate::document::{MergeableDocument, YrsDocument};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ServerMessage, SyncPayload};
use crate::replication::ReplicationLog;
use crate::storage::SnapshotStore;

/// Lifecycle of a [`DocumentRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Hydrating,
    Ready,
    /// Released from memory; log and durable row kept.
    Closed,
    /// Erased together with its log and durable row.
    Removed,
}

#[derive(Debug, Default)]
struct FetchState {
    /// Highest clock some notification told us about.
    target: u64,
    in_flight: bool,
}

/// One document held in memory by this process.
pub struct DocumentRuntime {
    doc_id: Uuid,
    document: YrsDocument,
    log: ReplicationLog,
    snapshots: Arc<dyn SnapshotStore>,
    config: RuntimeConfig,

    /// Highest clock such that every entry up to it is in `document`.
    clock: AtomicU64,
    /// Byte length of the durable content last seen.
    snapshot_len: AtomicU64,
    fetch: Mutex<FetchState>,
    /// Set while fetched entries are being applied.
    applying_fetched: AtomicBool,
    /// Clocks of our own pushes that landed past a gap.
    own_pushes: Mutex<BTreeSet<u64>>,
    write_lock: tokio::sync::Mutex<()>,

    status: watch::Sender<DocumentStatus>,
    broadcast: BroadcastGroup,
    awareness: AwarenessChannel,
    last_active: Mutex<Instant>,
}

impl DocumentRuntime {
    fn new(
        doc_id: Uuid,
        coordination: Arc<dyn CoordinationStore>,
        snapshots: Arc<dyn SnapshotStore>,
        config: RuntimeConfig,
    ) -> Self {
        let (status, _) = watch::channel(DocumentStatus::Hydrating);
        Self {
            doc_id,
            document: YrsDocument::new(),
            log: ReplicationLog::new(doc_id, coordination),
            snapshots,
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            config,
            clock: AtomicU64::new(0),
            snapshot_len: AtomicU64::new(0),
            // Hydration owns the first fetch.
            fetch: Mutex::new(FetchState {
                target: 0,
                in_flight: true,
            }),
            applying_fetched: AtomicBool::new(false),
            own_pushes: Mutex::new(BTreeSet::new()),
            write_lock: tokio::sync::Mutex::new(()),
            status,
            awareness: AwarenessChannel::new(),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn status(&self) -> DocumentStatus {
        *self.status.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == DocumentStatus::Ready
    }

    /// Logical clock reached by this runtime.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn document(&self) -> &YrsDocument {
        &self.document
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn awareness(&self) -> &AwarenessChannel {
        &self.awareness
    }

    pub fn log(&self) -> &ReplicationLog {
        &self.log
    }

    pub fn full_state(&self) -> Vec<u8> {
        self.document.full_state()
    }

    pub fn diff(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        Ok(self.document.diff(state_vector)?)
    }

    /// Byte length of the durable content as last read by this runtime.
    pub fn snapshot_len(&self) -> u64 {
        self.snapshot_len.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Wait until hydration finishes. Errors unless the runtime ended up `Ready`.
    pub async fn wait_ready(&self) -> SyncResult<()> {
        let mut rx = self.status.subscribe();
        let status = *rx
            .wait_for(|s| *s != DocumentStatus::Hydrating)
            .await
            .map_err(|_| SyncError::NotReady(self.doc_id))?;
        match status {
            DocumentStatus::Ready => Ok(()),
            _ => Err(SyncError::NotReady(self.doc_id)),
        }
    }

    fn set_status(&self, status: DocumentStatus) {
        self.status.send_replace(status);
    }

    async fn hydrate(self: &Arc<Self>) -> SyncResult<()> {
        let snapshot = self.snapshots.load(self.doc_id).await?;

        {
            let _guard = self.write_lock.lock().await;
            if let Some(content) = &snapshot.content {
                self.apply_fetched_entry(content)?;
            }
            self.clock.store(snapshot.clock, Ordering::SeqCst);
            self.snapshot_len
                .store(snapshot.content_len(), Ordering::SeqCst);
        }

        self.log.subscribe().await?;
        self.pull_pending().await?;
        self.finish_hydration();

        log::info!(
            "Hydrated document {} at clock {} ({} bytes durable)",
            self.doc_id,
            self.clock(),
            snapshot.content_len()
        );
        Ok(())
    }

    /// Go `Ready` and hand the fetch slot over to notifications. A clock
    /// announced after the last hydration pull is chased right away.
    fn finish_hydration(self: &Arc<Self>) {
        self.set_status(DocumentStatus::Ready);
        let start = {
            let mut fetch = self.fetch.lock();
            let clock = self.clock();
            if fetch.target > clock {
                true
            } else {
                fetch.target = clock;
                fetch.in_flight = false;
                false
            }
        };
        if start {
            log::debug!("Document {} announced past its hydration pull", self.doc_id);
            self.spawn_fetch();
        }
    }

    /// Take the per-document write lock. Fails unless `Ready`.
    pub async fn writer(self: &Arc<Self>) -> SyncResult<DocumentWriter<'_>> {
        let guard = self.write_lock.lock().await;
        if !self.is_ready() {
            return Err(SyncError::NotReady(self.doc_id));
        }
        Ok(DocumentWriter {
            runtime: self,
            _guard: guard,
        })
    }

    /// Apply and replicate a local update in one step.
    pub async fn apply_local(self: &Arc<Self>, update: &[u8], origin: Option<Uuid>) -> SyncResult<u64> {
        self.writer().await?.apply(update, origin).await
    }

    /// Handle a published clock for this document.
    pub fn notify(self: &Arc<Self>, clock: u64) {
        if clock <= self.clock() {
            return;
        }
        let start = {
            let mut fetch = self.fetch.lock();
            fetch.target = fetch.target.max(clock);
            if fetch.in_flight {
                false
            } else {
                fetch.in_flight = true;
                true
            }
        };
        if start {
            self.spawn_fetch();
        }
    }

    /// Pull regardless of known clocks (after a lost subscription).
    pub fn resync(self: &Arc<Self>) {
        let start = {
            let mut fetch = self.fetch.lock();
            if fetch.in_flight {
                // Force one more round after the running one.
                fetch.target = fetch.target.max(self.clock() + 1);
                false
            } else {
                fetch.in_flight = true;
                true
            }
        };
        if start {
            self.spawn_fetch();
        }
    }

    fn spawn_fetch(self: &Arc<Self>) {
        let runtime = self.clone();
        tokio::spawn(async move { runtime.run_fetch().await });
    }

    async fn run_fetch(self: Arc<Self>) {
        loop {
            if !self.is_ready() {
                self.fetch.lock().in_flight = false;
                return;
            }
            if let Err(e) = self.pull_pending().await {
                log::error!("Catch-up failed for document {}: {e}", self.doc_id);
                self.fetch.lock().in_flight = false;
                return;
            }
            let mut fetch = self.fetch.lock();
            if fetch.target <= self.clock() {
                fetch.in_flight = false;
                return;
            }
        }
    }

    /// Pull until the target is reached or a pull brings nothing new.
    async fn pull_pending(&self) -> SyncResult<()> {
        loop {
            let wanted = self.fetch.lock().target;
            let since = self.clock();
            let range = self.log.pull(since).await?;

            if range.offset > since {
                self.reload_snapshot(range.offset).await?;
            }
            let advanced = self.apply_fetched(&range).await?;

            let mut fetch = self.fetch.lock();
            let clock = self.clock();
            if !advanced && fetch.target > clock {
                if fetch.target == wanted {
                    log::debug!(
                        "Document {} target {} unmet after empty pull, settling at {clock}",
                        self.doc_id,
                        fetch.target
                    );
                    fetch.target = clock;
                }
                // A newer notification raised the target meanwhile; go again.
                else {
                    continue;
                }
            }
            if fetch.target <= clock {
                return Ok(());
            }
        }
    }

    /// Entries below `offset` were folded into a snapshot we have not seen.
    async fn reload_snapshot(&self, offset: u64) -> SyncResult<()> {
        let snapshot = self.snapshots.load(self.doc_id).await?;
        let _guard = self.write_lock.lock().await;
        if let Some(content) = &snapshot.content {
            self.apply_fetched_entry(content)?;
        }
        self.snapshot_len
            .store(snapshot.content_len(), Ordering::SeqCst);
        if snapshot.clock < offset {
            log::warn!(
                "Durable snapshot of {} at clock {} is behind log offset {offset}",
                self.doc_id,
                snapshot.clock
            );
        }
        if snapshot.clock > self.clock() {
            self.advance_clock(snapshot.clock);
        }
        log::debug!(
            "Reloaded snapshot of {} at clock {}",
            self.doc_id,
            snapshot.clock
        );
        Ok(())
    }

    /// Apply pulled entries in clock order. Returns whether the clock moved.
    async fn apply_fetched(&self, range: &LogRange) -> SyncResult<bool> {
        let _guard = self.write_lock.lock().await;
        let before = self.clock();
        let first = range.first_clock();

        for (i, update) in range.updates.iter().enumerate() {
            let clock = first + i as u64;
            if clock <= self.clock() {
                continue;
            }
            if self.own_pushes.lock().remove(&clock) {
                self.clock.store(clock, Ordering::SeqCst);
                continue;
            }
            match self.apply_fetched_entry(update) {
                Ok(()) => {
                    self.broadcast_update(update, None);
                }
                Err(e) => {
                    log::error!(
                        "Skipping unreadable log entry {clock} of document {}: {e}",
                        self.doc_id
                    );
                }
            }
            self.clock.store(clock, Ordering::SeqCst);
        }
        self.absorb_own_pushes();

        let advanced = self.clock() > before;
        if advanced {
            log::trace!(
                "Document {} caught up {before} -> {}",
                self.doc_id,
                self.clock()
            );
        }
        Ok(advanced)
    }

    /// Apply an update with the re-entrancy flag held.
    fn apply_fetched_entry(&self, update: &[u8]) -> SyncResult<()> {
        self.applying_fetched.store(true, Ordering::SeqCst);
        let result = self.document.apply(update);
        self.applying_fetched.store(false, Ordering::SeqCst);
        Ok(result?)
    }

    /// Local-update hook: push and publish an update applied by a local writer.
    /// Returns `None` for updates that came from the log.
    async fn replicate(&self, update: &[u8]) -> SyncResult<Option<u64>> {
        if self.applying_fetched.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let push = self.log.push(update).await?;
        let clock = push.clock();
        self.record_push(clock);
        self.log.publish(clock).await?;
        Ok(Some(clock))
    }

    fn record_push(&self, clock: u64) {
        let current = self.clock();
        if clock == current + 1 {
            self.clock.store(clock, Ordering::SeqCst);
            self.absorb_own_pushes();
        } else if clock > current + 1 {
            self.own_pushes.lock().insert(clock);
        }
    }

    fn advance_clock(&self, clock: u64) {
        self.clock.fetch_max(clock, Ordering::SeqCst);
        let reached = self.clock();
        self.own_pushes.lock().retain(|c| *c > reached);
        self.absorb_own_pushes();
    }

    /// Move the clock over our own pushes that are now contiguous.
    fn absorb_own_pushes(&self) {
        let mut own = self.own_pushes.lock();
        loop {
            let next = self.clock() + 1;
            if !own.remove(&next) {
                break;
            }
            self.clock.store(next, Ordering::SeqCst);
        }
        let reached = self.clock();
        own.retain(|c| *c > reached);
    }

    fn broadcast_update(&self, update: &[u8], origin: Option<Uuid>) {
        let message = match SyncPayload::Update(update.to_vec()).encode() {
            Ok(message) => message,
            Err(e) => {
                log::error!("Failed to encode update for {}: {e}", self.doc_id);
                return;
            }
        };
        if let Err(e) = self
            .broadcast
            .broadcast(&ServerMessage::UpdateFile { message }, origin)
        {
            log::error!("Failed to broadcast update for {}: {e}", self.doc_id);
        }
    }

    async fn shutdown(&self, status: DocumentStatus) {
        {
            let _guard = self.write_lock.lock().await;
            self.set_status(status);
        }
        if let Err(e) = self.log.unsubscribe().await {
            log::warn!("Failed to unsubscribe document {}: {e}", self.doc_id);
        }
    }

    /// Fold the log into the durable snapshot. See [`compact_document`].
    pub async fn compact(&self) -> SyncResult<Option<u64>> {
        let result = compact_document(&self.log, self.snapshots.as_ref()).await?;
        if let Some(outcome) = &result {
            self.snapshot_len.store(outcome.snapshot_len, Ordering::SeqCst);
        }
        Ok(result.map(|outcome| outcome.offset))
    }
}

/// Exclusive write access to one document.
pub struct DocumentWriter<'a> {
    runtime: &'a Arc<DocumentRuntime>,
    _guard: MutexGuard<'a, ()>,
}

impl DocumentWriter<'_> {
    /// Reject when durable + log + incoming bytes exceed the configured limit.
    ///
    /// The durable length is read from the store every time: another process
    /// may have compacted since this runtime last looked.
    pub async fn ensure_capacity(&self, incoming: u64) -> SyncResult<()> {
        let runtime = self.runtime;
        let limit = runtime.config.max_document_bytes;
        let durable = runtime.snapshots.load(runtime.doc_id).await?.content_len();
        runtime.snapshot_len.store(durable, Ordering::SeqCst);
        let expected = durable + runtime.log.byte_len().await? + incoming;
        if expected > limit {
            log::warn!(
                "Rejecting update to {}: {expected} bytes exceeds {limit}",
                runtime.doc_id
            );
            return Err(SyncError::DocumentTooLarge { expected, limit });
        }
        Ok(())
    }

    /// Apply, broadcast to local peers except `origin`, push, publish.
    /// Returns the clock assigned by the log.
    pub async fn apply(&mut self, update: &[u8], origin: Option<Uuid>) -> SyncResult<u64> {
        let runtime = self.runtime;
        runtime.document.apply(update)?;
        runtime.touch();
        runtime.broadcast_update(update, origin);

        let clock = match runtime.replicate(update).await {
            Ok(Some(clock)) => clock,
            Ok(None) => return Ok(runtime.clock()),
            Err(e) => {
                log::error!(
                    "Update applied to {} but not replicated: {e}",
                    runtime.doc_id
                );
                return Err(e);
            }
        };

        if clock > runtime.clock() {
            // Someone pushed between our last pull and this push.
            runtime.notify(clock);
        }
        log::trace!("Document {} local update at clock {clock}", runtime.doc_id);
        Ok(clock)
    }
}

/// Result of a committed compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub offset: u64,
    pub folded: u64,
    pub snapshot_len: u64,
}

/// Read the log, merge it into the durable content, save with the new
/// offset as clock, then trim exactly the folded entries.
///
/// The snapshot is written before the trim: a crash in between leaves a
/// snapshot ahead of the offset, which readers tolerate because applying an
/// update twice is a no-op. Returns `None` for an empty log or when another
/// process committed first.
pub async fn compact_document(
    log: &ReplicationLog,
    snapshots: &dyn SnapshotStore,
) -> SyncResult<Option<CompactionOutcome>> {
    let doc_id = log.doc_id();
    let Some(compaction) = log.compact().await? else {
        return Ok(None);
    };

    let snapshot = snapshots.load(doc_id).await?;
    let merged = YrsDocument::merge(snapshot.content.as_deref(), &compaction.updates)?;
    let new_offset = compaction.new_offset();
    let saved = snapshots.save(doc_id, &merged, new_offset).await?;

    match log.commit(&compaction).await? {
        Some(offset) => {
            log::info!(
                "Compacted document {doc_id}: {} entries ({} bytes) folded, offset now {offset}",
                compaction.updates.len(),
                compaction.byte_len()
            );
            let snapshot_len = if saved {
                merged.len() as u64
            } else {
                snapshots.load(doc_id).await?.content_len()
            };
            Ok(Some(CompactionOutcome {
                offset,
                folded: compaction.updates.len() as u64,
                snapshot_len,
            }))
        }
        None => {
            log::debug!("Compaction of {doc_id} lost the race to another process");
            Ok(None)
        }
    }
}

/// Process-wide map of loaded documents.
pub struct DocumentRegistry {
    coordination: Arc<dyn CoordinationStore>,
    snapshots: Arc<dyn SnapshotStore>,
    config: RuntimeConfig,
    documents: Mutex<HashMap<Uuid, Arc<DocumentRuntime>>>,
}

impl DocumentRegistry {
    /// Create the registry and start routing coordination notifications to it.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        snapshots: Arc<dyn SnapshotStore>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let notifications = coordination.notifications();
        let registry = Arc::new(Self {
            coordination,
            snapshots,
            config,
            documents: Mutex::new(HashMap::new()),
        });
        tokio::spawn(dispatch(Arc::downgrade(&registry), notifications));
        registry
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    pub fn coordination(&self) -> &Arc<dyn CoordinationStore> {
        &self.coordination
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Ready runtime for `doc_id`, hydrating it on first use.
    ///
    /// Concurrent callers share one hydration and receive the same `Arc`.
    pub async fn create(&self, doc_id: Uuid) -> SyncResult<Arc<DocumentRuntime>> {
        let (runtime, fresh) = {
            let mut documents = self.documents.lock();
            match documents.get(&doc_id) {
                Some(runtime) => (runtime.clone(), false),
                None => {
                    let runtime = Arc::new(DocumentRuntime::new(
                        doc_id,
                        self.coordination.clone(),
                        self.snapshots.clone(),
                        self.config.clone(),
                    ));
                    documents.insert(doc_id, runtime.clone());
                    (runtime, true)
                }
            }
        };

        if !fresh {
            runtime.wait_ready().await?;
            return Ok(runtime);
        }

        match runtime.hydrate().await {
            Ok(()) => Ok(runtime),
            Err(e) => {
                log::error!("Hydration of document {doc_id} failed: {e}");
                self.evict(doc_id, &runtime);
                runtime.shutdown(DocumentStatus::Closed).await;
                Err(e)
            }
        }
    }

    pub fn get(&self, doc_id: Uuid) -> Option<Arc<DocumentRuntime>> {
        self.documents.lock().get(&doc_id).cloned()
    }

    pub fn document_ids(&self) -> Vec<Uuid> {
        self.documents.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }

    fn evict(&self, doc_id: Uuid, runtime: &Arc<DocumentRuntime>) -> bool {
        let mut documents = self.documents.lock();
        match documents.get(&doc_id) {
            Some(current) if Arc::ptr_eq(current, runtime) => {
                documents.remove(&doc_id);
                true
            }
            _ => false,
        }
    }

    /// Release a document from memory. Its log and durable row are kept.
    pub async fn close(&self, doc_id: Uuid) -> bool {
        let Some(runtime) = self.documents.lock().remove(&doc_id) else {
            return false;
        };
        runtime.shutdown(DocumentStatus::Closed).await;
        self.restore_subscription(doc_id).await;
        log::info!("Closed document {doc_id} at clock {}", runtime.clock());
        true
    }

    /// Erase a document: runtime, log, offset and durable row.
    /// Works whether or not the document is loaded here.
    pub async fn remove(&self, doc_id: Uuid) -> SyncResult<()> {
        let runtime = self.documents.lock().remove(&doc_id);
        if let Some(runtime) = &runtime {
            runtime.shutdown(DocumentStatus::Removed).await;
        }
        ReplicationLog::new(doc_id, self.coordination.clone())
            .remove()
            .await?;
        self.snapshots.delete(doc_id).await?;
        log::info!("Removed document {doc_id}");
        Ok(())
    }

    /// A runtime for the same document may have subscribed while the old one
    /// was unsubscribing.
    async fn restore_subscription(&self, doc_id: Uuid) {
        if self.get(doc_id).is_some() {
            if let Err(e) = self.coordination.subscribe(doc_id).await {
                log::warn!("Failed to restore subscription for {doc_id}: {e}");
            }
        }
    }

    /// Close documents with no connections that have been idle for `timeout`.
    pub async fn close_idle(&self, timeout: Duration) -> Vec<Uuid> {
        let idle: Vec<Uuid> = self
            .documents
            .lock()
            .values()
            .filter(|rt| {
                rt.is_ready() && rt.broadcast().peer_count() == 0 && rt.idle_for() >= timeout
            })
            .map(|rt| rt.doc_id())
            .collect();

        let mut closed = Vec::with_capacity(idle.len());
        for doc_id in idle {
            if self.close(doc_id).await {
                closed.push(doc_id);
            }
        }
        closed
    }

    /// Compact a document's log, loaded here or not.
    pub async fn compact(&self, doc_id: Uuid) -> SyncResult<Option<u64>> {
        if let Some(runtime) = self.get(doc_id) {
            return runtime.compact().await;
        }
        let log = ReplicationLog::new(doc_id, self.coordination.clone());
        Ok(compact_document(&log, self.snapshots.as_ref())
            .await?
            .map(|outcome| outcome.offset))
    }

    /// Force every loaded document to re-pull.
    pub fn resync_all(&self) {
        let runtimes: Vec<_> = self.documents.lock().values().cloned().collect();
        log::info!("Resyncing {} documents", runtimes.len());
        for runtime in runtimes {
            if runtime.is_ready() {
                runtime.resync();
            }
        }
    }
}

/// Route coordination notifications to loaded runtimes.
async fn dispatch(registry: Weak<DocumentRegistry>, mut notifications: broadcast::Receiver<Notification>) {
    loop {
        let notification = notifications.recv().await;
        let Some(registry) = registry.upgrade() else {
            return;
        };
        match notification {
            Ok(Notification::Clock { doc_id, clock }) => {
                if let Some(runtime) = registry.get(doc_id) {
                    runtime.notify(clock);
                }
            }
            Ok(Notification::Resync) => registry.resync_all(),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Notification dispatcher lagged by {skipped}, resyncing");
                registry.resync_all();
            }
            Err(broadcast::error::RecvError::Closed) => {
                log::debug!("Notification stream closed");
                return;
            }
        }
    }
}
