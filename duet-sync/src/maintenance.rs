//! Scheduled cleanup pass.
//!
//! Each pass, in order:
//! 1. erase documents of expired rooms (log, offset, durable row, room)
//! 2. forget awareness entries removed longer ago than the grace period
//! 3. compact loaded documents whose log passed the byte threshold
//! 4. close documents with no connections that have been idle too long

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::MaintenanceConfig;
use crate::error::SyncResult;
use crate::rooms::RoomService;
use crate::runtime::DocumentRegistry;
use crate::storage::unix_now;

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub removed: usize,
    pub pruned: usize,
    pub compacted: usize,
    pub closed: usize,
}

pub struct Maintenance {
    registry: Arc<DocumentRegistry>,
    rooms: Arc<dyn RoomService>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(
        registry: Arc<DocumentRegistry>,
        rooms: Arc<dyn RoomService>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            registry,
            rooms,
            config,
        }
    }

    /// Run one pass. Per-document failures are logged and skipped.
    pub async fn run_once(&self) -> SyncResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        for room in self.rooms.expired_rooms(unix_now()).await? {
            match self.registry.remove(room.doc_id).await {
                Ok(()) => {
                    self.rooms.delete_room(room.room_id).await?;
                    report.removed += 1;
                }
                Err(e) => log::error!("Failed to remove expired room {}: {e}", room.code),
            }
        }

        for doc_id in self.registry.document_ids() {
            let Some(runtime) = self.registry.get(doc_id) else {
                continue;
            };
            report.pruned += runtime
                .awareness()
                .prune_removed(self.config.awareness_grace());

            let log_bytes = match runtime.log().byte_len().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Failed to size log of {doc_id}: {e}");
                    continue;
                }
            };
            if log_bytes < self.config.compaction_threshold_bytes {
                continue;
            }
            match runtime.compact().await {
                Ok(Some(_)) => report.compacted += 1,
                Ok(None) => {}
                Err(e) => log::error!("Compaction of {doc_id} failed: {e}"),
            }
        }

        report.closed = self
            .registry
            .close_idle(self.config.idle_timeout())
            .await
            .len();

        if report != MaintenanceReport::default() {
            log::info!(
                "Maintenance: {} removed, {} pruned, {} compacted, {} closed",
                report.removed,
                report.pruned,
                report.compacted,
                report.closed
            );
        }
        Ok(report)
    }

    /// Run passes every `interval_secs` until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    log::error!("Maintenance pass failed: {e}");
                }
            }
        })
    }
}
