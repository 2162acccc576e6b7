//! In-memory snapshot store shared by every runtime holding the same `Arc`.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{unix_now, DurableSnapshot, SnapshotStore, StoreError, StoreResult};

#[derive(Default)]
pub struct MemorySnapshotStore {
    rows: Mutex<HashMap<Uuid, DurableSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn create(&self, doc_id: Uuid, room_id: Uuid) -> StoreResult<DurableSnapshot> {
        let mut rows = self.rows.lock();
        let row = rows
            .entry(doc_id)
            .or_insert_with(|| DurableSnapshot::new(doc_id, room_id));
        Ok(row.clone())
    }

    async fn load(&self, doc_id: Uuid) -> StoreResult<DurableSnapshot> {
        self.rows
            .lock()
            .get(&doc_id)
            .cloned()
            .ok_or(StoreError::NotFound(doc_id))
    }

    async fn save(&self, doc_id: Uuid, content: &[u8], clock: u64) -> StoreResult<bool> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&doc_id).ok_or(StoreError::NotFound(doc_id))?;
        if clock < row.clock {
            return Ok(false);
        }
        row.content = Some(content.to_vec());
        row.clock = clock;
        row.updated_at = unix_now();
        Ok(true)
    }

    async fn delete(&self, doc_id: Uuid) -> StoreResult<bool> {
        Ok(self.rows.lock().remove(&doc_id).is_some())
    }

    async fn list(&self) -> StoreResult<Vec<Uuid>> {
        Ok(self.rows.lock().keys().copied().collect())
    }
}
