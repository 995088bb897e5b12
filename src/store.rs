//! Persistence seam for workload rows
//!
//! The orchestrator treats the database as authoritative for desired
//! identity and for deletion-in-progress. Anything that can insert, read,
//! patch and remove rows can back it; [`MemoryStore`] is the in-process
//! implementation used by the binary and by tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{DeviceKey, Workload, WorkloadPatch, WorkloadStatus};

/// Failure reported by a workload store
#[derive(Debug, Error)]
pub enum StoreError {
    /// A row with this id already exists
    #[error("workload {0} already exists")]
    Duplicate(Uuid),

    /// Backend could not be reached or rejected the query
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Workload row persistence
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// Insert a new row
    async fn insert(&self, workload: Workload) -> Result<(), StoreError>;

    /// Fetch one row
    async fn get(&self, id: Uuid) -> Result<Option<Workload>, StoreError>;

    /// All rows, oldest first
    async fn list(&self) -> Result<Vec<Workload>, StoreError>;

    /// Ids of every row, including rows being deleted
    async fn ids(&self) -> Result<HashSet<Uuid>, StoreError>;

    /// Patch one row, returning it after the update (None if missing)
    async fn update(&self, id: Uuid, patch: WorkloadPatch) -> Result<Option<Workload>, StoreError>;

    /// Patch one row unless it is already `Deleting`
    ///
    /// The status check and the write happen atomically. Returns the row as
    /// it stands afterwards, patched or not (None if missing).
    async fn update_unless_deleting(
        &self,
        id: Uuid,
        patch: WorkloadPatch,
    ) -> Result<Option<Workload>, StoreError>;

    /// Remove one row, returning whether it existed
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Rows that claim the given device
    async fn find_by_device(&self, key: &DeviceKey) -> Result<Vec<Workload>, StoreError>;
}

/// In-memory [`WorkloadStore`]
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<Uuid, Workload>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// True when there are no rows
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl WorkloadStore for MemoryStore {
    async fn insert(&self, workload: Workload) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        if rows.contains_key(&workload.id) {
            return Err(StoreError::Duplicate(workload.id));
        }
        rows.insert(workload.id, workload);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Workload>, StoreError> {
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Workload>, StoreError> {
        let mut rows: Vec<_> = self.rows.read().values().cloned().collect();
        rows.sort_by_key(|w| (w.created_at, w.id));
        Ok(rows)
    }

    async fn ids(&self) -> Result<HashSet<Uuid>, StoreError> {
        Ok(self.rows.read().keys().copied().collect())
    }

    async fn update(&self, id: Uuid, patch: WorkloadPatch) -> Result<Option<Workload>, StoreError> {
        let mut rows = self.rows.write();
        Ok(rows.get_mut(&id).map(|row| {
            patch.apply_to(row);
            row.clone()
        }))
    }

    async fn update_unless_deleting(
        &self,
        id: Uuid,
        patch: WorkloadPatch,
    ) -> Result<Option<Workload>, StoreError> {
        let mut rows = self.rows.write();
        Ok(rows.get_mut(&id).map(|row| {
            if row.status != WorkloadStatus::Deleting {
                patch.apply_to(row);
            }
            row.clone()
        }))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.rows.write().remove(&id).is_some())
    }

    async fn find_by_device(&self, key: &DeviceKey) -> Result<Vec<Workload>, StoreError> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|w| w.device_key().as_ref() == Some(key))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{WorkloadConfig, WorkloadKind};

    fn camera(node: &str, path: &str) -> Workload {
        Workload::new(
            "cam",
            WorkloadKind::Camera,
            WorkloadConfig {
                protocol: "usb".to_string(),
                node: Some(node.to_string()),
                device_path: Some(path.to_string()),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = MemoryStore::new();
        let w = camera("edge1", "/dev/video0");
        store.insert(w.clone()).await.unwrap();
        assert!(matches!(
            store.insert(w.clone()).await,
            Err(StoreError::Duplicate(id)) if id == w.id
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_patches_in_place() {
        let store = MemoryStore::new();
        let w = camera("edge1", "/dev/video0");
        store.insert(w.clone()).await.unwrap();

        let updated = store
            .update(w.id, WorkloadPatch::status(WorkloadStatus::Running))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, WorkloadStatus::Running);
        assert_eq!(
            store.get(w.id).await.unwrap().unwrap().status,
            WorkloadStatus::Running
        );
        assert!(store
            .update(Uuid::new_v4(), WorkloadPatch::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn guarded_update_leaves_deleting_rows_alone() {
        let store = MemoryStore::new();
        let w = camera("edge1", "/dev/video0");
        store.insert(w.clone()).await.unwrap();

        let row = store
            .update_unless_deleting(w.id, WorkloadPatch::status(WorkloadStatus::Running))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, WorkloadStatus::Running);

        store
            .update(w.id, WorkloadPatch::status(WorkloadStatus::Deleting))
            .await
            .unwrap();
        let row = store
            .update_unless_deleting(w.id, WorkloadPatch::failed("sweeper", "gone"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, WorkloadStatus::Deleting);
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn find_by_device_matches_node_and_path() {
        let store = MemoryStore::new();
        let a = camera("edge1", "/dev/video0");
        let b = camera("edge2", "/dev/video0");
        store.insert(a.clone()).await.unwrap();
        store.insert(b).await.unwrap();

        let found = store
            .find_by_device(&DeviceKey::new("edge1", "/dev/video0"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = MemoryStore::new();
        let w = camera("edge1", "/dev/video0");
        store.insert(w.clone()).await.unwrap();
        assert!(store.delete(w.id).await.unwrap());
        assert!(!store.delete(w.id).await.unwrap());
        assert!(store.ids().await.unwrap().is_empty());
    }
}
