//! Orphan sweeps against the in-memory cluster
//!
//! Rows are removed from the store behind the orchestrator's back to stand
//! in for a crashed deletion or a manual DB edit.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camfleet::cluster::{InMemoryCluster, ObjectKind};
use camfleet::config::OrchestratorConfig;
use camfleet::model::{
    DeviceKey, Workload, WorkloadConfig, WorkloadKind, WorkloadPatch, WorkloadStatus,
};
use camfleet::spec::naming;
use camfleet::store::{MemoryStore, StoreError, WorkloadStore};
use camfleet::sweeper::SWEEPER_SOURCE;
use camfleet::{CreateRequest, Orchestrator};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Harness {
    cluster: Arc<InMemoryCluster>,
    store: Arc<MemoryStore>,
    orchestrator: Orchestrator,
}

fn harness() -> Harness {
    let cluster = Arc::new(InMemoryCluster::new());
    let store = Arc::new(MemoryStore::new());
    let orchestrator =
        Orchestrator::from_config(&OrchestratorConfig::default(), cluster.clone(), store.clone());
    Harness {
        cluster,
        store,
        orchestrator,
    }
}

fn rtsp_camera(name: &str) -> CreateRequest {
    CreateRequest {
        name: name.to_string(),
        kind: WorkloadKind::Camera,
        config: WorkloadConfig {
            protocol: "rtsp".to_string(),
            source: Some(format!("rtsp://10.0.0.5/{name}")),
            ..Default::default()
        },
    }
}

fn usb_camera(name: &str, device: &str) -> CreateRequest {
    CreateRequest {
        name: name.to_string(),
        kind: WorkloadKind::Camera,
        config: WorkloadConfig {
            protocol: "usb".to_string(),
            node: Some("edge1".to_string()),
            device_path: Some(device.to_string()),
            ..Default::default()
        },
    }
}

async fn create_all(h: &Harness, requests: Vec<CreateRequest>) -> Vec<Workload> {
    let mut out = Vec::new();
    for request in requests {
        out.push(h.orchestrator.create(request).await.unwrap());
    }
    out
}

// =========================================================================
// Orphans
// =========================================================================

#[tokio::test]
async fn story_only_objects_without_a_row_are_deleted() {
    let h = harness();
    let cams = create_all(
        &h,
        vec![rtsp_camera("a"), rtsp_camera("b"), rtsp_camera("c")],
    )
    .await;
    let c = &cams[2];
    assert!(h.store.delete(c.id).await.unwrap());

    let report = h.orchestrator.sweep().await.unwrap();

    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.deleted.len(), 2);
    assert!(!h.cluster.contains(ObjectKind::Deployment, &naming::primary_name(c)));
    assert!(!h.cluster.contains(ObjectKind::Service, &naming::primary_name(c)));
    for live in &cams[..2] {
        assert!(h.cluster.contains(ObjectKind::Deployment, &naming::primary_name(live)));
        assert!(h.cluster.contains(ObjectKind::Service, &naming::primary_name(live)));
    }
}

#[tokio::test]
async fn story_paired_recorder_of_a_vanished_camera_is_collected() {
    let h = harness();
    let cams = create_all(
        &h,
        vec![
            usb_camera("front", "/dev/video0"),
            usb_camera("back", "/dev/video1"),
        ],
    )
    .await;
    assert!(h.store.delete(cams[0].id).await.unwrap());

    let report = h.orchestrator.sweep().await.unwrap();

    assert_eq!(report.deleted.len(), 4);
    assert!(!h.cluster.contains(ObjectKind::Deployment, &naming::paired_name(&cams[0])));
    assert!(h.cluster.contains(ObjectKind::Deployment, &naming::paired_name(&cams[1])));
    assert_eq!(h.cluster.objects().len(), 4);
}

#[tokio::test]
async fn story_empty_store_clears_every_family() {
    let h = harness();
    let mut requests = vec![rtsp_camera("a"), usb_camera("b", "/dev/video0")];
    requests.push(CreateRequest {
        name: "nightly".to_string(),
        kind: WorkloadKind::Cron,
        config: WorkloadConfig {
            protocol: "agent".to_string(),
            schedule: Some("0 3 * * *".to_string()),
            ..Default::default()
        },
    });
    let rows = create_all(&h, requests).await;
    assert!(!h.cluster.objects().is_empty());

    for row in &rows {
        h.store.delete(row.id).await.unwrap();
    }
    let report = h.orchestrator.sweep().await.unwrap();

    assert!(report.is_clean());
    assert!(h.cluster.objects().is_empty());

    // Nothing left, so a second pass is a no-op
    let again = h.orchestrator.sweep().await.unwrap();
    assert!(again.deleted.is_empty());
}

/// Store whose `ids()` takes its snapshot, then waits to be let go
#[derive(Default)]
struct PausingIds {
    inner: MemoryStore,
    snapshot_taken: Notify,
    resume: Notify,
}

#[async_trait]
impl WorkloadStore for PausingIds {
    async fn insert(&self, workload: Workload) -> Result<(), StoreError> {
        self.inner.insert(workload).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Workload>, StoreError> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<Workload>, StoreError> {
        self.inner.list().await
    }

    async fn ids(&self) -> Result<HashSet<Uuid>, StoreError> {
        let ids = self.inner.ids().await?;
        self.snapshot_taken.notify_one();
        self.resume.notified().await;
        Ok(ids)
    }

    async fn update(&self, id: Uuid, patch: WorkloadPatch) -> Result<Option<Workload>, StoreError> {
        self.inner.update(id, patch).await
    }

    async fn update_unless_deleting(
        &self,
        id: Uuid,
        patch: WorkloadPatch,
    ) -> Result<Option<Workload>, StoreError> {
        self.inner.update_unless_deleting(id, patch).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn find_by_device(&self, key: &DeviceKey) -> Result<Vec<Workload>, StoreError> {
        self.inner.find_by_device(key).await
    }
}

#[tokio::test]
async fn story_creation_during_sweep_keeps_its_objects() {
    let cluster = Arc::new(InMemoryCluster::new());
    let store = Arc::new(PausingIds::default());
    let orchestrator = Arc::new(Orchestrator::from_config(
        &OrchestratorConfig::default(),
        cluster.clone(),
        store.clone(),
    ));

    let sweep = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.sweep().await })
    };
    store.snapshot_taken.notified().await;

    let gate = orchestrator.create(rtsp_camera("Gate")).await.unwrap();
    store.resume.notify_one();
    let report = sweep.await.unwrap().unwrap();

    assert!(report.deleted.is_empty());
    assert!(store.inner.get(gate.id).await.unwrap().is_some());
    assert!(cluster.contains(ObjectKind::Deployment, &naming::primary_name(&gate)));
    assert!(cluster.contains(ObjectKind::Service, &naming::primary_name(&gate)));
}

// =========================================================================
// Drift repair
// =========================================================================

#[tokio::test]
async fn story_recording_camera_without_recorder_pod_is_marked_failed() {
    let h = harness();
    let cam = h
        .orchestrator
        .create(usb_camera("front", "/dev/video0"))
        .await
        .unwrap();
    h.orchestrator.set_recording(cam.id, true).await.unwrap();

    let report = h.orchestrator.sweep().await.unwrap();
    assert_eq!(report.repaired, vec![cam.id]);

    let row = h.store.get(cam.id).await.unwrap().unwrap();
    assert!(!row.recording);
    assert_eq!(row.status, WorkloadStatus::Error);
    assert_eq!(row.error.unwrap().source, SWEEPER_SOURCE);
}

#[tokio::test(start_paused = true)]
async fn story_periodic_sweeper_stops_on_cancel() {
    let h = harness();
    let cam = h.orchestrator.create(rtsp_camera("a")).await.unwrap();
    h.store.delete(cam.id).await.unwrap();

    let token = CancellationToken::new();
    let sweeper = h.orchestrator.sweeper().clone();
    let task = {
        let token = token.clone();
        tokio::spawn(async move { sweeper.run_periodic(Duration::from_secs(60), token).await })
    };

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(h.cluster.objects().is_empty());

    token.cancel();
    task.await.unwrap();
}
