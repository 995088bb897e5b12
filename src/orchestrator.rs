//! The orchestrator context
//!
//! [`Orchestrator`] is built once at process start and shared by `Arc`. It
//! owns every component and exposes the operations the REST layer calls:
//! create, delete, restart, get, list and the recording flag.
//!
//! # Device exclusivity
//!
//! Device-bound creations for one device are serialized while they check
//! the lease and the store and insert their row. Deletions never wait on
//! that: they take the device lease, and every write other than the
//! deletion's own leaves a `Deleting` row alone.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::apply::ApplyEngine;
use crate::cluster::ClusterClient;
use crate::config::OrchestratorConfig;
use crate::deletion::DeletionSequencer;
use crate::device_lock::DeviceLockTracker;
use crate::model::{
    DeviceKey, Workload, WorkloadConfig, WorkloadKind, WorkloadPatch, WorkloadStatus,
};
use crate::spec::naming::RESTARTED_AT_ANNOTATION;
use crate::spec::placement::TolerationResolver;
use crate::spec::SpecGenerator;
use crate::status::StatusReconciler;
use crate::store::WorkloadStore;
use crate::sweeper::{OrphanSweeper, SweepReport};
use crate::workload::GeneratedWorkload;
use crate::Error;

/// Source recorded on rows whose apply failed
const APPLY_SOURCE: &str = "apply";

/// A request to create one workload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    /// Display name
    pub name: String,
    /// Workload kind
    pub kind: WorkloadKind,
    /// Protocol and runtime configuration
    #[serde(flatten)]
    pub config: WorkloadConfig,
}

/// Shared orchestrator state
pub struct Orchestrator {
    generator: SpecGenerator,
    engine: ApplyEngine,
    store: Arc<dyn WorkloadStore>,
    locks: DeviceLockTracker,
    status: StatusReconciler,
    deletion: DeletionSequencer,
    sweeper: OrphanSweeper,
}

impl Orchestrator {
    /// Build with tolerations taken from configured node taints
    pub fn from_config(
        config: &OrchestratorConfig,
        cluster: Arc<dyn ClusterClient>,
        store: Arc<dyn WorkloadStore>,
    ) -> Self {
        Self::with_generator(config, SpecGenerator::from_config(config), cluster, store)
    }

    /// Build with an explicit placement policy
    pub fn new(
        config: &OrchestratorConfig,
        tolerations: Arc<dyn TolerationResolver>,
        cluster: Arc<dyn ClusterClient>,
        store: Arc<dyn WorkloadStore>,
    ) -> Self {
        Self::with_generator(
            config,
            SpecGenerator::new(config, tolerations),
            cluster,
            store,
        )
    }

    fn with_generator(
        config: &OrchestratorConfig,
        generator: SpecGenerator,
        cluster: Arc<dyn ClusterClient>,
        store: Arc<dyn WorkloadStore>,
    ) -> Self {
        let engine = ApplyEngine::new(cluster, &config.product, config.timings.call_timeout);
        let locks = DeviceLockTracker::new();
        Self {
            status: StatusReconciler::new(engine.clone(), store.clone(), &config.product),
            deletion: DeletionSequencer::new(
                engine.clone(),
                store.clone(),
                locks.clone(),
                &config.timings,
            ),
            sweeper: OrphanSweeper::new(engine.clone(), store.clone()),
            generator,
            engine,
            store,
            locks,
        }
    }

    /// Spec generator
    pub fn generator(&self) -> &SpecGenerator {
        &self.generator
    }

    /// Device lease tracker
    pub fn locks(&self) -> &DeviceLockTracker {
        &self.locks
    }

    /// Deletion sequencer
    pub fn deletions(&self) -> &DeletionSequencer {
        &self.deletion
    }

    /// Orphan sweeper
    pub fn sweeper(&self) -> &OrphanSweeper {
        &self.sweeper
    }

    /// Create a workload and apply its objects
    ///
    /// Protocol and descriptor errors are raised before any row exists. An
    /// apply failure leaves the row in `Error` with the message recorded and
    /// is returned to the caller.
    pub async fn create(&self, request: CreateRequest) -> Result<Workload, Error> {
        self.create_with_id(Uuid::new_v4(), request).await
    }

    /// [`create`](Self::create) with a caller-chosen id
    ///
    /// Names derive from the id, so recreating a workload under the same id
    /// adopts the objects it left on the cluster instead of duplicating them.
    #[instrument(skip(self, request), fields(name = %request.name, kind = %request.kind))]
    pub async fn create_with_id(&self, id: Uuid, request: CreateRequest) -> Result<Workload, Error> {
        let mut workload = Workload::new(request.name, request.kind, request.config);
        workload.id = id;
        let generated = self.generator.generate(&workload)?;

        match workload.device_key() {
            Some(key) => {
                let _serial = self.locks.creation_lock(&key).await;
                self.locks.ensure_free(&key)?;
                self.ensure_device_unclaimed(&key, workload.id).await?;
                self.store.insert(workload.clone()).await?;
            }
            None => self.store.insert(workload.clone()).await?,
        }
        info!(workload = %workload.id, "workload registered");

        self.patch_live(workload.id, WorkloadPatch::status(WorkloadStatus::Creating))
            .await?;
        self.apply(workload.id, &generated).await
    }

    async fn ensure_device_unclaimed(&self, key: &DeviceKey, id: Uuid) -> Result<(), Error> {
        let claimants = self.store.find_by_device(key).await?;
        match claimants.iter().find(|w| w.id != id) {
            Some(other) => {
                warn!(
                    device = %key,
                    holder = %other.id,
                    status = %other.status,
                    "device already claimed"
                );
                Err(Error::DeviceBusy {
                    node: key.node.clone(),
                    device_path: key.device_path.clone(),
                    holder: other.id,
                })
            }
            None => Ok(()),
        }
    }

    async fn apply(&self, id: Uuid, generated: &GeneratedWorkload) -> Result<Workload, Error> {
        match self.engine.apply(generated).await {
            Ok(names) => {
                let patch = WorkloadPatch {
                    object_names: Some(names),
                    error: Some(None),
                    ..Default::default()
                };
                self.patch_live(id, patch).await
            }
            Err(e) => {
                warn!(workload = %id, error = %e, "apply failed");
                self.store
                    .update_unless_deleting(id, WorkloadPatch::failed(APPLY_SOURCE, e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Patch a row unless its deletion has started
    async fn patch_live(&self, id: Uuid, patch: WorkloadPatch) -> Result<Workload, Error> {
        let row = self
            .store
            .update_unless_deleting(id, patch)
            .await?
            .ok_or(Error::NotFound(id))?;
        if row.status == WorkloadStatus::Deleting {
            return Err(being_deleted(id));
        }
        Ok(row)
    }

    /// Start deleting a workload
    ///
    /// Returns once the row is `Deleting`; the rest happens in the
    /// background. Deleting a row that is already `Deleting` is a no-op.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), Error> {
        let workload = self.row(id).await?;
        if workload.status == WorkloadStatus::Deleting {
            return Ok(());
        }
        self.deletion.begin(workload).await
    }

    /// Roll the workload's pods by re-applying with a fresh restart stamp
    #[instrument(skip(self))]
    pub async fn restart(&self, id: Uuid) -> Result<Workload, Error> {
        let workload = self.row(id).await?;
        if workload.status == WorkloadStatus::Deleting {
            return Err(being_deleted(id));
        }

        let mut generated = self.generator.generate(&workload)?;
        let stamp = Utc::now().to_rfc3339();
        for set in generated.sets_mut() {
            set.controller
                .pod_template_mut()
                .metadata
                .annotations
                .insert(RESTARTED_AT_ANNOTATION.to_string(), stamp.clone());
        }

        self.patch_live(id, WorkloadPatch::status(WorkloadStatus::Creating))
            .await?;
        self.apply(id, &generated).await
    }

    /// One workload, with status refreshed from the cluster
    pub async fn get(&self, id: Uuid) -> Result<Workload, Error> {
        let workload = self.row(id).await?;
        Ok(self.status.sync(workload).await)
    }

    /// Every workload, with status refreshed from the cluster
    pub async fn list(&self) -> Result<Vec<Workload>, Error> {
        let rows = self.store.list().await?;
        Ok(self.status.sync_all(rows).await)
    }

    /// Record that the paired recorder started or stopped recording
    pub async fn set_recording(&self, id: Uuid, recording: bool) -> Result<Workload, Error> {
        let workload = self.row(id).await?;
        if workload.kind != WorkloadKind::Camera {
            return Err(Error::validation(format!(
                "{} workloads do not record",
                workload.kind
            )));
        }
        let patch = WorkloadPatch {
            recording: Some(recording),
            ..Default::default()
        };
        if recording {
            return self.patch_live(id, patch).await;
        }
        self.store
            .update(id, patch)
            .await?
            .ok_or(Error::NotFound(id))
    }

    /// Run one orphan sweep
    pub async fn sweep(&self) -> Result<SweepReport, Error> {
        self.sweeper.sweep().await
    }

    /// Wait for in-flight deletions to finish
    pub async fn shutdown(&self) {
        self.deletion.shutdown().await;
    }

    async fn row(&self, id: Uuid) -> Result<Workload, Error> {
        self.store.get(id).await?.ok_or(Error::NotFound(id))
    }
}

fn being_deleted(id: Uuid) -> Error {
    Error::validation(format!("workload {id} is being deleted"))
}
