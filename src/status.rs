//! Runtime status reconciliation
//!
//! The cluster is authoritative for what is actually running. On every read
//! the orchestrator derives a status from the workload's pods and, when it
//! disagrees with the stored row, writes it back. Rows marked `Deleting`
//! are never overwritten and probe failures leave the row untouched.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::apply::ApplyEngine;
use crate::cluster::{ClusterError, ContainerState, PodObservation};
use crate::model::{Workload, WorkloadPatch, WorkloadStatus};
use crate::spec::naming::Family;
use crate::store::WorkloadStore;

/// Waiting reasons that mean the container will not start without intervention
const FAILING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "ErrImageNeverPull",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
];

fn is_failing_reason(reason: &str) -> bool {
    FAILING_REASONS.contains(&reason) || reason.contains("BackOff")
}

/// Derive a status from observed pods
///
/// Container state wins over pod phase. In order: any running container,
/// any container stuck on a failing reason, any other waiting container,
/// any nonzero exit, any clean exit. Pods with no container state fall back
/// to their phase.
pub fn derive_status(pods: &[PodObservation]) -> WorkloadStatus {
    if pods.is_empty() {
        return WorkloadStatus::Stopped;
    }

    let containers: Vec<&ContainerState> = pods.iter().flat_map(|p| &p.containers).collect();
    if containers.is_empty() {
        return phase_status(pods);
    }

    let any = |pred: fn(&ContainerState) -> bool| containers.iter().copied().any(pred);

    if any(|c| matches!(c, ContainerState::Running)) {
        WorkloadStatus::Running
    } else if any(|c| {
        matches!(c, ContainerState::Waiting { reason: Some(r) } if is_failing_reason(r))
    }) {
        WorkloadStatus::Error
    } else if any(|c| matches!(c, ContainerState::Waiting { .. })) {
        WorkloadStatus::Creating
    } else if any(|c| matches!(c, ContainerState::Terminated { exit_code } if *exit_code != 0)) {
        WorkloadStatus::Error
    } else {
        WorkloadStatus::Stopped
    }
}

fn phase_status(pods: &[PodObservation]) -> WorkloadStatus {
    let has = |phase: &str| pods.iter().any(|p| p.phase.as_deref() == Some(phase));
    if has("Running") {
        WorkloadStatus::Running
    } else if has("Pending") {
        WorkloadStatus::Creating
    } else if has("Failed") || has("Unknown") {
        WorkloadStatus::Error
    } else {
        WorkloadStatus::Stopped
    }
}

/// Syncs stored status with what the cluster reports
#[derive(Clone)]
pub struct StatusReconciler {
    engine: ApplyEngine,
    store: Arc<dyn WorkloadStore>,
    product: String,
}

impl StatusReconciler {
    /// Create a reconciler
    pub fn new(engine: ApplyEngine, store: Arc<dyn WorkloadStore>, product: impl Into<String>) -> Self {
        Self {
            engine,
            store,
            product: product.into(),
        }
    }

    /// Live status of a workload's own pods
    pub async fn runtime_status(&self, workload: &Workload) -> Result<WorkloadStatus, ClusterError> {
        let query = Family::Primary(workload.kind).query(&self.product, Some(workload.id));
        let pods = self
            .engine
            .bounded(self.engine.cluster().list_pods(&query))
            .await?;
        Ok(derive_status(&pods))
    }

    /// Refresh one row from the cluster, returning the row as it now stands
    ///
    /// Never fails: probe and store errors are logged and the input row is
    /// returned unchanged.
    pub async fn sync(&self, workload: Workload) -> Workload {
        if workload.status == WorkloadStatus::Deleting {
            return workload;
        }

        let observed = match self.runtime_status(&workload).await {
            Ok(status) => status,
            Err(e) => {
                warn!(workload = %workload.id, error = %e, "status probe failed");
                return workload;
            }
        };
        if observed == workload.status {
            return workload;
        }

        debug!(
            workload = %workload.id,
            stored = %workload.status,
            observed = %observed,
            "status drifted"
        );
        // A deletion may have started while pods were being observed
        match self
            .store
            .update_unless_deleting(workload.id, WorkloadPatch::status(observed))
            .await
        {
            Ok(Some(updated)) => updated,
            Ok(None) => workload,
            Err(e) => {
                warn!(workload = %workload.id, error = %e, "status write failed");
                workload
            }
        }
    }

    /// Refresh many rows
    pub async fn sync_all(&self, workloads: Vec<Workload>) -> Vec<Workload> {
        futures::future::join_all(workloads.into_iter().map(|w| self.sync(w))).await
    }
}
