//! Graceful multi-stage workload deletion
//!
//! Deleting a workload is accepted synchronously and finished in the
//! background:
//!
//! ```text
//! Requested -> ClusterObjectsRemoved -> PodDrainWait
//!           -> HardwareReleaseGrace (device-bound only)
//!           -> DbRowRemoved -> LeaseReleased
//! ```
//!
//! The cluster stages run in their own task. Whatever happens there, errors
//! or a panic, the row is removed and the device lease released afterwards.
//! Sequences are tracked in a [`TaskTracker`] so shutdown can wait for them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::apply::ApplyEngine;
use crate::config::Timings;
use crate::device_lock::{DeviceLockTracker, LeaseGuard};
use crate::model::{ObjectName, Workload, WorkloadPatch, WorkloadStatus};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::spec::naming::Family;
use crate::store::WorkloadStore;
use crate::Error;

/// Where a deletion sequence is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionStage {
    /// Row marked `Deleting`, lease taken
    Requested,
    /// Delete issued for every known object
    ClusterObjectsRemoved,
    /// Waiting for pods to terminate
    PodDrainWait,
    /// Letting the node release the device
    HardwareReleaseGrace,
    /// Workload row removed
    DbRowRemoved,
    /// Lease released, sequence finished
    LeaseReleased,
}

/// Runs deletion sequences in the background
#[derive(Clone)]
pub struct DeletionSequencer {
    engine: ApplyEngine,
    store: Arc<dyn WorkloadStore>,
    locks: DeviceLockTracker,
    drain_wait: Duration,
    drain_poll: Duration,
    hardware_grace: Duration,
    row_retry: RetryPolicy,
    tasks: TaskTracker,
    stages: Arc<DashMap<Uuid, DeletionStage>>,
}

impl DeletionSequencer {
    /// Create a sequencer
    pub fn new(
        engine: ApplyEngine,
        store: Arc<dyn WorkloadStore>,
        locks: DeviceLockTracker,
        timings: &Timings,
    ) -> Self {
        Self {
            engine,
            store,
            locks,
            drain_wait: timings.drain_wait,
            drain_poll: timings.drain_poll,
            hardware_grace: timings.hardware_grace,
            row_retry: RetryPolicy::default(),
            tasks: TaskTracker::new(),
            stages: Arc::new(DashMap::new()),
        }
    }

    /// Override the retry policy for the row removal
    pub fn with_row_retry(mut self, policy: RetryPolicy) -> Self {
        self.row_retry = policy;
        self
    }

    /// Accept a deletion and start it in the background
    ///
    /// Marks the row `Deleting` and, for device-bound workloads, takes the
    /// device lease before returning. A second call for a workload whose
    /// deletion is already running is a no-op. Fails only if the row is gone
    /// or the store cannot be written.
    pub async fn begin(&self, workload: Workload) -> Result<(), Error> {
        match self.stages.entry(workload.id) {
            Entry::Occupied(_) => {
                debug!(workload = %workload.id, "deletion already running");
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(DeletionStage::Requested);
            }
        }

        match self.accept(&workload).await {
            Ok(guard) => {
                info!(workload = %workload.id, name = %workload.name, "deletion accepted");
                let this = self.clone();
                self.tasks.spawn(async move { this.run(workload, guard).await });
                Ok(())
            }
            Err(e) => {
                self.stages.remove(&workload.id);
                Err(e)
            }
        }
    }

    async fn accept(&self, workload: &Workload) -> Result<Option<LeaseGuard>, Error> {
        let guard = match workload.device_key() {
            Some(key) => match self.locks.acquire(key.clone(), workload.id) {
                Ok(guard) => Some(guard),
                Err(_) => {
                    // The Deleting row below keeps creations off the device
                    // until this sequence removes it
                    warn!(
                        workload = %workload.id,
                        device = %key,
                        holder = ?self.locks.holder(&key),
                        "device already leased, deleting without a lease"
                    );
                    None
                }
            },
            None => None,
        };

        let patch = WorkloadPatch {
            status: Some(WorkloadStatus::Deleting),
            recording: Some(false),
            ..Default::default()
        };
        match self.store.update(workload.id, patch).await? {
            Some(_) => Ok(guard),
            None => Err(Error::NotFound(workload.id)),
        }
    }

    /// Current stage of an in-flight deletion
    pub fn stage(&self, id: Uuid) -> Option<DeletionStage> {
        self.stages.get(&id).map(|s| *s)
    }

    /// Number of deletions still running
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting new sequences and wait for running ones
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn run(self, workload: Workload, guard: Option<LeaseGuard>) {
        let id = workload.id;

        let cluster_steps = {
            let this = self.clone();
            let device_bound = workload.device_key().is_some();
            tokio::spawn(async move {
                this.remove_cluster_objects(&workload).await;
                this.drain(&workload).await;
                if device_bound {
                    this.set_stage(workload.id, DeletionStage::HardwareReleaseGrace);
                    tokio::time::sleep(this.hardware_grace).await;
                }
            })
        };
        if let Err(e) = cluster_steps.await {
            error!(workload = %id, error = %e, "cluster teardown aborted");
        }

        match retry_with_backoff(&self.row_retry, "remove workload row", || {
            self.store.delete(id)
        })
        .await
        {
            Ok(_) => self.set_stage(id, DeletionStage::DbRowRemoved),
            Err(e) => error!(workload = %id, error = %e, "workload row left behind"),
        }

        if let Some(guard) = guard {
            guard.release();
        }
        self.set_stage(id, DeletionStage::LeaseReleased);
        self.stages.remove(&id);
        info!(workload = %id, "deletion finished");
    }

    async fn remove_cluster_objects(&self, workload: &Workload) {
        let mut names: BTreeSet<ObjectName> = workload.object_names.iter().cloned().collect();

        for family in [Family::Primary(workload.kind), Family::Paired] {
            match self.engine.list_by_labels(family, Some(workload.id)).await {
                Ok(found) => names.extend(found.into_iter().map(|o| ObjectName {
                    kind: o.kind,
                    name: o.name,
                })),
                Err(e) => warn!(
                    workload = %workload.id,
                    family = ?family,
                    error = %e,
                    "label discovery failed, using recorded names"
                ),
            }
        }

        let names: Vec<_> = names.into_iter().collect();
        let removed = self.engine.delete(&names).await;
        debug!(workload = %workload.id, removed, known = names.len(), "objects deleted");
        self.set_stage(workload.id, DeletionStage::ClusterObjectsRemoved);
    }

    async fn drain(&self, workload: &Workload) {
        self.set_stage(workload.id, DeletionStage::PodDrainWait);
        let deadline = Instant::now() + self.drain_wait;

        loop {
            let remaining = self.remaining_pods(workload).await;
            if remaining == 0 {
                debug!(workload = %workload.id, "pods drained");
                return;
            }
            if Instant::now() >= deadline {
                warn!(workload = %workload.id, remaining, "drain budget spent, continuing");
                return;
            }
            tokio::time::sleep(self.drain_poll).await;
        }
    }

    async fn remaining_pods(&self, workload: &Workload) -> usize {
        let mut count = 0;
        for family in [Family::Primary(workload.kind), Family::Paired] {
            let query = family.query(self.product(), Some(workload.id));
            match self
                .engine
                .bounded(self.engine.cluster().list_pods(&query))
                .await
            {
                Ok(pods) => count += pods.len(),
                Err(e) => {
                    warn!(workload = %workload.id, error = %e, "pod poll failed");
                    count += 1;
                }
            }
        }
        count
    }

    fn product(&self) -> &str {
        self.engine.product()
    }

    fn set_stage(&self, id: Uuid, stage: DeletionStage) {
        info!(workload = %id, stage = ?stage, "deletion stage");
        self.stages.insert(id, stage);
    }
}
