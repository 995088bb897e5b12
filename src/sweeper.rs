//! Orphan sweeping and drift repair
//!
//! The sweep compares the set of workload ids in the store with the owner
//! labels on cluster objects. Objects whose owner no longer exists are
//! deleted; objects whose owner is still present (including rows being
//! deleted) are left alone. A second pass catches pods that died without
//! anyone noticing: a camera the store believes is recording with no
//! running recorder, or an agent task the store believes is running with no
//! running pod, is moved to `Error`.
//!
//! The sweep never creates cluster objects and never deletes rows.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::apply::ApplyEngine;
use crate::cluster::{ClusterError, ObjectRef};
use crate::model::{ObjectName, Workload, WorkloadKind, WorkloadPatch, WorkloadStatus};
use crate::spec::naming::Family;
use crate::store::WorkloadStore;
use crate::Error;

type Listing = (Family, Result<Vec<ObjectRef>, ClusterError>);

/// Source recorded on rows the sweeper moves to `Error`
pub const SWEEPER_SOURCE: &str = "sweeper";

/// Outcome of one sweep
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Orphaned objects that were deleted
    pub deleted: Vec<ObjectName>,
    /// Rows moved to `Error` by the repair pass
    pub repaired: Vec<Uuid>,
    /// Non-fatal failures, one line each
    pub errors: Vec<String>,
}

impl SweepReport {
    /// True when the sweep changed nothing and hit no errors
    pub fn is_clean(&self) -> bool {
        self.deleted.is_empty() && self.repaired.is_empty() && self.errors.is_empty()
    }
}

/// Reconciles cluster objects against the store
#[derive(Clone)]
pub struct OrphanSweeper {
    engine: ApplyEngine,
    store: Arc<dyn WorkloadStore>,
}

impl OrphanSweeper {
    /// Create a sweeper
    pub fn new(engine: ApplyEngine, store: Arc<dyn WorkloadStore>) -> Self {
        Self { engine, store }
    }

    /// Run one sweep
    ///
    /// Fails without touching anything if the live id set cannot be read.
    /// Every later failure is recorded in the report and the sweep carries on.
    pub async fn sweep(&self) -> Result<SweepReport, Error> {
        let listings = self.list_families().await;
        // Read after listing: a creation inserts its row before applying, so
        // any object seen above has its owner in this set if the owner exists
        let live = self.store.ids().await?;
        let mut report = SweepReport::default();

        self.delete_orphans(listings, &live, &mut report).await;
        self.repair(&mut report).await;

        info!(
            deleted = report.deleted.len(),
            repaired = report.repaired.len(),
            errors = report.errors.len(),
            "sweep finished"
        );
        Ok(report)
    }

    async fn list_families(&self) -> Vec<Listing> {
        let families = Family::all();
        let listings = join_all(
            families
                .iter()
                .map(|family| self.engine.list_by_labels(*family, None)),
        )
        .await;
        families.into_iter().zip(listings).collect()
    }

    async fn delete_orphans(
        &self,
        listings: Vec<Listing>,
        live: &HashSet<Uuid>,
        report: &mut SweepReport,
    ) {
        for (family, listing) in listings {
            let objects = match listing {
                Ok(objects) => objects,
                Err(e) => {
                    report.errors.push(format!("list {family:?}: {e}"));
                    continue;
                }
            };

            let owner_label = family.owner_label();
            for object in objects {
                let owner = object
                    .labels
                    .get(&owner_label)
                    .and_then(|v| v.parse::<Uuid>().ok());
                let Some(owner) = owner else {
                    debug!(kind = %object.kind, name = %object.name, "owner label is not a workload id, skipping");
                    continue;
                };
                if live.contains(&owner) {
                    continue;
                }

                match self.engine.delete_one(object.kind, &object.name).await {
                    Ok(_) => {
                        info!(
                            kind = %object.kind,
                            name = %object.name,
                            owner = %owner,
                            "deleted orphan"
                        );
                        report.deleted.push(ObjectName {
                            kind: object.kind,
                            name: object.name,
                        });
                    }
                    Err(e) => report
                        .errors
                        .push(format!("delete {} {}: {e}", object.kind, object.name)),
                }
            }
        }
    }

    async fn repair(&self, report: &mut SweepReport) {
        let rows = match self.store.list().await {
            Ok(rows) => rows,
            Err(e) => {
                report.errors.push(format!("list workloads: {e}"));
                return;
            }
        };

        let recording: Vec<&Workload> = rows
            .iter()
            .filter(|w| {
                w.kind == WorkloadKind::Camera && w.recording && w.status != WorkloadStatus::Deleting
            })
            .collect();
        self.repair_family(
            Family::Paired,
            &recording,
            "recorder is not running while a recording is in progress",
            report,
        )
        .await;

        let running_tasks: Vec<&Workload> = rows
            .iter()
            .filter(|w| w.kind == WorkloadKind::AgentTask && w.status == WorkloadStatus::Running)
            .collect();
        self.repair_family(
            Family::Primary(WorkloadKind::AgentTask),
            &running_tasks,
            "task pod disappeared while running",
            report,
        )
        .await;
    }

    async fn repair_family(
        &self,
        family: Family,
        expected: &[&Workload],
        message: &str,
        report: &mut SweepReport,
    ) {
        if expected.is_empty() {
            return;
        }

        let query = family.query(self.engine.product(), None);
        let pods = match self
            .engine
            .bounded(self.engine.cluster().list_pods(&query))
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                report.errors.push(format!("list pods {family:?}: {e}"));
                return;
            }
        };

        let owner_label = family.owner_label();
        let running: HashSet<Uuid> = pods
            .iter()
            .filter(|p| p.is_running())
            .filter_map(|p| p.labels.get(&owner_label)?.parse().ok())
            .collect();

        for workload in expected {
            if running.contains(&workload.id) {
                continue;
            }
            warn!(workload = %workload.id, family = ?family, "{message}");
            let patch = WorkloadPatch {
                recording: Some(false),
                ..WorkloadPatch::failed(SWEEPER_SOURCE, message)
            };
            match self.store.update_unless_deleting(workload.id, patch).await {
                Ok(Some(row)) if row.status != WorkloadStatus::Deleting => {
                    report.repaired.push(workload.id)
                }
                Ok(_) => {}
                Err(e) => report
                    .errors
                    .push(format!("mark {} failed: {e}", workload.id)),
            }
        }
    }

    /// Sweep every `interval` until `shutdown` fires
    pub async fn run_periodic(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "sweep aborted");
                    }
                }
            }
        }
    }
}
