//! Idempotent apply and best-effort delete of workload objects
//!
//! `apply` creates each object and falls back to an in-place replace when
//! the name is already taken, so re-applying the same workload converges to
//! one object per kind no matter how many callers race. `delete` never
//! fails: missing objects count as deleted and other errors are logged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::{ClusterClient, ClusterError, ClusterObject, ObjectKind, ObjectRef};
use crate::model::ObjectName;
use crate::spec::naming::Family;
use crate::workload::GeneratedWorkload;
use crate::Error;

/// Applies and deletes cluster objects with a per-call time budget
#[derive(Clone)]
pub struct ApplyEngine {
    cluster: Arc<dyn ClusterClient>,
    product: String,
    timeout: Duration,
}

impl ApplyEngine {
    /// Create an engine over a cluster client
    pub fn new(cluster: Arc<dyn ClusterClient>, product: impl Into<String>, timeout: Duration) -> Self {
        Self {
            cluster,
            product: product.into(),
            timeout,
        }
    }

    /// Value of the `app` label the engine scopes discovery to
    pub fn product(&self) -> &str {
        &self.product
    }

    /// The underlying cluster client
    pub fn cluster(&self) -> &Arc<dyn ClusterClient> {
        &self.cluster
    }

    /// Create or replace every object of a generated workload, in order
    ///
    /// Returns the names of all applied objects. Stops at the first object
    /// that fails with anything other than a name conflict.
    pub async fn apply(&self, generated: &GeneratedWorkload) -> Result<Vec<ObjectName>, Error> {
        let objects = generated.to_objects()?;
        let mut names = Vec::with_capacity(objects.len());
        for object in &objects {
            self.apply_one(object).await?;
            names.push(ObjectName {
                kind: object.kind,
                name: object.name.clone(),
            });
        }
        Ok(names)
    }

    async fn apply_one(&self, object: &ClusterObject) -> Result<(), Error> {
        let failed = |e: ClusterError| Error::apply(object.kind.as_str(), &object.name, e);

        match self.bounded(self.cluster.create(object)).await {
            Ok(()) => {
                info!(kind = %object.kind, name = %object.name, "created");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(kind = %object.kind, name = %object.name, "exists, replacing");
                match self.bounded(self.cluster.replace(object)).await {
                    Ok(()) => {
                        info!(kind = %object.kind, name = %object.name, "replaced");
                        Ok(())
                    }
                    // Deleted between create and replace: try once more from scratch
                    Err(e) if e.is_not_found() => self
                        .bounded(self.cluster.create(object))
                        .await
                        .map_err(failed),
                    Err(e) => Err(failed(e)),
                }
            }
            Err(e) => Err(failed(e)),
        }
    }

    /// Delete objects by name; never fails
    ///
    /// Returns how many objects were actually removed.
    pub async fn delete(&self, names: &[ObjectName]) -> usize {
        let mut removed = 0;
        for object in names {
            match self.delete_one(object.kind, &object.name).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    kind = %object.kind,
                    name = %object.name,
                    error = %e,
                    "delete failed, continuing"
                ),
            }
        }
        removed
    }

    /// Delete one object; `Ok(false)` when it was already gone
    pub async fn delete_one(&self, kind: ObjectKind, name: &str) -> Result<bool, ClusterError> {
        match self.bounded(self.cluster.delete(kind, name)).await {
            Ok(()) => {
                info!(kind = %kind, name = %name, "deleted");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                debug!(kind = %kind, name = %name, "already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// List objects of every kind in a family, optionally for one owner
    pub async fn list_by_labels(
        &self,
        family: Family,
        owner: Option<Uuid>,
    ) -> Result<Vec<ObjectRef>, ClusterError> {
        let query = family.query(&self.product, owner);
        let mut out = Vec::new();
        for kind in ObjectKind::ALL {
            out.extend(self.bounded(self.cluster.list(kind, &query)).await?);
        }
        Ok(out)
    }

    /// Run a cluster call under the configured time budget
    pub async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ClusterError>>,
    ) -> Result<T, ClusterError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ClusterError::Timeout)?
    }
}
