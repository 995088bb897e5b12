//! Cluster-client interface
//!
//! Everything the orchestrator does to the cluster goes through
//! [`ClusterClient`]: create, replace, delete, label-filtered listing and pod
//! observation. [`KubeCluster`] talks to a real API server;
//! [`InMemoryCluster`] keeps objects in memory for tests and dry runs.

mod kube_client;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub use kube_client::KubeCluster;
pub use memory::InMemoryCluster;

/// Object kinds the orchestrator manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    /// apps/v1 Deployment
    Deployment,
    /// v1 Service
    Service,
    /// batch/v1 Job
    Job,
    /// batch/v1 CronJob
    CronJob,
}

impl ObjectKind {
    /// Every managed kind, in apply order
    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::Deployment,
        ObjectKind::Service,
        ObjectKind::Job,
        ObjectKind::CronJob,
    ];

    /// Kubernetes `kind` string
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Deployment => "Deployment",
            ObjectKind::Service => "Service",
            ObjectKind::Job => "Job",
            ObjectKind::CronJob => "CronJob",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed label selector
///
/// Renders to the Kubernetes selector syntax for the API server and can be
/// evaluated locally against a label map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelQuery {
    equals: BTreeMap<String, String>,
    exists: Vec<String>,
    absent: Vec<String>,
}

impl LabelQuery {
    /// Empty query (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    /// Require that `key` is present
    pub fn has(mut self, key: impl Into<String>) -> Self {
        self.exists.push(key.into());
        self
    }

    /// Require that `key` is absent
    pub fn lacks(mut self, key: impl Into<String>) -> Self {
        self.absent.push(key.into());
        self
    }

    /// Render as a Kubernetes label selector string
    pub fn to_selector(&self) -> String {
        let mut parts: Vec<String> = self
            .equals
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        parts.extend(self.exists.iter().cloned());
        parts.extend(self.absent.iter().map(|k| format!("!{k}")));
        parts.join(",")
    }

    /// Evaluate against a label map
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.equals.iter().all(|(k, v)| labels.get(k) == Some(v))
            && self.exists.iter().all(|k| labels.contains_key(k))
            && self.absent.iter().all(|k| !labels.contains_key(k))
    }
}

impl fmt::Display for LabelQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_selector())
    }
}

/// A fully rendered object ready to send to the cluster
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterObject {
    /// Object kind
    pub kind: ObjectKind,
    /// Object name
    pub name: String,
    /// Full manifest (apiVersion, kind, metadata, spec)
    pub body: serde_json::Value,
}

impl ClusterObject {
    /// Serialize a typed manifest
    pub fn from_manifest(
        kind: ObjectKind,
        name: impl Into<String>,
        manifest: &impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            name: name.into(),
            body: serde_json::to_value(manifest)?,
        })
    }

    /// Labels from `metadata.labels`
    pub fn labels(&self) -> BTreeMap<String, String> {
        labels_at(&self.body, "/metadata/labels")
    }

    /// Pod template labels (`spec.template.metadata.labels`), if the kind has a template
    pub fn template_labels(&self) -> BTreeMap<String, String> {
        let pointer = match self.kind {
            ObjectKind::CronJob => "/spec/jobTemplate/spec/template/metadata/labels",
            _ => "/spec/template/metadata/labels",
        };
        labels_at(&self.body, pointer)
    }
}

fn labels_at(body: &serde_json::Value, pointer: &str) -> BTreeMap<String, String> {
    body.pointer(pointer)
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Name and labels of a listed object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    /// Object kind
    pub kind: ObjectKind,
    /// Object name
    pub name: String,
    /// Object labels
    pub labels: BTreeMap<String, String>,
}

/// Observed state of one container
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerState {
    /// Container is running
    Running,
    /// Container is waiting, with the kubelet's reason
    Waiting {
        /// e.g. "ContainerCreating", "CrashLoopBackOff"
        reason: Option<String>,
    },
    /// Container exited
    Terminated {
        /// Process exit code
        exit_code: i32,
    },
}

/// Observed state of one pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodObservation {
    /// Pod name
    pub name: String,
    /// Pod phase (Pending, Running, Succeeded, Failed, Unknown)
    pub phase: Option<String>,
    /// Pod labels
    pub labels: BTreeMap<String, String>,
    /// Per-container state, empty when the kubelet has not reported yet
    pub containers: Vec<ContainerState>,
}

impl PodObservation {
    /// Whether this pod counts as running for the sweeper's repair pass
    pub fn is_running(&self) -> bool {
        self.phase.as_deref() == Some("Running")
            || self
                .containers
                .iter()
                .any(|c| matches!(c, ContainerState::Running))
    }
}

/// Cluster call failure
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Object already exists (HTTP 409)
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Object kind
        kind: ObjectKind,
        /// Object name
        name: String,
    },

    /// Object does not exist (HTTP 404)
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind
        kind: ObjectKind,
        /// Object name
        name: String,
    },

    /// Any other API server rejection
    #[error("api error {code}: {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Server message
        message: String,
    },

    /// Call exceeded its time budget
    #[error("cluster call timed out")]
    Timeout,

    /// Transport or client failure
    #[error("kubernetes client error: {0}")]
    Kube(#[source] kube::Error),
}

impl ClusterError {
    /// Whether the error is the "already exists" conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }

    /// Whether the error is "not found"
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    /// Whether retrying later might succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::Timeout | ClusterError::Kube(_) => true,
            ClusterError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Operations the orchestrator needs from a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create an object; fails with `AlreadyExists` if the name is taken
    async fn create(&self, object: &ClusterObject) -> Result<(), ClusterError>;

    /// Replace an existing object in place with the given manifest
    async fn replace(&self, object: &ClusterObject) -> Result<(), ClusterError>;

    /// Delete an object by name; fails with `NotFound` if absent
    async fn delete(&self, kind: ObjectKind, name: &str) -> Result<(), ClusterError>;

    /// List objects of one kind matching a label query
    async fn list(&self, kind: ObjectKind, query: &LabelQuery)
        -> Result<Vec<ObjectRef>, ClusterError>;

    /// List pods matching a label query
    async fn list_pods(&self, query: &LabelQuery) -> Result<Vec<PodObservation>, ClusterError>;
}
