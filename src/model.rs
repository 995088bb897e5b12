//! Workload rows as the orchestrator sees them
//!
//! A [`Workload`] is the DB's view of something that should exist on the
//! cluster. The orchestrator owns `status`, `object_names`, `error` and
//! `recording`; everything else comes from the creation request.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// What a workload is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadKind {
    /// Camera ingestion relay
    Camera,
    /// Standalone recorder
    Recorder,
    /// Long-running agent process
    Agent,
    /// One-shot agent run (Job)
    AgentTask,
    /// Scheduled agent run (CronJob)
    Cron,
}

impl WorkloadKind {
    /// All kinds, in sweep order
    pub const ALL: [WorkloadKind; 5] = [
        WorkloadKind::Camera,
        WorkloadKind::Recorder,
        WorkloadKind::Agent,
        WorkloadKind::AgentTask,
        WorkloadKind::Cron,
    ];

    /// Value of the `component` label
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Camera => "camera",
            WorkloadKind::Recorder => "recorder",
            WorkloadKind::Agent => "agent",
            WorkloadKind::AgentTask => "agent-task",
            WorkloadKind::Cron => "cron",
        }
    }

    /// Fixed prefix used in resource names
    pub fn name_prefix(&self) -> &'static str {
        match self {
            WorkloadKind::Camera => "cam",
            WorkloadKind::Recorder => "rec",
            WorkloadKind::Agent => "agent",
            WorkloadKind::AgentTask => "task",
            WorkloadKind::Cron => "cron",
        }
    }

    /// Label key carrying the owning workload id, e.g. `camera-id`
    pub fn id_label(&self) -> String {
        format!("{}-id", self.as_str())
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkloadKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown workload kind '{s}'")))
    }
}

/// Lifecycle status stored on the workload row
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadStatus {
    /// Row exists, nothing applied yet
    #[default]
    Pending,
    /// Objects applied, pods not running yet
    Creating,
    /// At least one container running
    Running,
    /// Apply failed or containers are crashing
    Error,
    /// No pods, or pods exited cleanly
    Stopped,
    /// Deletion accepted and in progress
    Deleting,
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadStatus::Pending => "Pending",
            WorkloadStatus::Creating => "Creating",
            WorkloadStatus::Running => "Running",
            WorkloadStatus::Error => "Error",
            WorkloadStatus::Stopped => "Stopped",
            WorkloadStatus::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

/// CPU / memory limits for the main container
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU quantity, e.g. "500m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory quantity, e.g. "256Mi"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceLimits {
    /// True when no limit is set
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

/// Protocol and runtime configuration of a workload
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadConfig {
    /// Protocol name (rtsp, usb, agent, ...)
    pub protocol: String,
    /// Frame size, e.g. "1280x720"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// Frames per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<u32>,
    /// Source locator (stream URL, agent entrypoint, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Node-local device path for device-bound protocols
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_path: Option<String>,
    /// Node the workload should run on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Container resource limits
    #[serde(default, skip_serializing_if = "ResourceLimits::is_empty")]
    pub resources: ResourceLimits,
    /// Cron expression for scheduled workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

/// Key identifying one physical device: the node it is attached to and its path
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Node name
    pub node: String,
    /// Device path on that node
    pub device_path: String,
}

impl DeviceKey {
    /// Create a new device key
    pub fn new(node: impl Into<String>, device_path: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            device_path: device_path.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.device_path)
    }
}

/// Reference to one cluster object backing a workload
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectName {
    /// Object kind
    pub kind: crate::cluster::ObjectKind,
    /// Object name
    pub name: String,
}

/// Error details recorded when a workload lands in `Error`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMetadata {
    /// Human-readable message
    pub message: String,
    /// Which operation recorded it (apply, sweeper, ...)
    pub source: String,
    /// When it was recorded
    pub at: DateTime<Utc>,
}

impl ErrorMetadata {
    /// Record an error now
    pub fn now(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: source.into(),
            at: Utc::now(),
        }
    }
}

/// A workload row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    /// Identity
    pub id: Uuid,
    /// Human name, slugged into resource names
    pub name: String,
    /// What kind of workload
    pub kind: WorkloadKind,
    /// Protocol and runtime configuration
    pub config: WorkloadConfig,
    /// Stored lifecycle status
    #[serde(default)]
    pub status: WorkloadStatus,
    /// Names of the backing cluster objects
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_names: Vec<ObjectName>,
    /// Last recorded error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMetadata>,
    /// Whether a recording is believed to be in progress on the paired recorder
    #[serde(default)]
    pub recording: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Workload {
    /// Build a new `Pending` row from a descriptor
    pub fn new(name: impl Into<String>, kind: WorkloadKind, config: WorkloadConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            config,
            status: WorkloadStatus::Pending,
            object_names: Vec::new(),
            error: None,
            recording: false,
            created_at: Utc::now(),
        }
    }

    /// The physical device this workload claims, if any
    ///
    /// Only a workload with both a device path and a node claims a device;
    /// descriptor validation rejects a device path without a node.
    pub fn device_key(&self) -> Option<DeviceKey> {
        match (&self.config.node, &self.config.device_path) {
            (Some(node), Some(path)) => Some(DeviceKey::new(node, path)),
            _ => None,
        }
    }

    /// First 8 hex digits of the id, used to disambiguate resource names
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

/// Partial update applied to a single row
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadPatch {
    /// New status
    pub status: Option<WorkloadStatus>,
    /// Replace object names
    pub object_names: Option<Vec<ObjectName>>,
    /// Set (`Some(Some)`) or clear (`Some(None)`) error metadata
    pub error: Option<Option<ErrorMetadata>>,
    /// Set the recording flag
    pub recording: Option<bool>,
}

impl WorkloadPatch {
    /// Patch that only changes status
    pub fn status(status: WorkloadStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Patch that moves to `Error` with a message
    pub fn failed(source: &str, message: impl Into<String>) -> Self {
        Self {
            status: Some(WorkloadStatus::Error),
            error: Some(Some(ErrorMetadata::now(source, message))),
            ..Default::default()
        }
    }

    /// Apply the patch to a row in place
    pub fn apply_to(&self, workload: &mut Workload) {
        if let Some(status) = self.status {
            workload.status = status;
        }
        if let Some(names) = &self.object_names {
            workload.object_names = names.clone();
        }
        if let Some(error) = &self.error {
            workload.error = error.clone();
        }
        if let Some(recording) = self.recording {
            workload.recording = recording;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_round_trip_through_from_str() {
        for kind in WorkloadKind::ALL {
            assert_eq!(kind.as_str().parse::<WorkloadKind>().unwrap(), kind);
        }
        assert!("camera-2".parse::<WorkloadKind>().is_err());
        assert_eq!(WorkloadKind::AgentTask.id_label(), "agent-task-id");
    }

    #[test]
    fn device_key_requires_node_and_path() {
        let mut w = Workload::new(
            "porch",
            WorkloadKind::Camera,
            WorkloadConfig {
                protocol: "usb".to_string(),
                device_path: Some("/dev/video0".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(w.device_key(), None);

        w.config.node = Some("edge1".to_string());
        assert_eq!(w.device_key(), Some(DeviceKey::new("edge1", "/dev/video0")));
    }

    #[test]
    fn short_id_is_stable_prefix() {
        let w = Workload::new("a", WorkloadKind::Agent, WorkloadConfig::default());
        assert_eq!(w.short_id().len(), 8);
        assert!(w.id.simple().to_string().starts_with(&w.short_id()));
    }

    #[test]
    fn patch_clears_error_and_sets_status() {
        let mut w = Workload::new("a", WorkloadKind::Agent, WorkloadConfig::default());
        WorkloadPatch::failed("apply", "boom").apply_to(&mut w);
        assert_eq!(w.status, WorkloadStatus::Error);
        assert_eq!(w.error.as_ref().unwrap().message, "boom");

        let patch = WorkloadPatch {
            status: Some(WorkloadStatus::Running),
            error: Some(None),
            ..Default::default()
        };
        patch.apply_to(&mut w);
        assert_eq!(w.status, WorkloadStatus::Running);
        assert!(w.error.is_none());
    }
}
