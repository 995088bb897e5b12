//! Protocol dispatch table
//!
//! Each protocol names the image role, port and argument builder for the
//! workload's main container, and which workload kinds may use it.

use crate::config::ImageConfig;
use crate::model::{Workload, WorkloadKind};
use crate::Error;

/// Which configured image a protocol runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageRole {
    /// Camera relay
    Relay,
    /// Recorder
    Recorder,
    /// Agent runtime
    Agent,
}

impl ImageRole {
    /// Resolve against configured images
    pub fn image<'a>(&self, images: &'a ImageConfig) -> &'a str {
        match self {
            ImageRole::Relay => &images.relay_image,
            ImageRole::Recorder => &images.recorder_image,
            ImageRole::Agent => &images.agent_image,
        }
    }
}

/// Spec template for one protocol
#[derive(Debug)]
pub struct ProtocolProfile {
    /// Protocol key
    pub name: &'static str,
    /// Workload kinds allowed to use it
    pub kinds: &'static [WorkloadKind],
    /// Container image role
    pub image: ImageRole,
    /// Named container port exposed through the Service
    pub port: Option<(&'static str, u16)>,
    /// Whether the workload owns a node-local device
    pub device_bound: bool,
    /// Whether a source locator is mandatory
    pub requires_source: bool,
    /// Container arguments
    pub args: fn(&Workload) -> Vec<String>,
}

/// Port the camera relay re-publishes the stream on
pub const RELAY_PORT: u16 = 8554;

/// Recorder control port
pub const RECORDER_PORT: u16 = 8090;

/// Agent HTTP port
pub const AGENT_PORT: u16 = 8000;

const CAMERA: &[WorkloadKind] = &[WorkloadKind::Camera];
const RECORDER: &[WorkloadKind] = &[WorkloadKind::Recorder];
const AGENTS: &[WorkloadKind] = &[
    WorkloadKind::Agent,
    WorkloadKind::AgentTask,
    WorkloadKind::Cron,
];

static PROTOCOLS: &[ProtocolProfile] = &[
    ProtocolProfile {
        name: "rtsp",
        kinds: CAMERA,
        image: ImageRole::Relay,
        port: Some(("stream", RELAY_PORT)),
        device_bound: false,
        requires_source: true,
        args: network_camera_args,
    },
    ProtocolProfile {
        name: "http",
        kinds: CAMERA,
        image: ImageRole::Relay,
        port: Some(("stream", RELAY_PORT)),
        device_bound: false,
        requires_source: true,
        args: network_camera_args,
    },
    ProtocolProfile {
        name: "usb",
        kinds: CAMERA,
        image: ImageRole::Relay,
        port: Some(("stream", RELAY_PORT)),
        device_bound: true,
        requires_source: false,
        args: device_camera_args,
    },
    ProtocolProfile {
        name: "csi",
        kinds: CAMERA,
        image: ImageRole::Relay,
        port: Some(("stream", RELAY_PORT)),
        device_bound: true,
        requires_source: false,
        args: device_camera_args,
    },
    ProtocolProfile {
        name: "recorder",
        kinds: RECORDER,
        image: ImageRole::Recorder,
        port: Some(("control", RECORDER_PORT)),
        device_bound: false,
        requires_source: true,
        args: recorder_args,
    },
    ProtocolProfile {
        name: "agent",
        kinds: AGENTS,
        image: ImageRole::Agent,
        port: Some(("http", AGENT_PORT)),
        device_bound: false,
        requires_source: false,
        args: agent_args,
    },
];

/// Find the profile for a workload's protocol
pub fn lookup(workload: &Workload) -> Result<&'static ProtocolProfile, Error> {
    PROTOCOLS
        .iter()
        .find(|p| p.name == workload.config.protocol && p.kinds.contains(&workload.kind))
        .ok_or_else(|| Error::unsupported_protocol(&workload.config.protocol, workload.kind.as_str()))
}

fn capture_args(workload: &Workload, out: &mut Vec<String>) {
    if let Some(resolution) = &workload.config.resolution {
        out.extend(["--resolution".to_string(), resolution.clone()]);
    }
    if let Some(fps) = workload.config.framerate {
        out.extend(["--framerate".to_string(), fps.to_string()]);
    }
    out.extend(["--listen".to_string(), format!(":{RELAY_PORT}")]);
}

fn network_camera_args(workload: &Workload) -> Vec<String> {
    let mut args = vec![
        "--protocol".to_string(),
        workload.config.protocol.clone(),
        "--source".to_string(),
        workload.config.source.clone().unwrap_or_default(),
    ];
    capture_args(workload, &mut args);
    args
}

fn device_camera_args(workload: &Workload) -> Vec<String> {
    let mut args = vec![
        "--protocol".to_string(),
        workload.config.protocol.clone(),
        "--device".to_string(),
        workload.config.device_path.clone().unwrap_or_default(),
    ];
    capture_args(workload, &mut args);
    args
}

fn recorder_args(workload: &Workload) -> Vec<String> {
    vec![
        "--source".to_string(),
        workload.config.source.clone().unwrap_or_default(),
        "--listen".to_string(),
        format!(":{RECORDER_PORT}"),
    ]
}

fn agent_args(workload: &Workload) -> Vec<String> {
    let mut args = vec!["--listen".to_string(), format!(":{AGENT_PORT}")];
    if let Some(entry) = &workload.config.source {
        args.extend(["--entrypoint".to_string(), entry.clone()]);
    }
    args
}
