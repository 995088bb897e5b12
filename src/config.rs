//! Orchestrator configuration
//!
//! Parsed from CLI flags with `CAMFLEET_*` environment fallbacks. Library
//! callers and tests build it with [`OrchestratorConfig::default`].

use std::collections::BTreeMap;
use std::time::Duration;

use clap::Args;

use crate::spec::placement::NodeTaint;

/// Default namespace for managed objects
pub const DEFAULT_NAMESPACE: &str = "camfleet";

/// Default value of the `app` label
pub const DEFAULT_PRODUCT: &str = "camfleet";

/// Top-level orchestrator settings
#[derive(Clone, Debug, Args)]
pub struct OrchestratorConfig {
    /// Namespace all workload objects live in
    #[arg(long, env = "CAMFLEET_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Value of the `app` label on every managed object
    #[arg(long, env = "CAMFLEET_PRODUCT", default_value = DEFAULT_PRODUCT)]
    pub product: String,

    /// Node to pin workloads to when neither device nor hint says otherwise
    #[arg(long, env = "CAMFLEET_DEFAULT_NODE")]
    pub default_node: Option<String>,

    /// Node taints to tolerate when pinning, as `node=key[=value]:Effect`
    #[arg(long = "node-taint", env = "CAMFLEET_NODE_TAINTS", value_delimiter = ',')]
    pub node_taints: Vec<NodeTaint>,

    /// Container images
    #[command(flatten)]
    pub images: ImageConfig,

    /// Wait budgets and intervals
    #[command(flatten)]
    pub timings: Timings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            product: DEFAULT_PRODUCT.to_string(),
            default_node: None,
            node_taints: Vec::new(),
            images: ImageConfig::default(),
            timings: Timings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Taints grouped by node
    pub fn taints_by_node(&self) -> BTreeMap<String, Vec<NodeTaint>> {
        let mut out: BTreeMap<String, Vec<NodeTaint>> = BTreeMap::new();
        for taint in &self.node_taints {
            out.entry(taint.node.clone()).or_default().push(taint.clone());
        }
        out
    }
}

/// Images for the adapter containers the orchestrator deploys
#[derive(Clone, Debug, Args)]
pub struct ImageConfig {
    /// Camera relay image (stream ingestion)
    #[arg(
        long,
        env = "CAMFLEET_RELAY_IMAGE",
        default_value = "ghcr.io/camfleet/relay:latest"
    )]
    pub relay_image: String,

    /// Recorder image
    #[arg(
        long,
        env = "CAMFLEET_RECORDER_IMAGE",
        default_value = "ghcr.io/camfleet/recorder:latest"
    )]
    pub recorder_image: String,

    /// Agent runtime image
    #[arg(
        long,
        env = "CAMFLEET_AGENT_IMAGE",
        default_value = "ghcr.io/camfleet/agent:latest"
    )]
    pub agent_image: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            relay_image: "ghcr.io/camfleet/relay:latest".to_string(),
            recorder_image: "ghcr.io/camfleet/recorder:latest".to_string(),
            agent_image: "ghcr.io/camfleet/agent:latest".to_string(),
        }
    }
}

/// Wait budgets for cluster calls and the deletion sequence
#[derive(Clone, Debug, Args)]
pub struct Timings {
    /// Upper bound on any single cluster call, in seconds
    #[arg(long = "call-timeout", env = "CAMFLEET_CALL_TIMEOUT", default_value = "15", value_parser = parse_secs)]
    pub call_timeout: Duration,

    /// How long deletion waits for pods to terminate, in seconds
    #[arg(long = "drain-wait", env = "CAMFLEET_DRAIN_WAIT", default_value = "10", value_parser = parse_secs)]
    pub drain_wait: Duration,

    /// Poll interval while draining, in seconds
    #[arg(long = "drain-poll", env = "CAMFLEET_DRAIN_POLL", default_value = "1", value_parser = parse_secs)]
    pub drain_poll: Duration,

    /// Extra wait before a released device path may be reused, in seconds
    #[arg(long = "hardware-grace", env = "CAMFLEET_HARDWARE_GRACE", default_value = "5", value_parser = parse_secs)]
    pub hardware_grace: Duration,

    /// Interval between orphan sweeps, in seconds
    #[arg(long = "sweep-interval", env = "CAMFLEET_SWEEP_INTERVAL", default_value = "300", value_parser = parse_secs)]
    pub sweep_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(15),
            drain_wait: Duration::from_secs(10),
            drain_poll: Duration::from_secs(1),
            hardware_grace: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("expected whole seconds, got '{s}': {e}"))
}
