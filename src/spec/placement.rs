//! Node placement
//!
//! Device-bound pods must land on the node the device is plugged into. Other
//! pods follow the node hint, then the operator default, then the scheduler.
//! Whatever node is chosen, its taints are turned into tolerations through a
//! [`TolerationResolver`] so tainted edge nodes accept the pod.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::model::Workload;
use crate::workload::Toleration;
use crate::Error;

/// Well-known label used to pin a pod to one node
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Maps a node to the tolerations a pod needs to run there
pub trait TolerationResolver: Send + Sync {
    /// Tolerations for pods pinned to `node`
    fn tolerations_for(&self, node: &str) -> Vec<Toleration>;
}

/// A taint on a named node, as configured by the operator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTaint {
    /// Node carrying the taint
    pub node: String,
    /// Taint key
    pub key: String,
    /// Taint value, if any
    pub value: Option<String>,
    /// Taint effect
    pub effect: String,
}

impl NodeTaint {
    /// The toleration matching this taint
    pub fn toleration(&self) -> Toleration {
        Toleration {
            key: Some(self.key.clone()),
            operator: Some(if self.value.is_some() { "Equal" } else { "Exists" }.to_string()),
            value: self.value.clone(),
            effect: Some(self.effect.clone()),
        }
    }
}

impl FromStr for NodeTaint {
    type Err = String;

    /// Parse `node=key[=value]:Effect`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || format!("expected node=key[=value]:Effect, got '{s}'");
        let (node, taint) = s.split_once('=').ok_or_else(err)?;
        let (kv, effect) = taint.rsplit_once(':').ok_or_else(err)?;
        let (key, value) = match kv.split_once('=') {
            Some((k, v)) => (k, Some(v.to_string())),
            None => (kv, None),
        };
        if node.is_empty() || key.is_empty() {
            return Err(err());
        }
        match effect {
            "NoSchedule" | "PreferNoSchedule" | "NoExecute" => {}
            other => return Err(format!("unknown taint effect '{other}'")),
        }
        Ok(Self {
            node: node.to_string(),
            key: key.to_string(),
            value,
            effect: effect.to_string(),
        })
    }
}

/// Resolver backed by a fixed node → taints table
#[derive(Clone, Debug, Default)]
pub struct StaticTolerations {
    by_node: BTreeMap<String, Vec<NodeTaint>>,
}

impl StaticTolerations {
    /// Build from taints grouped by node
    pub fn new(by_node: BTreeMap<String, Vec<NodeTaint>>) -> Self {
        Self { by_node }
    }
}

impl TolerationResolver for StaticTolerations {
    fn tolerations_for(&self, node: &str) -> Vec<Toleration> {
        self.by_node
            .get(node)
            .map(|taints| taints.iter().map(NodeTaint::toleration).collect())
            .unwrap_or_default()
    }
}

/// Where a pod may run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Placement {
    /// Node the pod is pinned to, if any
    pub node: Option<String>,
    /// Tolerations for that node
    pub tolerations: Vec<Toleration>,
}

impl Placement {
    /// `nodeSelector` for the pod spec
    pub fn node_selector(&self) -> Option<BTreeMap<String, String>> {
        self.node
            .as_ref()
            .map(|n| BTreeMap::from([(HOSTNAME_LABEL.to_string(), n.clone())]))
    }
}

/// Decide placement for a workload
pub fn resolve(
    workload: &Workload,
    device_bound: bool,
    default_node: Option<&str>,
    resolver: &dyn TolerationResolver,
) -> Result<Placement, Error> {
    let node = if device_bound {
        match &workload.config.node {
            Some(node) => Some(node.clone()),
            None => {
                return Err(Error::validation(format!(
                    "device-bound workload '{}' must name the node its device is attached to",
                    workload.name
                )))
            }
        }
    } else {
        workload
            .config
            .node
            .clone()
            .or_else(|| default_node.map(str::to_string))
    };

    let tolerations = node
        .as_deref()
        .map(|n| resolver.tolerations_for(n))
        .unwrap_or_default();

    Ok(Placement { node, tolerations })
}
