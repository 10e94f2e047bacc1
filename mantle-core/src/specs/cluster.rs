//! Cluster-scoped desired state: clusters and their machine sets.
use crate::labels::Selector;
use crate::resource::Spec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The desired cluster. Owns child machine sets by the cluster label.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub kubernetes_version: String,
    pub talos_version: String,
    #[serde(default)]
    pub features: ClusterFeatures,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFeatures {
    /// Expose in-cluster services through the workload proxy.
    #[serde(default)]
    pub enable_workload_proxy: bool,
    #[serde(default)]
    pub disk_encryption: bool,
}

impl Spec for ClusterSpec {
    const KIND: &'static str = "Cluster";
}

/// Role of a machine set within its cluster.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum MachineSetRole {
    #[default]
    Worker,
    ControlPlane,
}

impl fmt::Display for MachineSetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineSetRole::Worker => f.write_str("worker"),
            MachineSetRole::ControlPlane => f.write_str("control-plane"),
        }
    }
}

/// A control-plane or worker group within a cluster.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    pub cluster: String,
    #[serde(default)]
    pub role: MachineSetRole,
    /// Machines (by label) eligible for allocation into this set.
    #[serde(default)]
    pub machine_selector: Selector,
    /// Locked sets do not accept config or upgrade rollouts.
    #[serde(default)]
    pub locked: bool,
}

impl Spec for MachineSetSpec {
    const KIND: &'static str = "MachineSet";
}

/// Per-machine desired membership in a machine set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMachineSpec {
    /// Kubernetes version override; empty means "follow the cluster".
    #[serde(default)]
    pub kubernetes_version: String,
}

impl Spec for ClusterMachineSpec {
    const KIND: &'static str = "ClusterMachine";
}

/// Rollup of machine-set and machine readiness for one cluster.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusSpec {
    #[serde(default)]
    pub machines: u32,
    #[serde(default)]
    pub ready_machines: u32,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub phase: String,
}

impl Spec for ClusterStatusSpec {
    const KIND: &'static str = "ClusterStatus";
}

/// Observed per-machine rollout state.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMachineStatusSpec {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub stage: String,
    /// Last config apply failure, empty when the apply succeeded.
    #[serde(default)]
    pub apply_error: String,
}

impl Spec for ClusterMachineStatusSpec {
    const KIND: &'static str = "ClusterMachineStatus";
}
