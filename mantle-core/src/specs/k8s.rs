//! Kubernetes component observations and version rollups.
use crate::resource::Spec;
use serde::{Deserialize, Serialize};

/// Observed Kubernetes component state for a cluster, keyed by cluster id.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesStatusSpec {
    #[serde(default)]
    pub nodes: Vec<NodeStatus>,
    #[serde(default)]
    pub static_pods: Vec<NodeStaticPods>,
}

impl KubernetesStatusSpec {
    /// The node entry for `nodename`, if observed.
    #[must_use]
    pub fn node(&self, nodename: &str) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| n.nodename == nodename)
    }

    /// The static pods observed on `nodename`, if any.
    #[must_use]
    pub fn static_pods_on(&self, nodename: &str) -> Option<&NodeStaticPods> {
        self.static_pods.iter().find(|p| p.nodename == nodename)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub nodename: String,
    #[serde(default)]
    pub kubelet_version: String,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStaticPods {
    pub nodename: String,
    #[serde(default)]
    pub pods: Vec<StaticPodStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaticPodStatus {
    /// One of `kube-apiserver`, `kube-controller-manager`, `kube-scheduler`.
    pub app: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub ready: bool,
}

impl Spec for KubernetesStatusSpec {
    const KIND: &'static str = "KubernetesStatus";
}

/// Progress of a Kubernetes upgrade rollout.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesUpgradeStatusSpec {
    #[serde(default)]
    pub last_upgrade_version: String,
    #[serde(default)]
    pub current_upgrade_version: String,
    /// Human-readable summary of why the rollout cannot proceed.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: String,
}

impl Spec for KubernetesUpgradeStatusSpec {
    const KIND: &'static str = "KubernetesUpgradeStatus";
}

/// An available Kubernetes version.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesVersionSpec {
    #[serde(default)]
    pub version: String,
}

impl Spec for KubernetesVersionSpec {
    const KIND: &'static str = "KubernetesVersion";
}

/// An available Talos version and the Kubernetes versions it supports.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TalosVersionSpec {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub compatible_kubernetes_versions: Vec<String>,
}

impl Spec for TalosVersionSpec {
    const KIND: &'static str = "TalosVersion";
}
