//! Machine configuration: patches, rendered configs and the redacted audit
//! trail.
use crate::resource::Spec;
use serde::{Deserialize, Serialize};

/// A reusable machine-config patch, labeled to the scope it applies to
/// (cluster, machine set or cluster machine).
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatchSpec {
    /// The patch body, a (strategic-merge) machine-config YAML fragment.
    #[serde(default)]
    pub data: String,
}

impl Spec for ConfigPatchSpec {
    const KIND: &'static str = "ConfigPatch";
}

/// The ordered patch layers selected for one cluster machine.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMachineConfigPatchesSpec {
    #[serde(default)]
    pub patches: Vec<String>,
}

impl Spec for ClusterMachineConfigPatchesSpec {
    const KIND: &'static str = "ClusterMachineConfigPatches";
}

/// The rendered machine config for one cluster machine.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMachineConfigSpec {
    /// Final rendered config bytes. On generation failure the previous
    /// valid render is retained here.
    #[serde(default)]
    pub data: String,
    /// SHA-256 of `data`, consumed by downstream apply loops.
    #[serde(default)]
    pub content_hash: String,
    /// Non-empty when the last render failed.
    #[serde(default)]
    pub generation_error: String,
}

impl Spec for ClusterMachineConfigSpec {
    const KIND: &'static str = "ClusterMachineConfig";
}

/// Redacted copy of the latest machine config, safe for diffing.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedactedClusterMachineConfigSpec {
    #[serde(default)]
    pub data: String,
}

impl Spec for RedactedClusterMachineConfigSpec {
    const KIND: &'static str = "RedactedClusterMachineConfig";
}

/// A unified diff between two consecutive redacted configs of a machine.
///
/// Resource ids are prefixed with the machine id so per-machine retention can
/// list them with a glob.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigDiffSpec {
    #[serde(default)]
    pub diff: String,
}

impl Spec for MachineConfigDiffSpec {
    const KIND: &'static str = "MachineConfigDiff";
}
