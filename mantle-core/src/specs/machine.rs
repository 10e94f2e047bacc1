//! Observed machine facts reported over the tunnel.
use crate::resource::Spec;
use serde::{Deserialize, Serialize};

/// Observed facts about a machine, refreshed while it is connected.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatusSpec {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub talos_version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub secure_boot_enabled: bool,
    /// Image-factory schematic the machine booted from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<Schematic>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Schematic {
    pub id: String,
    /// Set when the schematic could not be resolved against the factory;
    /// installer selection must fall back to the registry image.
    #[serde(default)]
    pub invalid: bool,
    #[serde(default)]
    pub overlay: String,
}

impl Spec for MachineStatusSpec {
    const KIND: &'static str = "MachineStatus";
}

/// Latest agent-reported snapshot for a machine.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatusSnapshotSpec {
    #[serde(default)]
    pub stage: String,
}

impl Spec for MachineStatusSnapshotSpec {
    const KIND: &'static str = "MachineStatusSnapshot";
}

/// An established tunnel link for a machine.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkSpec {
    #[serde(default)]
    pub node_subnet: String,
    #[serde(default)]
    pub node_public_key: String,
    #[serde(default)]
    pub connected: bool,
}

impl Spec for LinkSpec {
    const KIND: &'static str = "Link";
}

/// A machine that joined but has not been accepted yet.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingMachineSpec {
    #[serde(default)]
    pub talos_version: String,
}

impl Spec for PendingMachineSpec {
    const KIND: &'static str = "PendingMachine";
}

/// Per-node unique token minted when a machine first registers.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeUniqueTokenSpec {
    #[serde(default)]
    pub token: String,
}

impl Spec for NodeUniqueTokenSpec {
    const KIND: &'static str = "NodeUniqueToken";
}
