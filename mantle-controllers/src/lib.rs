//! Behavioral controllers for the mantle reconciliation runtime.
//!
//! Each controller is a reducer over store slices: config-patch selection
//! and validation, machine-config rendering, the redacted audit trail,
//! Kubernetes upgrade planning, SideroLink join composition, machine-set
//! allocation, and the projections that keep the log pipeline and workload
//! proxy in step with resource state.

pub mod cluster_status;
pub mod join;
pub mod log_lifecycle;
pub mod machine_config;
pub mod machine_set;
pub mod patches;
pub mod proxy_sync;
pub mod redact;
pub mod upgrade;

pub use cluster_status::ClusterStatusController;
pub use join::{
    compose_join_config, extend_join_token, join_config_bundle, parse_extended_token,
    rewrite_kernel_args, ExtendedClaims, JoinComposition, MachineJoinConfigController,
    SIDEROLINK_ARG_PREFIX, SIDEROLINK_LINK_LOCAL_ADDR,
};
pub use log_lifecycle::{LinkedMachines, LogStoreLifecycleController};
pub use machine_config::{installer_image, merge_yaml, MachineConfigController};
pub use machine_set::MachineSetController;
pub use patches::{
    patches_for, validate_patch, ClusterMachineConfigPatchesController, PatchValidationError,
};
pub use proxy_sync::WorkloadProxySyncController;
pub use redact::{
    redact_config, unified_diff, DiffRetention, MachineConfigDiffController,
    RedactedConfigController, REDACTED,
};
pub use upgrade::{
    machine_map, plan_upgrade, Component, KubernetesUpgradeStatusController, MachineMap,
    UpgradePath, UpgradeStep,
};
