//! Machine-config rendering: base document, patch layering and installer
//! selection.
use crate::patches::patches_for;
use mantle_core::metadata::label;
use mantle_core::specs::cluster::{ClusterMachineSpec, ClusterSpec};
use mantle_core::specs::config::ClusterMachineConfigSpec;
use mantle_core::specs::join::ConnectionParamsSpec;
use mantle_core::specs::machine::MachineStatusSpec;
use mantle_core::{DynamicResource, Phase, Spec, TypedResource};
use mantle_runtime::{Controller, ControllerError, Input, InputKind, Output, Sharing};
use mantle_store::Store;
use serde_yaml::Value;
use sha2::{Digest, Sha256};

/// Registry image used when no valid schematic is known for the machine.
const FALLBACK_INSTALLER: &str = "ghcr.io/siderolabs/installer";
const FACTORY_HOST: &str = "factory.talos.dev";

/// Selects the installer image for a machine.
///
/// A valid schematic routes through the image factory (secure-boot variant
/// when the machine reports it); anything else falls back to the registry
/// image for the Talos version.
#[must_use]
pub fn installer_image(status: Option<&MachineStatusSpec>, talos_version: &str) -> String {
    if let Some(status) = status {
        if let Some(schematic) = status.schematic.as_ref().filter(|s| !s.invalid) {
            let flavor = if status.secure_boot_enabled {
                "installer-secureboot"
            } else {
                "installer"
            };
            return format!("{FACTORY_HOST}/{flavor}/{}:v{talos_version}", schematic.id);
        }
        if status.secure_boot_enabled {
            return format!("{FALLBACK_INSTALLER}-secureboot:v{talos_version}");
        }
    }
    format!("{FALLBACK_INSTALLER}:v{talos_version}")
}

/// Deep-merges `patch` into `base`: mappings merge recursively, everything
/// else (including sequences) is replaced by the patch.
pub fn merge_yaml(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Mapping(base_map), Value::Mapping(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_yaml(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn mapping(entries: Vec<(&str, Value)>) -> Value {
    let mut map = serde_yaml::Mapping::new();
    for (key, value) in entries {
        map.insert(Value::from(key), value);
    }
    Value::Mapping(map)
}

fn base_document(
    machine: &TypedResource<ClusterMachineSpec>,
    cluster: &TypedResource<ClusterSpec>,
    params: Option<&ConnectionParamsSpec>,
    installer: &str,
) -> Value {
    let machine_type = if machine
        .metadata
        .labels
        .contains_key(label::ROLE_CONTROL_PLANE)
    {
        "controlplane"
    } else {
        "worker"
    };
    let kubernetes_version = if machine.spec.kubernetes_version.is_empty() {
        cluster.spec.kubernetes_version.clone()
    } else {
        machine.spec.kubernetes_version.clone()
    };
    let endpoint = params.map(|p| p.api_endpoint.clone()).unwrap_or_default();
    mapping(vec![
        ("version", Value::from("v1alpha1")),
        (
            "machine",
            mapping(vec![
                ("type", Value::from(machine_type)),
                ("install", mapping(vec![("image", Value::from(installer))])),
                (
                    "kubelet",
                    mapping(vec![(
                        "image",
                        Value::from(format!("ghcr.io/siderolabs/kubelet:v{kubernetes_version}")),
                    )]),
                ),
            ]),
        ),
        (
            "cluster",
            mapping(vec![
                ("clusterName", Value::from(cluster.metadata.id.clone())),
                (
                    "controlPlane",
                    mapping(vec![("endpoint", Value::from(endpoint))]),
                ),
            ]),
        ),
    ])
}

/// Renders the final config document for one machine: base, then every
/// patch layer in order.
pub async fn render_config(
    store: &Store,
    machine: &TypedResource<ClusterMachineSpec>,
) -> Result<String, ControllerError> {
    let cluster_id = machine
        .metadata
        .labels
        .get(label::CLUSTER)
        .ok_or_else(|| {
            ControllerError::Invalid(format!(
                "cluster machine {} has no cluster label",
                machine.metadata.id
            ))
        })?;
    let cluster = store.get_as::<ClusterSpec>(cluster_id).await?;
    let params = match store
        .get_as::<ConnectionParamsSpec>("default")
        .await
    {
        Ok(params) => Some(params.spec),
        Err(err) if err.is_not_found() => None,
        Err(err) => return Err(err.into()),
    };
    let status = match store.get_as::<MachineStatusSpec>(&machine.metadata.id).await {
        Ok(status) => Some(status.spec),
        Err(err) if err.is_not_found() => None,
        Err(err) => return Err(err.into()),
    };

    let installer = installer_image(status.as_ref(), &cluster.spec.talos_version);
    let mut document = base_document(machine, &cluster, params.as_ref(), &installer);
    for patch in patches_for(store, machine).await? {
        let fragment: Value = serde_yaml::from_str(&patch.spec.data).map_err(|err| {
            ControllerError::Invalid(format!(
                "patch {} is not valid YAML: {err}",
                patch.metadata.id
            ))
        })?;
        merge_yaml(&mut document, fragment);
    }
    serde_yaml::to_string(&document)
        .map_err(|err| ControllerError::Invalid(format!("failed to serialize config: {err}")))
}

/// SHA-256 content hash stamped on successful renders.
#[must_use]
pub fn content_hash(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().fold(
        String::with_capacity(digest.len() * 2),
        |mut out, byte| {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
            out
        },
    )
}

/// Renders `ClusterMachineConfig` outputs; failed renders keep the previous
/// bytes and surface the error in `generation_error`.
pub struct MachineConfigController;

#[async_trait::async_trait]
impl Controller for MachineConfigController {
    fn name(&self) -> &'static str {
        "MachineConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::kind(ClusterMachineSpec::KIND, InputKind::Strong),
            Input::kind(ClusterSpec::KIND, InputKind::Weak),
            Input::kind(ConnectionParamsSpec::KIND, InputKind::Weak),
            Input::kind(MachineStatusSpec::KIND, InputKind::Weak),
            Input::kind(mantle_core::specs::config::ConfigPatchSpec::KIND, InputKind::Weak),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output {
            kind: ClusterMachineConfigSpec::KIND,
            sharing: Sharing::Exclusive,
        }]
    }

    async fn map(
        &self,
        store: &Store,
        input: &DynamicResource,
    ) -> Result<Vec<String>, ControllerError> {
        use mantle_core::specs::config::ConfigPatchSpec;
        use mantle_core::Selector;
        match input.metadata.kind.as_str() {
            kind if kind == ClusterSpec::KIND => {
                let machines = store
                    .list_as::<ClusterMachineSpec>(&Selector::equal(
                        label::CLUSTER,
                        &input.metadata.id,
                    ))
                    .await?;
                Ok(machines.into_iter().map(|m| m.metadata.id).collect())
            }
            kind if kind == ConnectionParamsSpec::KIND => {
                let machines = store.list_as::<ClusterMachineSpec>(&Selector::all()).await?;
                Ok(machines.into_iter().map(|m| m.metadata.id).collect())
            }
            kind if kind == ConfigPatchSpec::KIND => {
                let labels = &input.metadata.labels;
                if let Some(machine) = labels.get(label::CLUSTER_MACHINE) {
                    return Ok(vec![machine.clone()]);
                }
                let selector = if let Some(machine_set) = labels.get(label::MACHINE_SET) {
                    Selector::equal(label::MACHINE_SET, machine_set)
                } else if let Some(cluster) = labels.get(label::CLUSTER) {
                    Selector::equal(label::CLUSTER, cluster)
                } else {
                    return Ok(Vec::new());
                };
                let machines = store.list_as::<ClusterMachineSpec>(&selector).await?;
                Ok(machines.into_iter().map(|m| m.metadata.id).collect())
            }
            _ => Ok(vec![input.metadata.id.clone()]),
        }
    }

    async fn transform(
        &self,
        store: &Store,
        output_id: &str,
    ) -> Result<Option<DynamicResource>, ControllerError> {
        let machine = match store.get_as::<ClusterMachineSpec>(output_id).await {
            Ok(machine) => machine,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if machine.metadata.phase == Phase::TearingDown {
            return Ok(None);
        }
        let previous = store
            .get_as::<ClusterMachineConfigSpec>(output_id)
            .await
            .map(|config| config.spec)
            .unwrap_or_default();

        let spec = match render_config(store, &machine).await {
            Ok(data) => ClusterMachineConfigSpec {
                content_hash: content_hash(&data),
                data,
                generation_error: String::new(),
            },
            Err(ControllerError::Invalid(message)) => ClusterMachineConfigSpec {
                // Keep the previous valid render for the apply loops.
                data: previous.data,
                content_hash: previous.content_hash,
                generation_error: message,
            },
            Err(err) => return Err(err),
        };
        let mut output = TypedResource::new(output_id, spec);
        output.metadata.labels = machine.metadata.labels.clone();
        Ok(Some(output.into_dynamic()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantle_core::specs::machine::Schematic;

    fn status(schematic: Option<Schematic>, secure_boot: bool) -> MachineStatusSpec {
        MachineStatusSpec {
            schematic,
            secure_boot_enabled: secure_boot,
            ..MachineStatusSpec::default()
        }
    }

    #[test]
    fn installer_prefers_a_valid_schematic() {
        let with_schematic = status(
            Some(Schematic {
                id: "abcd1234".into(),
                invalid: false,
                overlay: String::new(),
            }),
            false,
        );
        assert_eq!(
            installer_image(Some(&with_schematic), "1.7.0"),
            "factory.talos.dev/installer/abcd1234:v1.7.0"
        );
    }

    #[test]
    fn secure_boot_selects_the_secureboot_flavor() {
        let with_schematic = status(
            Some(Schematic {
                id: "abcd1234".into(),
                invalid: false,
                overlay: String::new(),
            }),
            true,
        );
        assert_eq!(
            installer_image(Some(&with_schematic), "1.7.0"),
            "factory.talos.dev/installer-secureboot/abcd1234:v1.7.0"
        );
    }

    #[test]
    fn invalid_schematic_falls_back_to_the_registry() {
        let invalid = status(
            Some(Schematic {
                id: "abcd1234".into(),
                invalid: true,
                overlay: String::new(),
            }),
            false,
        );
        assert_eq!(
            installer_image(Some(&invalid), "1.7.0"),
            "ghcr.io/siderolabs/installer:v1.7.0"
        );
        assert_eq!(
            installer_image(None, "1.7.0"),
            "ghcr.io/siderolabs/installer:v1.7.0"
        );
    }

    #[test]
    fn merge_is_recursive_for_mappings_and_replaces_scalars() {
        let mut base: Value = serde_yaml::from_str(
            "machine:\n  type: worker\n  kubelet:\n    image: a\ncluster:\n  clusterName: c1\n",
        )
        .unwrap();
        let patch: Value =
            serde_yaml::from_str("machine:\n  kubelet:\n    image: b\n  nodeLabels:\n    aaa: bbb\n")
                .unwrap();
        merge_yaml(&mut base, patch);
        assert_eq!(
            base.get("machine").and_then(|m| m.get("kubelet")).and_then(|k| k.get("image")),
            Some(&Value::from("b"))
        );
        assert_eq!(
            base.get("machine")
                .and_then(|m| m.get("nodeLabels"))
                .and_then(|l| l.get("aaa")),
            Some(&Value::from("bbb"))
        );
        // Untouched subtrees survive.
        assert_eq!(
            base.get("cluster").and_then(|c| c.get("clusterName")),
            Some(&Value::from("c1"))
        );
    }

    #[test]
    fn content_hash_is_stable_hex() {
        let a = content_hash("hello");
        assert_eq!(a.len(), 64);
        assert_eq!(a, content_hash("hello"));
        assert_ne!(a, content_hash("world"));
    }
}
