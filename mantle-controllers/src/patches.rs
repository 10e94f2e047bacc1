//! Config patch selection and validation.
use mantle_core::metadata::label;
use mantle_core::specs::cluster::ClusterMachineSpec;
use mantle_core::specs::config::{ClusterMachineConfigPatchesSpec, ConfigPatchSpec};
use mantle_core::{DynamicResource, Phase, Selector, Spec, TypedResource};
use mantle_runtime::{Controller, ControllerError, Input, InputKind, Output, Sharing};
use mantle_store::Store;
use std::fmt;

/// Machine-config fields a patch may never override.
const FORBIDDEN_FIELDS: &[&str] = &[
    "cluster.clusterName",
    "cluster.id",
    "cluster.secret",
    "cluster.token",
    "cluster.controlPlane.endpoint",
    "cluster.aescbcEncryptionSecret",
    "cluster.secretboxEncryptionSecret",
    "cluster.ca",
    "cluster.acceptedCAs",
    "machine.type",
    "machine.token",
    "machine.ca",
    "machine.acceptedCAs",
    "machine.install.extensions",
];

/// The Talos API access allowlist must never gain the admin role.
const API_ACCESS_ROLES_FIELD: &str = "machine.features.kubernetesTalosAPIAccess.allowedRoles";
const ADMIN_ROLE: &str = "os:admin";

/// All violations found in one patch, reported together.
#[derive(Debug)]
pub struct PatchValidationError {
    pub violations: Vec<String>,
}

impl fmt::Display for PatchValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.violations.join("; "))
    }
}

impl std::error::Error for PatchValidationError {}

/// Validates a patch body before acceptance.
///
/// The body must parse as a machine-config document and may neither touch a
/// forbidden field nor add the admin role to the API access allowlist.
pub fn validate_patch(data: &str) -> Result<(), ControllerError> {
    let doc: serde_yaml::Value = serde_yaml::from_str(data)
        .map_err(|err| ControllerError::Invalid(format!("patch is not valid YAML: {err}")))?;
    let mut violations = Vec::new();
    for field in FORBIDDEN_FIELDS {
        if lookup_path(&doc, field).is_some() {
            violations.push(format!("overriding {field:?} is not allowed"));
        }
    }
    if let Some(serde_yaml::Value::Sequence(roles)) = lookup_path(&doc, API_ACCESS_ROLES_FIELD) {
        if roles
            .iter()
            .any(|role| role.as_str() == Some(ADMIN_ROLE))
        {
            violations.push(format!(
                "adding {ADMIN_ROLE:?} to {API_ACCESS_ROLES_FIELD:?} is not allowed"
            ));
        }
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ControllerError::Invalid(
            PatchValidationError { violations }.to_string(),
        ))
    }
}

fn lookup_path<'a>(doc: &'a serde_yaml::Value, path: &str) -> Option<&'a serde_yaml::Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// The ordered patch layers for one cluster machine: cluster-wide first,
/// then machine-set, then machine-scoped; id order within a layer; Running
/// phase only.
pub async fn patches_for(
    store: &Store,
    machine: &TypedResource<ClusterMachineSpec>,
) -> Result<Vec<TypedResource<ConfigPatchSpec>>, ControllerError> {
    let labels = &machine.metadata.labels;
    let Some(cluster) = labels.get(label::CLUSTER) else {
        return Ok(Vec::new());
    };
    let machine_set = labels.get(label::MACHINE_SET);

    let cluster_scoped = store
        .list_as::<ConfigPatchSpec>(&Selector::equal(label::CLUSTER, cluster))
        .await?;
    let mut layered = Vec::new();
    // Cluster layer: cluster label only.
    layered.extend(
        cluster_scoped
            .iter()
            .filter(|p| {
                !p.metadata.labels.contains_key(label::MACHINE_SET)
                    && !p.metadata.labels.contains_key(label::CLUSTER_MACHINE)
            })
            .cloned(),
    );
    if let Some(machine_set) = machine_set {
        layered.extend(
            store
                .list_as::<ConfigPatchSpec>(&Selector::equal(label::MACHINE_SET, machine_set))
                .await?,
        );
    }
    layered.extend(
        store
            .list_as::<ConfigPatchSpec>(&Selector::equal(
                label::CLUSTER_MACHINE,
                &machine.metadata.id,
            ))
            .await?,
    );
    layered.retain(|p| p.metadata.phase == Phase::Running);
    Ok(layered)
}

/// Computes the ordered patch list resource for each cluster machine.
pub struct ClusterMachineConfigPatchesController;

#[async_trait::async_trait]
impl Controller for ClusterMachineConfigPatchesController {
    fn name(&self) -> &'static str {
        "ClusterMachineConfigPatchesController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::kind(ClusterMachineSpec::KIND, InputKind::Strong),
            Input::kind(ConfigPatchSpec::KIND, InputKind::Weak),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output {
            kind: ClusterMachineConfigPatchesSpec::KIND,
            sharing: Sharing::Exclusive,
        }]
    }

    async fn map(
        &self,
        store: &Store,
        input: &DynamicResource,
    ) -> Result<Vec<String>, ControllerError> {
        if input.metadata.kind != ConfigPatchSpec::KIND {
            return Ok(vec![input.metadata.id.clone()]);
        }
        // A patch fans out to every machine in its scope.
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
        let mut valid = Vec::new();
        for patch in patches_for(store, &machine).await? {
            // Patches that fail validation are skipped, not fatal: the bad
            // patch is surfaced where it was created.
            match validate_patch(&patch.spec.data) {
                Ok(()) => valid.push(patch.spec.data),
                Err(err) => {
                    tracing::warn!(patch = %patch.metadata.id, error = %err, "skipping invalid patch");
                }
            }
        }
        let mut output = TypedResource::new(output_id, ClusterMachineConfigPatchesSpec {
            patches: valid,
        });
        output.metadata.labels = machine.metadata.labels.clone();
        Ok(Some(output.into_dynamic()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantle_core::metadata::label;

    #[test]
    fn forbidden_fields_and_admin_role_are_reported_together() {
        let err = validate_patch(
            "cluster:\n  clusterName: foo\nmachine:\n  features:\n    kubernetesTalosAPIAccess:\n      allowedRoles:\n        - os:admin\n",
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("overriding \"cluster.clusterName\" is not allowed"),
            "missing clusterName violation: {message}"
        );
        assert!(
            message.contains("\"os:admin\""),
            "missing admin role violation: {message}"
        );
    }

    #[test]
    fn benign_patches_validate() {
        validate_patch("machine:\n  nodeLabels:\n    aaa: bbb\n").unwrap();
        validate_patch("machine:\n  network:\n    hostname: worker-1\n").unwrap();
    }

    #[test]
    fn malformed_yaml_is_invalid() {
        assert!(validate_patch("machine: [unclosed").is_err());
    }

    #[tokio::test]
    async fn layers_are_cluster_then_set_then_machine_in_id_order() {
        let store = Store::new();
        let mut machine = TypedResource::new("m1", ClusterMachineSpec::default());
        machine
            .metadata
            .labels
            .insert(label::CLUSTER.into(), "c1".into());
        machine
            .metadata
            .labels
            .insert(label::MACHINE_SET.into(), "ms1".into());
        store.create_as(machine.clone()).await.unwrap();

        let patch = |id: &str, labels: &[(&str, &str)]| {
            let mut p = TypedResource::new(id, ConfigPatchSpec {
                data: format!("# {id}"),
            });
            for (k, v) in labels {
                p.metadata.labels.insert((*k).into(), (*v).into());
            }
            p
        };
        // Insertion order scrambled on purpose.
        store
            .create_as(patch("20-machine", &[
                (label::CLUSTER, "c1"),
                (label::CLUSTER_MACHINE, "m1"),
            ]))
            .await
            .unwrap();
        store
            .create_as(patch("10-cluster-b", &[(label::CLUSTER, "c1")]))
            .await
            .unwrap();
        store
            .create_as(patch("00-cluster-a", &[(label::CLUSTER, "c1")]))
            .await
            .unwrap();
        store
            .create_as(patch("15-set", &[
                (label::CLUSTER, "c1"),
                (label::MACHINE_SET, "ms1"),
            ]))
            .await
            .unwrap();
        // Another cluster's patch must not leak in.
        store
            .create_as(patch("99-other", &[(label::CLUSTER, "c2")]))
            .await
            .unwrap();

        let machine = store.get_as::<ClusterMachineSpec>("m1").await.unwrap();
        let ordered: Vec<String> = patches_for(&store, &machine)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.metadata.id)
            .collect();
        assert_eq!(ordered, vec![
            "00-cluster-a",
            "10-cluster-b",
            "15-set",
            "20-machine"
        ]);
    }

    #[tokio::test]
    async fn torn_down_patches_are_excluded() {
        let store = Store::new();
        let mut machine = TypedResource::new("m1", ClusterMachineSpec::default());
        machine
            .metadata
            .labels
            .insert(label::CLUSTER.into(), "c1".into());
        store.create_as(machine).await.unwrap();

        let mut patch = TypedResource::new("p1", ConfigPatchSpec {
            data: "# p1".into(),
        });
        patch
            .metadata
            .labels
            .insert(label::CLUSTER.into(), "c1".into());
        let created = store.create_as(patch).await.unwrap();
        store
            .teardown(&created.metadata.reference(), "")
            .await
            .unwrap();

        let machine = store.get_as::<ClusterMachineSpec>("m1").await.unwrap();
        assert!(patches_for(&store, &machine).await.unwrap().is_empty());
    }
}
