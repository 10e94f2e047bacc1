//! Machine-set allocation: derives cluster machines from machine sets.
use mantle_core::metadata::label;
use mantle_core::specs::cluster::{ClusterMachineSpec, MachineSetRole, MachineSetSpec};
use mantle_core::specs::machine::MachineStatusSpec;
use mantle_core::{DynamicResource, Phase, Selector, Spec, TypedResource};
use mantle_runtime::{Controller, ControllerError, Input, InputKind, Output, Sharing};
use mantle_store::Store;

/// Allocates machines into machine sets by label selection, producing one
/// `ClusterMachine` per allocated machine. Children inherit the cluster and
/// machine-set labels, so a parent label change re-syncs them on the next
/// recompute.
pub struct MachineSetController;

#[async_trait::async_trait]
impl Controller for MachineSetController {
    fn name(&self) -> &'static str {
        "MachineSetController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::kind(MachineSetSpec::KIND, InputKind::Strong),
            Input::kind(MachineStatusSpec::KIND, InputKind::Weak),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output {
            kind: ClusterMachineSpec::KIND,
            sharing: Sharing::Exclusive,
        }]
    }

    async fn map(
        &self,
        store: &Store,
        input: &DynamicResource,
    ) -> Result<Vec<String>, ControllerError> {
        if input.metadata.kind != MachineSetSpec::KIND {
            return Ok(vec![input.metadata.id.clone()]);
        }
        let set = input.to_typed::<MachineSetSpec>()?;
        let machines = store
            .list_as::<MachineStatusSpec>(&set.spec.machine_selector)
            .await?;
        Ok(machines.into_iter().map(|m| m.metadata.id).collect())
    }

    async fn transform(
        &self,
        store: &Store,
        output_id: &str,
    ) -> Result<Option<DynamicResource>, ControllerError> {
        let status = match store.get_as::<MachineStatusSpec>(output_id).await {
            Ok(status) => status,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if status.metadata.phase == Phase::TearingDown {
            return Ok(None);
        }
        // First matching set in id order wins the machine.
        let sets = store.list_as::<MachineSetSpec>(&Selector::all()).await?;
        let Some(set) = sets.into_iter().find(|set| {
            set.metadata.phase == Phase::Running
                && !set.spec.machine_selector.selects_all()
                && set.spec.machine_selector.matches(&status.metadata.labels)
        }) else {
            return Ok(None);
        };

        let mut machine = TypedResource::new(output_id, ClusterMachineSpec::default());
        let labels = &mut machine.metadata.labels;
        labels.insert(label::CLUSTER.to_string(), set.spec.cluster.clone());
        labels.insert(label::MACHINE_SET.to_string(), set.metadata.id.clone());
        match set.spec.role {
            MachineSetRole::ControlPlane => {
                labels.insert(label::ROLE_CONTROL_PLANE.to_string(), String::new());
            }
            MachineSetRole::Worker => {
                labels.insert(label::ROLE_WORKER.to_string(), String::new());
            }
        }
        if set.spec.locked {
            labels.insert(label::LOCKED.to_string(), String::new());
        }
        Ok(Some(machine.into_dynamic()?))
    }
}
