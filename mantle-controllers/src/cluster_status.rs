//! Cluster readiness rollup.
use mantle_core::metadata::label;
use mantle_core::specs::cluster::{ClusterMachineStatusSpec, ClusterSpec, ClusterStatusSpec};
use mantle_core::{DynamicResource, Phase, Selector, Spec, TypedResource};
use mantle_runtime::{Controller, ControllerError, Input, InputKind, Output, Sharing};
use mantle_store::Store;

/// Rolls per-machine statuses up into one `ClusterStatus` per cluster.
pub struct ClusterStatusController;

#[async_trait::async_trait]
impl Controller for ClusterStatusController {
    fn name(&self) -> &'static str {
        "ClusterStatusController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::kind(ClusterSpec::KIND, InputKind::Strong),
            Input::kind(ClusterMachineStatusSpec::KIND, InputKind::Weak),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output {
            kind: ClusterStatusSpec::KIND,
            sharing: Sharing::Exclusive,
        }]
    }

    async fn map(
        &self,
        _store: &Store,
        input: &DynamicResource,
    ) -> Result<Vec<String>, ControllerError> {
        if input.metadata.kind == ClusterMachineStatusSpec::KIND {
            return Ok(input
                .metadata
                .labels
                .get(label::CLUSTER)
                .map(|cluster| vec![cluster.clone()])
                .unwrap_or_default());
        }
        Ok(vec![input.metadata.id.clone()])
    }

    async fn transform(
        &self,
        store: &Store,
        output_id: &str,
    ) -> Result<Option<DynamicResource>, ControllerError> {
        let cluster = match store.get_as::<ClusterSpec>(output_id).await {
            Ok(cluster) => cluster,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if cluster.metadata.phase == Phase::TearingDown {
            return Ok(None);
        }
        let statuses = store
            .list_as::<ClusterMachineStatusSpec>(&Selector::equal(label::CLUSTER, output_id))
            .await?;
        let machines = statuses.len() as u32;
        let ready_machines = statuses.iter().filter(|s| s.spec.ready).count() as u32;
        let ready = machines > 0 && ready_machines == machines;
        let mut output = TypedResource::new(output_id, ClusterStatusSpec {
            machines,
            ready_machines,
            ready,
            phase: if ready {
                "running".to_string()
            } else if machines == 0 {
                "scaling up".to_string()
            } else {
                "not ready".to_string()
            },
        });
        output
            .metadata
            .labels
            .insert(label::CLUSTER.to_string(), output_id.to_string());
        Ok(Some(output.into_dynamic()?))
    }
}
