//! Projects exposed services into the workload-proxy reconciler.
use async_trait::async_trait;
use mantle_core::metadata::label;
use mantle_core::specs::cluster::ClusterSpec;
use mantle_core::specs::proxy::ExposedServiceSpec;
use mantle_core::{DynamicResource, Phase, Selector, Spec};
use mantle_proxy::Reconciler;
use mantle_runtime::{Controller, ControllerError, Input, InputKind, Output};
use mantle_store::Store;
use std::collections::BTreeMap;

/// Feeds the proxy reconciler with each cluster's alias → upstreams map and
/// removes the cluster's balancers when it goes away or stops exposing.
pub struct WorkloadProxySyncController {
    reconciler: Reconciler,
}

impl WorkloadProxySyncController {
    #[must_use]
    pub fn new(reconciler: Reconciler) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl Controller for WorkloadProxySyncController {
    fn name(&self) -> &'static str {
        "WorkloadProxySyncController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::kind(ClusterSpec::KIND, InputKind::Weak),
            Input::kind(ExposedServiceSpec::KIND, InputKind::Weak),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn map(
        &self,
        _store: &Store,
        input: &DynamicResource,
    ) -> Result<Vec<String>, ControllerError> {
        if input.metadata.kind == ExposedServiceSpec::KIND {
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
        let enabled = match store.get_as::<ClusterSpec>(output_id).await {
            Ok(cluster) => {
                cluster.metadata.phase == Phase::Running
                    && cluster.spec.features.enable_workload_proxy
            }
            Err(err) if err.is_not_found() => false,
            Err(err) => return Err(err.into()),
        };
        if !enabled {
            self.reconciler.remove_cluster(output_id);
            return Ok(None);
        }
        let services = store
            .list_as::<ExposedServiceSpec>(&Selector::equal(label::CLUSTER, output_id))
            .await?;
        let mut upstreams: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for service in services {
            if service.metadata.phase != Phase::Running {
                continue;
            }
            upstreams.insert(service.spec.alias.clone(), service.spec.upstream_addresses);
        }
        self.reconciler.reconcile(output_id, &upstreams);
        Ok(None)
    }
}
