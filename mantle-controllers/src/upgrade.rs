//! Kubernetes upgrade planning.
//!
//! The planner walks control-plane nodes in name order, upgrading each
//! node's control-plane components in component order before moving on, then
//! rolls kubelets across the fleet. A component on node X is therefore never
//! upgraded before the same component on lexicographically lower nodes has
//! reached the target. Locked workers produce blocked steps; control planes
//! are never blocked.
use mantle_core::metadata::label;
use mantle_core::specs::cluster::ClusterMachineSpec;
use mantle_core::specs::k8s::{KubernetesStatusSpec, KubernetesUpgradeStatusSpec};
use mantle_core::{DynamicResource, Phase, Selector, Spec, TypedResource};
use mantle_runtime::{Controller, ControllerError, Input, InputKind, Output, Sharing};
use mantle_store::Store;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Kubernetes components in upgrade order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Component {
    APIServer,
    ControllerManager,
    Scheduler,
    Kubelet,
}

impl Component {
    /// Control-plane components, in upgrade order.
    pub const CONTROL_PLANE: [Component; 3] = [
        Component::APIServer,
        Component::ControllerManager,
        Component::Scheduler,
    ];

    /// The static pod app name carrying this component, if any.
    #[must_use]
    pub fn static_pod_app(self) -> Option<&'static str> {
        match self {
            Component::APIServer => Some("kube-apiserver"),
            Component::ControllerManager => Some("kube-controller-manager"),
            Component::Scheduler => Some("kube-scheduler"),
            Component::Kubelet => None,
        }
    }

    /// The image reference for this component at `version`.
    #[must_use]
    pub fn image(self, version: &str) -> String {
        match self {
            Component::APIServer => format!("registry.k8s.io/kube-apiserver:v{version}"),
            Component::ControllerManager => {
                format!("registry.k8s.io/kube-controller-manager:v{version}")
            }
            Component::Scheduler => format!("registry.k8s.io/kube-scheduler:v{version}"),
            Component::Kubelet => format!("ghcr.io/siderolabs/kubelet:v{version}"),
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::APIServer => f.write_str("kube-apiserver"),
            Component::ControllerManager => f.write_str("kube-controller-manager"),
            Component::Scheduler => f.write_str("kube-scheduler"),
            Component::Kubelet => f.write_str("kubelet"),
        }
    }
}

/// Partition of a cluster's nodes with the machine-id lookup.
#[derive(Clone, Debug, Default)]
pub struct MachineMap {
    pub control_planes: BTreeMap<String, String>,
    pub workers: BTreeMap<String, String>,
    /// Node names whose updates are locked out.
    pub locked: BTreeSet<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpgradeStep {
    pub machine_id: String,
    pub node: String,
    pub component: Component,
    pub desired_version: String,
    pub blocked: bool,
}

#[derive(Clone, Debug, Default)]
pub struct UpgradePath {
    pub all_components_ready: bool,
    /// Human-readable reason when not ready: missing or not-ready static
    /// pods first, not-ready nodes otherwise.
    pub not_ready_status: String,
    pub steps: Vec<UpgradeStep>,
    /// Image references every node must possess to complete the plan.
    pub all_nodes_to_required_images: BTreeMap<String, BTreeSet<String>>,
}

/// Computes the ordered upgrade plan towards `desired_version`.
#[must_use]
pub fn plan_upgrade(
    machines: &MachineMap,
    status: &KubernetesStatusSpec,
    desired_version: &str,
) -> UpgradePath {
    let mut path = UpgradePath::default();

    let mut missing_pods: Vec<String> = Vec::new();
    let mut not_ready_nodes: Vec<String> = Vec::new();
    for (node, _) in &machines.control_planes {
        for component in Component::CONTROL_PLANE {
            let app = component
                .static_pod_app()
                .unwrap_or_else(|| unreachable!("control-plane components run as static pods"));
            let ready = status
                .static_pods_on(node)
                .and_then(|pods| pods.pods.iter().find(|p| p.app == app))
                .map(|p| p.ready)
                .unwrap_or(false);
            if !ready {
                missing_pods.push(format!("{node}/{app}"));
            }
        }
    }
    for node in machines.control_planes.keys().chain(machines.workers.keys()) {
        // A node absent from the observed status is not ready.
        if !status.node(node).map(|n| n.ready).unwrap_or(false) {
            not_ready_nodes.push(node.clone());
        }
    }
    path.all_components_ready = missing_pods.is_empty() && not_ready_nodes.is_empty();
    if !missing_pods.is_empty() {
        path.not_ready_status = format!("static pods are not ready: {}", missing_pods.join(", "));
    } else if !not_ready_nodes.is_empty() {
        path.not_ready_status = format!("nodes are not ready: {}", not_ready_nodes.join(", "));
    }

    // Control-plane components, node-major so the same component reaches the
    // target on lower nodes first.
    for (node, machine_id) in &machines.control_planes {
        for component in Component::CONTROL_PLANE {
            let app = component
                .static_pod_app()
                .unwrap_or_else(|| unreachable!("control-plane components run as static pods"));
            let observed = status
                .static_pods_on(node)
                .and_then(|pods| pods.pods.iter().find(|p| p.app == app))
                .map(|p| p.version.as_str());
            if observed != Some(desired_version) {
                path.steps.push(UpgradeStep {
                    machine_id: machine_id.clone(),
                    node: node.clone(),
                    component,
                    desired_version: desired_version.to_string(),
                    blocked: false,
                });
            }
        }
    }
    // Kubelets across the fleet, control planes first; locked workers are
    // planned but blocked.
    for (node, machine_id) in machines.control_planes.iter().chain(&machines.workers) {
        let observed = status.node(node).map(|n| n.kubelet_version.as_str());
        if observed != Some(desired_version) {
            let is_worker = machines.workers.contains_key(node);
            path.steps.push(UpgradeStep {
                machine_id: machine_id.clone(),
                node: node.clone(),
                component: Component::Kubelet,
                desired_version: desired_version.to_string(),
                blocked: is_worker && machines.locked.contains(node),
            });
        }
    }

    for node in machines.control_planes.keys() {
        let images = path
            .all_nodes_to_required_images
            .entry(node.clone())
            .or_default();
        images.insert(Component::Kubelet.image(desired_version));
        for component in Component::CONTROL_PLANE {
            images.insert(component.image(desired_version));
        }
        images.insert(format!("registry.k8s.io/kube-proxy:v{desired_version}"));
    }
    for node in machines.workers.keys() {
        path.all_nodes_to_required_images
            .entry(node.clone())
            .or_default()
            .insert(Component::Kubelet.image(desired_version));
    }

    path
}

/// Builds the machine map for a cluster from its cluster machines.
pub async fn machine_map(store: &Store, cluster: &str) -> Result<MachineMap, ControllerError> {
    let machines = store
        .list_as::<ClusterMachineSpec>(&Selector::equal(label::CLUSTER, cluster))
        .await?;
    let mut map = MachineMap::default();
    for machine in machines {
        if machine.metadata.phase != Phase::Running {
            continue;
        }
        let node = machine.metadata.id.clone();
        if machine.metadata.labels.contains_key(label::LOCKED) {
            map.locked.insert(node.clone());
        }
        if machine.metadata.labels.contains_key(label::ROLE_CONTROL_PLANE) {
            map.control_planes.insert(node.clone(), machine.metadata.id);
        } else {
            map.workers.insert(node.clone(), machine.metadata.id);
        }
    }
    Ok(map)
}

/// Maintains the per-cluster upgrade status rollup.
pub struct KubernetesUpgradeStatusController;

#[async_trait::async_trait]
impl Controller for KubernetesUpgradeStatusController {
    fn name(&self) -> &'static str {
        "KubernetesUpgradeStatusController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::kind(mantle_core::specs::cluster::ClusterSpec::KIND, InputKind::Strong),
            Input::kind(KubernetesStatusSpec::KIND, InputKind::Weak),
            Input::kind(ClusterMachineSpec::KIND, InputKind::Weak),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output {
            kind: KubernetesUpgradeStatusSpec::KIND,
            sharing: Sharing::Exclusive,
        }]
    }

    async fn map(
        &self,
        _store: &Store,
        input: &DynamicResource,
    ) -> Result<Vec<String>, ControllerError> {
        if input.metadata.kind == ClusterMachineSpec::KIND {
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
        use mantle_core::specs::cluster::ClusterSpec;
        let cluster = match store.get_as::<ClusterSpec>(output_id).await {
            Ok(cluster) => cluster,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if cluster.metadata.phase == Phase::TearingDown {
            return Ok(None);
        }
        let observed = store
            .get_as::<KubernetesStatusSpec>(output_id)
            .await
            .map(|status| status.spec)
            .unwrap_or_default();
        let machines = machine_map(store, output_id).await?;
        let path = plan_upgrade(&machines, &observed, &cluster.spec.kubernetes_version);

        let status = if path.all_components_ready && path.steps.is_empty() {
            "ready".to_string()
        } else if path.all_components_ready {
            format!("{} steps pending", path.steps.len())
        } else {
            path.not_ready_status.clone()
        };
        let mut output = TypedResource::new(output_id, KubernetesUpgradeStatusSpec {
            current_upgrade_version: cluster.spec.kubernetes_version.clone(),
            last_upgrade_version: String::new(),
            status,
            error: String::new(),
        });
        output
            .metadata
            .labels
            .insert(label::CLUSTER.into(), output_id.into());
        Ok(Some(output.into_dynamic()?))
    }
}
