//! Controller pipelines driven through the reconciliation engine.
use mantle_controllers::{
    ClusterMachineConfigPatchesController, DiffRetention, MachineConfigController,
    MachineConfigDiffController, MachineSetController, RedactedConfigController,
};
use mantle_core::metadata::label;
use mantle_core::specs::cluster::{ClusterSpec, MachineSetRole, MachineSetSpec};
use mantle_core::specs::config::{
    ClusterMachineConfigSpec, ConfigPatchSpec, MachineConfigDiffSpec,
    RedactedClusterMachineConfigSpec,
};
use mantle_core::specs::join::ConnectionParamsSpec;
use mantle_core::specs::machine::MachineStatusSpec;
use mantle_core::{Selector, TypedResource};
use mantle_runtime::Engine;
use mantle_store::Store;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SEED_CONFIG: &str = "\
version: v1alpha1
machine:
  type: controlplane
  ca:
    crt: LS0tLS1DRVJU
    key: LS0tLS1LRVk=
cluster:
  clusterName: c1
";

async fn eventually<F, Fut, T>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(found) = probe().await {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

#[tokio::test(start_paused = true)]
async fn redacted_diff_pipeline_emits_prefixed_diffs() {
    let store = Store::new();
    let ct = CancellationToken::new();
    let mut engine = Engine::new(store.clone());
    engine.register(RedactedConfigController);
    engine.register(MachineConfigDiffController::new(DiffRetention::default()));
    tokio::spawn(engine.run(ct.clone()));

    let seeded = store
        .create_as(TypedResource::new("m1", ClusterMachineConfigSpec {
            data: SEED_CONFIG.to_string(),
            content_hash: String::new(),
            generation_error: String::new(),
        }))
        .await
        .unwrap();
    let reference = seeded.metadata.reference();

    // The redacted projection hides the CA key.
    let redacted = eventually(|| {
        let store = store.clone();
        async move {
            store
                .get_as::<RedactedClusterMachineConfigSpec>("m1")
                .await
                .ok()
        }
    })
    .await;
    let doc: serde_yaml::Value = serde_yaml::from_str(&redacted.spec.data).unwrap();
    assert_eq!(
        doc.get("machine")
            .and_then(|m| m.get("ca"))
            .and_then(|ca| ca.get("key"))
            .and_then(|k| k.as_str()),
        Some("******")
    );
    assert!(!redacted.spec.data.contains("LS0tLS1LRVk="));

    // First diff covers the initial config.
    eventually(|| {
        let store = store.clone();
        async move {
            let diffs = store
                .list_as::<MachineConfigDiffSpec>(&Selector::all())
                .await
                .unwrap();
            (!diffs.is_empty()).then_some(())
        }
    })
    .await;

    // A node-label addition produces a second, machine-prefixed diff with
    // the added line.
    let mut doc: serde_yaml::Value = serde_yaml::from_str(SEED_CONFIG).unwrap();
    let labels: serde_yaml::Value = serde_yaml::from_str("nodeLabels:\n  aaa: bbb\n").unwrap();
    mantle_controllers::merge_yaml(doc.get_mut("machine").unwrap(), labels);
    // The engine stamps its finalizer on the config; wait for it so the
    // version we update against is settled.
    let current = eventually(|| {
        let store = store.clone();
        let reference = reference.clone();
        async move {
            store
                .get(&reference)
                .await
                .ok()
                .filter(|c| c.metadata.has_finalizer("RedactedConfigController"))
        }
    })
    .await;
    let mut next = current.clone();
    next.spec = serde_json::to_value(ClusterMachineConfigSpec {
        data: serde_yaml::to_string(&doc).unwrap(),
        content_hash: String::new(),
        generation_error: String::new(),
    })
    .unwrap();
    store
        .update("", next, current.metadata.version)
        .await
        .unwrap();

    let diffs = eventually(|| {
        let store = store.clone();
        async move {
            let diffs = store
                .list_as::<MachineConfigDiffSpec>(&Selector::all())
                .await
                .unwrap();
            (diffs.len() >= 2).then_some(diffs)
        }
    })
    .await;
    for diff in &diffs {
        assert!(diff.metadata.id.starts_with("m1-"), "id {}", diff.metadata.id);
        assert_eq!(
            diff.metadata.labels.get(label::CLUSTER_MACHINE),
            Some(&"m1".to_string())
        );
    }
    let last = diffs.last().unwrap();
    assert!(
        last.spec
            .diff
            .lines()
            .any(|line| line.starts_with('+') && line.contains("aaa: bbb")),
        "diff:\n{}",
        last.spec.diff
    );
    // Secrets never reach the diff trail.
    assert!(!last.spec.diff.contains("LS0tLS1LRVk="));
    ct.cancel();
}

#[tokio::test(start_paused = true)]
async fn diff_retention_enforces_the_count_cap_via_the_cleanup_channel() {
    let store = Store::new();
    let ct = CancellationToken::new();
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    let controller = MachineConfigDiffController::new(DiffRetention {
        max_count: 1,
        ..DiffRetention::default()
    })
    .with_cleanup_channel(rx);
    controller.spawn_retention(store.clone(), ct.clone());

    let mut engine = Engine::new(store.clone());
    engine.register(RedactedConfigController);
    engine.register(controller);
    tokio::spawn(engine.run(ct.clone()));

    let seeded = store
        .create_as(TypedResource::new("m1", ClusterMachineConfigSpec {
            data: SEED_CONFIG.to_string(),
            ..ClusterMachineConfigSpec::default()
        }))
        .await
        .unwrap();
    let reference = seeded.metadata.reference();
    eventually(|| {
        let store = store.clone();
        async move {
            let diffs = store
                .list_as::<MachineConfigDiffSpec>(&Selector::all())
                .await
                .unwrap();
            (!diffs.is_empty()).then_some(())
        }
    })
    .await;

    let current = eventually(|| {
        let store = store.clone();
        let reference = reference.clone();
        async move {
            store
                .get(&reference)
                .await
                .ok()
                .filter(|c| c.metadata.has_finalizer("RedactedConfigController"))
        }
    })
    .await;
    let mut next = current.clone();
    next.spec["data"] = format!("{SEED_CONFIG}  token: secret\n").into();
    store
        .update("", next, current.metadata.version)
        .await
        .unwrap();
    eventually(|| {
        let store = store.clone();
        async move {
            let diffs = store
                .list_as::<MachineConfigDiffSpec>(&Selector::all())
                .await
                .unwrap();
            (diffs.len() >= 2).then_some(())
        }
    })
    .await;

    tx.send(()).await.unwrap();
    eventually(|| {
        let store = store.clone();
        async move {
            let diffs = store
                .list_as::<MachineConfigDiffSpec>(&Selector::all())
                .await
                .unwrap();
            (diffs.len() == 1).then_some(())
        }
    })
    .await;
    ct.cancel();
}

#[tokio::test(start_paused = true)]
async fn allocation_chain_renders_a_machine_config() {
    let store = Store::new();
    let ct = CancellationToken::new();
    let mut engine = Engine::new(store.clone());
    engine.register(MachineSetController);
    engine.register(ClusterMachineConfigPatchesController);
    engine.register(MachineConfigController);
    tokio::spawn(engine.run(ct.clone()));

    store
        .create_as(TypedResource::new("c1", ClusterSpec {
            kubernetes_version: "1.29.3".into(),
            talos_version: "1.7.0".into(),
            ..ClusterSpec::default()
        }))
        .await
        .unwrap();
    store
        .create_as(TypedResource::new("default", ConnectionParamsSpec {
            api_endpoint: "https://mantle.example.org:8100".into(),
            ..ConnectionParamsSpec::default()
        }))
        .await
        .unwrap();
    store
        .create_as(TypedResource::new("ms1", MachineSetSpec {
            cluster: "c1".into(),
            role: MachineSetRole::ControlPlane,
            machine_selector: Selector::equal("pool", "alpha"),
            locked: false,
        }))
        .await
        .unwrap();
    let mut patch = TypedResource::new("base-labels", ConfigPatchSpec {
        data: "machine:\n  nodeLabels:\n    tier: gold\n".into(),
    });
    patch
        .metadata
        .labels
        .insert(label::CLUSTER.into(), "c1".into());
    store.create_as(patch).await.unwrap();

    let mut machine = TypedResource::new("m1", MachineStatusSpec {
        connected: true,
        talos_version: "1.7.0".into(),
        ..MachineStatusSpec::default()
    });
    machine.metadata.labels.insert("pool".into(), "alpha".into());
    store.create_as(machine).await.unwrap();

    let config = eventually(|| {
        let store = store.clone();
        async move {
            store
                .get_as::<ClusterMachineConfigSpec>("m1")
                .await
                .ok()
                .filter(|c| !c.spec.data.is_empty())
        }
    })
    .await;
    assert!(config.spec.generation_error.is_empty());
    assert_eq!(config.spec.content_hash.len(), 64);

    let doc: serde_yaml::Value = serde_yaml::from_str(&config.spec.data).unwrap();
    assert_eq!(
        doc.get("machine").and_then(|m| m.get("type")).and_then(|t| t.as_str()),
        Some("controlplane")
    );
    assert_eq!(
        doc.get("cluster")
            .and_then(|c| c.get("clusterName"))
            .and_then(|n| n.as_str()),
        Some("c1")
    );
    assert_eq!(
        doc.get("machine")
            .and_then(|m| m.get("install"))
            .and_then(|i| i.get("image"))
            .and_then(|i| i.as_str()),
        Some("ghcr.io/siderolabs/installer:v1.7.0")
    );
    // The cluster-scoped patch landed.
    assert_eq!(
        doc.get("machine")
            .and_then(|m| m.get("nodeLabels"))
            .and_then(|l| l.get("tier"))
            .and_then(|t| t.as_str()),
        Some("gold")
    );
    ct.cancel();
}
