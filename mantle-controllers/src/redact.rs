//! Redacted machine configs and their audit diff trail.
use mantle_core::metadata::label;
use mantle_core::specs::config::{
    ClusterMachineConfigSpec, MachineConfigDiffSpec, RedactedClusterMachineConfigSpec,
};
use mantle_core::{DynamicResource, Phase, ResourceRef, Selector, Spec, TypedResource};
use mantle_runtime::{Controller, ControllerError, Input, InputKind, Output, Sharing};
use mantle_store::Store;
use parking_lot::Mutex;
use serde_yaml::Value;
use similar::TextDiff;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Placeholder written over every secret leaf.
pub const REDACTED: &str = "******";

/// Dot paths of the fixed secret leaves.
const SECRET_PATHS: &[&str] = &[
    "machine.token",
    "machine.ca.key",
    "cluster.token",
    "cluster.secret",
    "cluster.aescbcEncryptionSecret",
    "cluster.secretboxEncryptionSecret",
    "cluster.ca.key",
    "cluster.aggregatorCA.key",
    "cluster.serviceAccount.key",
    "cluster.etcd.ca.key",
];

/// Replaces every secret leaf of a machine config with [`REDACTED`].
///
/// Besides the fixed path list, any mapping shaped like a certificate bundle
/// (a `crt` next to a `key`) has its `key` redacted, wherever it sits.
pub fn redact_config(data: &str) -> Result<String, ControllerError> {
    let mut doc: Value = serde_yaml::from_str(data)
        .map_err(|err| ControllerError::Invalid(format!("config is not valid YAML: {err}")))?;
    for path in SECRET_PATHS {
        redact_path(&mut doc, path);
    }
    redact_cert_bundles(&mut doc);
    serde_yaml::to_string(&doc)
        .map_err(|err| ControllerError::Invalid(format!("failed to serialize config: {err}")))
}

fn redact_path(doc: &mut Value, path: &str) {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            if let Some(slot) = current.get_mut(part) {
                *slot = Value::from(REDACTED);
            }
            return;
        }
        match current.get_mut(part) {
            Some(next) => current = next,
            None => return,
        }
    }
}

fn redact_cert_bundles(value: &mut Value) {
    if value.get("crt").is_some() && value.get("key").is_some() {
        if let Some(slot) = value.get_mut("key") {
            *slot = Value::from(REDACTED);
        }
    }
    match value {
        Value::Mapping(map) => {
            for (_, child) in map.iter_mut() {
                redact_cert_bundles(child);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                redact_cert_bundles(item);
            }
        }
        _ => {}
    }
}

/// Unified diff between two redacted configs.
#[must_use]
pub fn unified_diff(old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .to_string()
}

/// Projects every `ClusterMachineConfig` into its redacted copy.
pub struct RedactedConfigController;

#[async_trait::async_trait]
impl Controller for RedactedConfigController {
    fn name(&self) -> &'static str {
        "RedactedConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::kind(ClusterMachineConfigSpec::KIND, InputKind::Strong)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output {
            kind: RedactedClusterMachineConfigSpec::KIND,
            sharing: Sharing::Exclusive,
        }]
    }

    async fn transform(
        &self,
        store: &Store,
        output_id: &str,
    ) -> Result<Option<DynamicResource>, ControllerError> {
        let config = match store.get_as::<ClusterMachineConfigSpec>(output_id).await {
            Ok(config) => config,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if config.metadata.phase == Phase::TearingDown || config.spec.data.is_empty() {
            return Ok(None);
        }
        let redacted = redact_config(&config.spec.data)?;
        let mut output = TypedResource::new(output_id, RedactedClusterMachineConfigSpec {
            data: redacted,
        });
        output.metadata.labels = config.metadata.labels.clone();
        Ok(Some(output.into_dynamic()?))
    }
}

/// Retention knobs for the diff trail.
#[derive(Clone, Debug)]
pub struct DiffRetention {
    pub max_age: chrono::Duration,
    pub max_count: usize,
    pub interval: Duration,
}

impl Default for DiffRetention {
    fn default() -> Self {
        Self {
            max_age: chrono::Duration::days(30),
            max_count: 100,
            interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Emits a `MachineConfigDiff` whenever a machine's redacted config changes
/// and prunes the trail by age and per-machine count.
///
/// Diff resources are written directly (many per machine, ids prefixed with
/// the machine id), so this runs as a side-effect controller.
pub struct MachineConfigDiffController {
    retention: DiffRetention,
    previous: Mutex<HashMap<String, String>>,
    sequence: Mutex<HashMap<String, u64>>,
    cleanup_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl MachineConfigDiffController {
    #[must_use]
    pub fn new(retention: DiffRetention) -> Self {
        Self {
            retention,
            previous: Mutex::new(HashMap::new()),
            sequence: Mutex::new(HashMap::new()),
            cleanup_rx: Mutex::new(None),
        }
    }

    /// Injects the cleanup trigger channel; each message forces a sweep,
    /// which tests use instead of waiting out the timer.
    #[must_use]
    pub fn with_cleanup_channel(self, rx: mpsc::Receiver<()>) -> Self {
        *self.cleanup_rx.lock() = Some(rx);
        self
    }

    pub const NAME: &'static str = "MachineConfigDiffController";

    /// Runs the retention loop until cancelled. Driven by the timer tick and
    /// by the injected cleanup channel.
    pub fn spawn_retention(
        &self,
        store: Store,
        ct: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let retention = self.retention.clone();
        let mut cleanup_rx = self.cleanup_rx.lock().take();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retention.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                let mut channel_closed = false;
                if let Some(rx) = cleanup_rx.as_mut() {
                    tokio::select! {
                        () = ct.cancelled() => break,
                        _ = ticker.tick() => {}
                        message = rx.recv() => {
                            if message.is_none() {
                                channel_closed = true;
                            }
                        }
                    }
                } else {
                    tokio::select! {
                        () = ct.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                }
                if channel_closed {
                    cleanup_rx = None;
                    continue;
                }
                if let Err(err) = sweep(&store, &retention).await {
                    warn!(error = %err, "diff retention sweep failed");
                }
            }
        })
    }

    async fn emit_diff(
        &self,
        store: &Store,
        machine: &str,
        old: &str,
        new: &str,
        labels: &std::collections::BTreeMap<String, String>,
    ) -> Result<(), ControllerError> {
        let diff = unified_diff(old, new);
        if diff.is_empty() {
            return Ok(());
        }
        let sequence = {
            let mut sequences = self.sequence.lock();
            let next = sequences.entry(machine.to_string()).or_insert(0);
            *next += 1;
            *next
        };
        let mut resource = TypedResource::new(
            format!("{machine}-{sequence:08}"),
            MachineConfigDiffSpec { diff },
        );
        resource.metadata.owner = Self::NAME.to_string();
        resource.metadata.labels = labels.clone();
        resource
            .metadata
            .labels
            .insert(label::CLUSTER_MACHINE.to_string(), machine.to_string());
        match store.create(resource.into_dynamic()?).await {
            Ok(_) => Ok(()),
            // A replayed transform may race its own earlier write.
            Err(err) if matches!(err, mantle_store::Error::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait::async_trait]
impl Controller for MachineConfigDiffController {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::kind(
            RedactedClusterMachineConfigSpec::KIND,
            InputKind::Weak,
        )]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn transform(
        &self,
        store: &Store,
        output_id: &str,
    ) -> Result<Option<DynamicResource>, ControllerError> {
        let redacted = match store
            .get_as::<RedactedClusterMachineConfigSpec>(output_id)
            .await
        {
            Ok(redacted) => redacted,
            Err(err) if err.is_not_found() => {
                self.previous.lock().remove(output_id);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let old = self
            .previous
            .lock()
            .get(output_id)
            .cloned()
            .unwrap_or_default();
        if old == redacted.spec.data {
            return Ok(None);
        }
        self.emit_diff(
            store,
            output_id,
            &old,
            &redacted.spec.data,
            &redacted.metadata.labels,
        )
        .await?;
        self.previous
            .lock()
            .insert(output_id.to_string(), redacted.spec.data);
        Ok(None)
    }
}

/// One retention pass: age-based sweep plus the per-machine count cap.
async fn sweep(store: &Store, retention: &DiffRetention) -> Result<(), ControllerError> {
    let diffs = store
        .list_as::<MachineConfigDiffSpec>(&Selector::all())
        .await?;
    let now = chrono::Utc::now();
    let mut by_machine: HashMap<String, Vec<ResourceRef>> = HashMap::new();
    let mut doomed: Vec<ResourceRef> = Vec::new();
    for diff in diffs {
        if now - diff.metadata.created > retention.max_age {
            doomed.push(diff.metadata.reference());
            continue;
        }
        let machine = diff
            .metadata
            .labels
            .get(label::CLUSTER_MACHINE)
            .cloned()
            .unwrap_or_default();
        by_machine.entry(machine).or_default().push(diff.metadata.reference());
    }
    for (_, mut refs) in by_machine {
        // Ids are sequence-ordered, so the newest sort last.
        refs.sort();
        if refs.len() > retention.max_count {
            let cut = refs.len() - retention.max_count;
            doomed.extend(refs.into_iter().take(cut));
        }
    }
    for reference in doomed {
        debug!(resource = %reference, "pruning config diff");
        if store.teardown(&reference, MachineConfigDiffController::NAME).await? {
            store
                .destroy(&reference, MachineConfigDiffController::NAME)
                .await?;
        }
    }
    Ok(())
}
