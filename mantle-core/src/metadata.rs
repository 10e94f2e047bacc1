//! Resource metadata: identity, lifecycle phase, labels and finalizers.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved prefix for system-managed label and annotation keys.
///
/// User-facing mutators must refuse writes under this prefix; see
/// [`Metadata::is_system_key`].
pub const SYSTEM_PREFIX: &str = "mantle.dev/";

/// Well-known label keys used to join resources into their owning scopes.
pub mod label {
    /// The cluster a resource belongs to.
    pub const CLUSTER: &str = "mantle.dev/cluster";
    /// The machine set a resource belongs to.
    pub const MACHINE_SET: &str = "mantle.dev/machine-set";
    /// The cluster machine a resource is bound to.
    pub const CLUSTER_MACHINE: &str = "mantle.dev/cluster-machine";
    /// Present on control-plane machine sets and their machines.
    pub const ROLE_CONTROL_PLANE: &str = "mantle.dev/role-controlplane";
    /// Present on worker machine sets and their machines.
    pub const ROLE_WORKER: &str = "mantle.dev/role-worker";
    /// Present on machines whose updates are locked out.
    pub const LOCKED: &str = "mantle.dev/locked";
}

/// Annotation stamped by the reconciliation engine with the SHA-256
/// fingerprint of the input cut that produced an output.
pub const INPUT_VERSION_ANNOTATION: &str = "mantle.dev/input-version";

/// The default namespace resources live in unless scoped elsewhere.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Lifecycle phase of a resource.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Phase {
    /// The resource is live and accepts spec updates from its owner.
    #[default]
    Running,
    /// Teardown was requested; only finalizer removals are accepted until
    /// the finalizer set drains and the owner destroys the resource.
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => f.write_str("running"),
            Phase::TearingDown => f.write_str("tearingDown"),
        }
    }
}

/// Metadata carried by every resource.
///
/// `version` is strictly increasing per resource lineage and is assigned by
/// the store on every committed write. `owner` names the controller that owns
/// the spec; an empty owner means user-managed.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub namespace: String,
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub phase: Phase,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl Metadata {
    /// Fresh metadata for a new resource in the default namespace.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::namespaced(DEFAULT_NAMESPACE, kind, id)
    }

    /// Fresh metadata scoped to `namespace`.
    pub fn namespaced(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            id: id.into(),
            version: 0,
            owner: String::new(),
            phase: Phase::Running,
            created: now,
            updated: now,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            finalizers: Vec::new(),
        }
    }

    /// Whether `key` lives under the reserved system prefix.
    #[must_use]
    pub fn is_system_key(key: &str) -> bool {
        key.starts_with(SYSTEM_PREFIX)
    }

    #[must_use]
    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.iter().any(|f| f == name)
    }

    /// Adds `name` to the finalizer set; duplicates are ignored.
    pub fn add_finalizer(&mut self, name: &str) {
        if !self.has_finalizer(name) {
            self.finalizers.push(name.to_string());
        }
    }

    /// Removes `name` from the finalizer set, reporting whether it was held.
    pub fn remove_finalizer(&mut self, name: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != name);
        self.finalizers.len() != before
    }

    /// A pointer to this resource.
    #[must_use]
    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            namespace: self.namespace.clone(),
            kind: self.kind.clone(),
            id: self.id.clone(),
        }
    }
}

/// A (namespace, kind, id) pointer identifying a resource lineage.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub namespace: String,
    pub kind: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizer_set_is_deduplicated() {
        let mut meta = Metadata::new("Cluster", "talos-default");
        meta.add_finalizer("a");
        meta.add_finalizer("b");
        meta.add_finalizer("a");
        assert_eq!(meta.finalizers, vec!["a", "b"]);
        assert!(meta.remove_finalizer("a"));
        assert!(!meta.remove_finalizer("a"));
        assert_eq!(meta.finalizers, vec!["b"]);
    }

    #[test]
    fn system_keys_are_detected() {
        assert!(Metadata::is_system_key(label::CLUSTER));
        assert!(!Metadata::is_system_key("app"));
    }
}
