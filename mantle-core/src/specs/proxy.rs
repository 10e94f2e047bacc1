//! Workload-proxy projections.
use crate::resource::Spec;
use serde::{Deserialize, Serialize};

/// An in-cluster service exposed through the workload proxy under a
/// cluster-scoped alias. Labeled with the owning cluster.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExposedServiceSpec {
    pub alias: String,
    #[serde(default)]
    pub upstream_addresses: Vec<String>,
    /// Human-facing name shown in service listings.
    #[serde(default)]
    pub label: String,
}

impl Spec for ExposedServiceSpec {
    const KIND: &'static str = "ExposedService";
}
