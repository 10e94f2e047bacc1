//! Mantle is a cluster-management service core for fleets of Talos-based
//! machines joined over an encrypted tunnel.
//!
//! The facade re-exports the member crates:
//! - [`core`]: the resource model (metadata, selectors, typed specs)
//! - [`store`]: the versioned, watchable resource store
//! - [`runtime`]: the reconciliation engine and controller contract
//! - [`controllers`]: the behavioral rules
//! - [`logstore`]: the per-machine log pipeline
//! - [`proxy`]: the workload proxy
//! - [`config`]: the service configuration

pub use mantle_core as core;

#[cfg(feature = "store")]
pub use mantle_store as store;

#[cfg(feature = "runtime")]
pub use mantle_runtime as runtime;

#[cfg(feature = "controllers")]
pub use mantle_controllers as controllers;

#[cfg(feature = "logstore")]
pub use mantle_logstore as logstore;

#[cfg(feature = "proxy")]
pub use mantle_proxy as proxy;

#[cfg(feature = "config")]
pub use mantle_config as config;

// The most commonly used types, one level up.
pub use mantle_core::{DynamicResource, Metadata, Phase, ResourceRef, Selector, TypedResource};

#[cfg(feature = "runtime")]
pub use mantle_runtime::{Controller, Engine};

#[cfg(feature = "store")]
pub use mantle_store::Store;
