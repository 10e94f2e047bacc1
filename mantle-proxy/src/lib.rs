//! Workload proxy: dispatches external HTTP onto per-cluster load-balanced
//! upstream pools, gated by a signed-cookie access check.
//!
//! The [`Reconciler`] keeps one [`LoadBalancer`] per (cluster, alias) in
//! sync with the desired upstream map; the [`WorkloadProxy`] handler matches
//! workload host patterns, validates the caller's key cookies against the
//! access policy, and forwards granted requests to an address picked from
//! the best latency tier.

mod auth;
mod dialer;
mod error;
mod handler;
mod lb;
mod reconciler;
mod redirect;

pub use auth::{
    Access, AccessPolicy, KeyProvider, RegisteredKey, Role, PUBLIC_KEY_ID_COOKIE,
    PUBLIC_KEY_SIGNATURE_COOKIE,
};
pub use error::{Error, Result};
pub use handler::{Handled, ProxyBody, ProxyConfig, WorkloadProxy};
pub use lb::{HealthConfig, LoadBalancer};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use redirect::RedirectSigner;
