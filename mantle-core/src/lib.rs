//! Core resource model shared by the mantle store, runtime and controllers.
//!
//! A resource is identified by (namespace, kind, id) and couples
//! [`Metadata`](metadata::Metadata) with a typed spec payload. This crate
//! defines the metadata vocabulary, the label-selection terms and the spec
//! types for every resource family; it has no opinion on storage or
//! scheduling.

pub mod labels;
pub mod metadata;
pub mod resource;
pub mod specs;

pub use labels::{Selector, Term};
pub use metadata::{Metadata, Phase, ResourceRef};
pub use resource::{DynamicResource, HasMetadata, Spec, TypedResource};

use thiserror::Error;

/// Conversion failures between the typed and dynamic representations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to serialize {kind} spec")]
    SpecSerialize {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to deserialize {kind} spec")]
    SpecDeserialize {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: &'static str, found: String },
}
