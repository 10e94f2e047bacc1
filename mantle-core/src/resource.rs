//! Resource traits and the typed/dynamic representations that flow through
//! the store.
//!
//! A resource is a [`Metadata`] plus a typed spec payload. Controllers and
//! the store move [`DynamicResource`]s (spec as JSON value); typed access is
//! a lossless conversion gated on the kind name.
use crate::metadata::Metadata;
use crate::Error;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

/// Access to the metadata of any resource representation.
pub trait HasMetadata {
    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;
}

/// A typed spec payload with a registered kind name.
pub trait Spec:
    Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The kind under which resources of this spec are stored.
    const KIND: &'static str;
}

/// A resource with a statically-typed spec.
#[derive(Clone, Debug, PartialEq)]
pub struct TypedResource<S: Spec> {
    pub metadata: Metadata,
    pub spec: S,
}

impl<S: Spec> TypedResource<S> {
    /// A new resource with fresh metadata in the default namespace.
    pub fn new(id: impl Into<String>, spec: S) -> Self {
        Self {
            metadata: Metadata::new(S::KIND, id),
            spec,
        }
    }

    /// Converts into the dynamic representation used by the store.
    ///
    /// Spec serialization cannot fail for well-formed [`Spec`] types, but the
    /// error is propagated rather than swallowed.
    pub fn into_dynamic(self) -> Result<DynamicResource, Error> {
        let spec = serde_json::to_value(&self.spec).map_err(|source| Error::SpecSerialize {
            kind: S::KIND,
            source,
        })?;
        Ok(DynamicResource {
            metadata: self.metadata,
            spec,
        })
    }
}

impl<S: Spec> HasMetadata for TypedResource<S> {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// The kind-erased resource representation stored and watched.
#[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
pub struct DynamicResource {
    pub metadata: Metadata,
    pub spec: serde_json::Value,
}

impl DynamicResource {
    /// Reinterprets the spec as `S`, failing on kind mismatch or shape drift.
    pub fn to_typed<S: Spec>(&self) -> Result<TypedResource<S>, Error> {
        if self.metadata.kind != S::KIND {
            return Err(Error::KindMismatch {
                expected: S::KIND,
                found: self.metadata.kind.clone(),
            });
        }
        let spec =
            serde_json::from_value(self.spec.clone()).map_err(|source| Error::SpecDeserialize {
                kind: S::KIND,
                source,
            })?;
        Ok(TypedResource {
            metadata: self.metadata.clone(),
            spec,
        })
    }
}

impl HasMetadata for DynamicResource {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl<S: Spec> From<TypedResource<S>> for DynamicResource {
    fn from(typed: TypedResource<S>) -> Self {
        let spec = serde_json::to_value(&typed.spec)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
        DynamicResource {
            metadata: typed.metadata,
            spec,
        }
    }
}
