//! The controller contract: declared inputs and outputs, the transform
//! function and error classification.
use async_trait::async_trait;
use mantle_core::metadata::DEFAULT_NAMESPACE;
use mantle_core::{DynamicResource, Selector};
use mantle_store::Store;
use thiserror::Error;

/// How an input binds to the controller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InputKind {
    /// Changes trigger recomputation.
    Weak,
    /// Like `Weak`, and additionally the controller's finalizer blocks the
    /// input from being destroyed until the controller has cleaned up.
    Strong,
    /// Fires only once the input is tearing down with no finalizers left.
    DestroyReady,
}

/// An input declaration: a slice of the store the controller reacts to.
#[derive(Clone, Debug)]
pub struct Input {
    pub namespace: String,
    pub kind: &'static str,
    pub selector: Selector,
    pub input_kind: InputKind,
}

impl Input {
    /// A default-namespace input over all resources of a kind.
    #[must_use]
    pub fn kind(kind: &'static str, input_kind: InputKind) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            kind,
            selector: Selector::all(),
            input_kind,
        }
    }

    #[must_use]
    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }
}

/// Whether output instances are owned exclusively by this controller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Sharing {
    /// Only this controller may own instances of the output kind.
    Exclusive,
    /// Other controllers may own sibling instances.
    Shared,
}

/// An output declaration.
#[derive(Clone, Debug)]
pub struct Output {
    pub kind: &'static str,
    pub sharing: Sharing,
}

/// Errors returned by controller transforms, classified per retry policy.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Network/DB/filesystem trouble; retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Schema or policy violation; surfaced, never retried.
    #[error("invalid: {0}")]
    Invalid(String),

    /// An invariant was violated; processing of this output id stops.
    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    /// Context cancellation; not a failure, no backoff penalty.
    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    Store(#[from] mantle_store::Error),

    #[error(transparent)]
    Conversion(#[from] mantle_core::Error),
}

impl ControllerError {
    /// Whether the engine should retry with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Transient(_) => true,
            // Reads race with concurrent writers; the re-run will observe
            // the settled state.
            ControllerError::Store(err) => err.is_conflict() || err.is_not_found(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, ControllerError::Canceled)
    }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

/// A reconciliation rule: derives owned outputs from declared inputs.
///
/// `transform` is invoked once per dirty output id, serialized per id; it
/// reads whatever inputs it needs from the store and returns the desired
/// output resource (or `None` when the output should not exist). The engine
/// owns the write: it stamps ownership and the input-version fingerprint and
/// skips the write entirely when nothing changed.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Unique controller name; used as owner of outputs and as the
    /// finalizer placed on `Strong` inputs.
    fn name(&self) -> &'static str;

    fn inputs(&self) -> Vec<Input>;

    /// Output declarations. The first entry is the transform target; an
    /// empty list makes this a side-effect controller whose transform
    /// return value is ignored.
    fn outputs(&self) -> Vec<Output>;

    /// Maps an input resource to the output ids it affects. The default is
    /// the identity mapping; many-to-one controllers override this, reading
    /// whatever join state they need from the store.
    async fn map(&self, store: &Store, input: &DynamicResource) -> Result<Vec<String>> {
        let _ = store;
        Ok(vec![input.metadata.id.clone()])
    }

    /// Recomputes the output for `output_id` from current store state.
    async fn transform(&self, store: &Store, output_id: &str) -> Result<Option<DynamicResource>>;

    /// Cleanup hook invoked while a `Strong` input tears down, before the
    /// engine clears the controller's finalizer from it.
    async fn finalize(&self, store: &Store, input: &DynamicResource) -> Result<()> {
        let _ = (store, input);
        Ok(())
    }
}
