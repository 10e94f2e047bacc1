//! Store contract errors.
use mantle_core::ResourceRef;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("resource {0} not found")]
    NotFound(ResourceRef),

    #[error("resource {0} already exists")]
    AlreadyExists(ResourceRef),

    #[error("version conflict on {reference}: expected {expected}, found {found}")]
    VersionConflict {
        reference: ResourceRef,
        expected: u64,
        found: u64,
    },

    #[error("precondition failed on {reference}: {reason}")]
    PreconditionFailed {
        reference: ResourceRef,
        reason: String,
    },

    #[error("invalid mutation on {reference}: {reason}")]
    Invalid {
        reference: ResourceRef,
        reason: String,
    },

    #[error("watch replay from version {from} is gone, oldest retained is {oldest}")]
    VersionGone { from: u64, oldest: u64 },

    #[error(transparent)]
    Conversion(#[from] mantle_core::Error),
}

impl Error {
    /// Whether a retry after re-reading current state can succeed.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
