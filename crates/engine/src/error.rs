use std::fmt;

use rowsync_core::{FieldValue, ObjRef};
use rowsync_storage::StorageError;
use thiserror::Error;

/// Which object store a failed fetch was issued against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSide {
    Replica,
    Message,
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replica => write!(f, "replica"),
            Self::Message => write!(f, "message"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    /// An object a conflict test depends on is absent from the named store.
    #[error("object missing from {side} store: {target}")]
    FetchMissing { side: StoreSide, target: ObjRef },

    /// The pull message violates the server's construction guarantees.
    #[error("message integrity: {detail}")]
    MessageIntegrity { detail: String },

    /// Distinct rows would end up holding the same unique column values.
    #[error("unique constraint collision on {constraint}: {targets:?} would share {values:?}")]
    UniqueConstraintCollision {
        constraint: String,
        targets: Vec<ObjRef>,
        values: Vec<FieldValue>,
    },

    /// The execution transaction failed and was rolled back; the replica
    /// and journal are untouched.
    #[error("execution failed: {0}")]
    ExecutionFailed(#[source] StorageError),

    /// A postcondition the engine maintains was observed broken.
    #[error("merge invariant violated: {0}")]
    Invariant(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
