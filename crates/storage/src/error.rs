use rowsync_core::{ObjRef, TypeTag};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("type tag not registered: {0}")]
    Untracked(TypeTag),

    #[error("column not in table {table}: {column}")]
    UnknownColumn { table: String, column: String },

    #[error("row collision in {table}: pk {pk}")]
    RowCollision { table: String, pk: i64 },

    #[error("not found: {0}")]
    NotFound(ObjRef),

    #[error("core error: {0}")]
    Core(#[from] rowsync_core::CoreError),
}
