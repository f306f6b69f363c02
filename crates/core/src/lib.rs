pub mod error;
pub mod field_value;
pub mod ids;
pub mod message;
pub mod ops;
pub mod row;
pub mod schema;

pub use error::CoreError;
pub use field_value::FieldValue;
pub use ids::{ObjRef, TypeTag, VersionId};
pub use message::{PullRequest, SyncMessage};
pub use ops::{JournalRewrite, OpKind, OpPayload, Operation};
pub use row::{Row, RowDelta};
pub use schema::{ColumnDef, ColumnType, ForeignKey, SchemaRegistry, TableSchema, UniqueConstraint};
