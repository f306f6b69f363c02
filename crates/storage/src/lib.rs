pub mod error;
pub mod replica;
pub mod schema;
pub mod store;

pub use error::StorageError;
pub use replica::{rows_equivalent, SqliteReplica};
pub use store::{MessageStore, ReplicaStore, Store};
