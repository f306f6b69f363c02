use rowsync_core::{ObjRef, Row, SchemaRegistry, SyncMessage, TypeTag};

use crate::error::StorageError;
use crate::replica::SqliteReplica;

/// The one capability set conflict detection needs: fetch a row image by
/// reference, walk its FK columns, and read a table's key high-water mark.
/// Two implementations exist — the replica and the pull message — so the
/// detector never branches on where an object lives.
pub trait Store {
    fn fetch(&self, target: ObjRef) -> Result<Option<Row>, StorageError>;

    fn fk_neighbors(&self, target: ObjRef, row: &Row) -> Vec<ObjRef>;

    fn max_pk(&self, tag: TypeTag) -> Result<i64, StorageError>;
}

/// Reads the current replica.
pub struct ReplicaStore<'a> {
    replica: &'a SqliteReplica,
}

impl<'a> ReplicaStore<'a> {
    pub fn new(replica: &'a SqliteReplica) -> Self {
        Self { replica }
    }
}

impl Store for ReplicaStore<'_> {
    fn fetch(&self, target: ObjRef) -> Result<Option<Row>, StorageError> {
        self.replica.fetch_row(target)
    }

    fn fk_neighbors(&self, target: ObjRef, row: &Row) -> Vec<ObjRef> {
        self.replica
            .registry()
            .get(target.tag)
            .map(|schema| schema.fk_refs(row))
            .unwrap_or_default()
    }

    fn max_pk(&self, tag: TypeTag) -> Result<i64, StorageError> {
        self.replica.max_pk(tag)
    }
}

/// Reads the object snapshots embedded in a pull message.
pub struct MessageStore<'a> {
    message: &'a SyncMessage,
    registry: &'a SchemaRegistry,
}

impl<'a> MessageStore<'a> {
    pub fn new(message: &'a SyncMessage, registry: &'a SchemaRegistry) -> Self {
        Self { message, registry }
    }
}

impl Store for MessageStore<'_> {
    fn fetch(&self, target: ObjRef) -> Result<Option<Row>, StorageError> {
        Ok(self.message.object(target).cloned())
    }

    fn fk_neighbors(&self, target: ObjRef, row: &Row) -> Vec<ObjRef> {
        self.registry
            .get(target.tag)
            .map(|schema| schema.fk_refs(row))
            .unwrap_or_default()
    }

    fn max_pk(&self, tag: TypeTag) -> Result<i64, StorageError> {
        Ok(self.message.max_pk(tag).unwrap_or(0))
    }
}
