//! In-memory `Store` used by the unit tests of the detector and resolver.

use std::collections::BTreeMap;

use rowsync_core::{
    ColumnType, FieldValue, ObjRef, Row, SchemaRegistry, TableSchema, TypeTag,
};
use rowsync_storage::{StorageError, Store};

pub const PARENT: TypeTag = TypeTag::new(1);
pub const CHILD: TypeTag = TypeTag::new(2);

pub fn registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry.register(
        TableSchema::new(PARENT, "parents", "Parent", "id")
            .column("name", ColumnType::Text, false),
    );
    registry.register(
        TableSchema::new(CHILD, "children", "Child", "id")
            .column("name", ColumnType::Text, false)
            .column("parent_id", ColumnType::Integer, true)
            .foreign_key("parent_id", PARENT),
    );
    registry
}

pub fn parent_row(name: &str) -> Row {
    [("name".to_string(), FieldValue::Text(name.into()))]
        .into_iter()
        .collect()
}

pub fn child_row(name: &str, parent_pk: i64) -> Row {
    [
        ("name".to_string(), FieldValue::Text(name.into())),
        ("parent_id".to_string(), FieldValue::Integer(parent_pk)),
    ]
    .into_iter()
    .collect()
}

pub struct MapStore {
    registry: SchemaRegistry,
    rows: BTreeMap<ObjRef, Row>,
}

impl MapStore {
    pub fn new() -> Self {
        Self {
            registry: registry(),
            rows: BTreeMap::new(),
        }
    }

    pub fn with(mut self, target: ObjRef, row: Row) -> Self {
        self.rows.insert(target, row);
        self
    }
}

impl Store for MapStore {
    fn fetch(&self, target: ObjRef) -> Result<Option<Row>, StorageError> {
        Ok(self.rows.get(&target).cloned())
    }

    fn fk_neighbors(&self, target: ObjRef, row: &Row) -> Vec<ObjRef> {
        self.registry
            .get(target.tag)
            .map(|schema| schema.fk_refs(row))
            .unwrap_or_default()
    }

    fn max_pk(&self, tag: TypeTag) -> Result<i64, StorageError> {
        Ok(self
            .rows
            .keys()
            .filter(|r| r.tag == tag)
            .map(|r| r.pk)
            .max()
            .unwrap_or(0))
    }
}
