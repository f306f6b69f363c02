use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::field_value::FieldValue;
use crate::ids::{ObjRef, TypeTag};
use crate::row::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Boolean,
    Bytes,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Float => "REAL",
            Self::Text => "TEXT",
            Self::Bytes => "BLOB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

/// A column in this table whose integer value is the primary key of a row
/// in the referenced table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references: TypeTag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub columns: Vec<String>,
}

/// Static description of one synchronized table. The merge engine performs
/// no schema introspection of its own; everything it needs to know about
/// foreign keys and unique constraints lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub tag: TypeTag,
    pub table_name: String,
    pub model_name: String,
    pub pk_column: String,
    pub columns: Vec<ColumnDef>,
    pub foreign_keys: Vec<ForeignKey>,
    pub unique_constraints: Vec<UniqueConstraint>,
}

impl TableSchema {
    pub fn new(
        tag: TypeTag,
        table_name: impl Into<String>,
        model_name: impl Into<String>,
        pk_column: impl Into<String>,
    ) -> Self {
        Self {
            tag,
            table_name: table_name.into(),
            model_name: model_name.into(),
            pk_column: pk_column.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, ty: ColumnType, nullable: bool) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            ty,
            nullable,
        });
        self
    }

    pub fn foreign_key(mut self, column: impl Into<String>, references: TypeTag) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references,
        });
        self
    }

    pub fn unique(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.unique_constraints.push(UniqueConstraint {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The references this row's FK columns point at. Null or missing FK
    /// columns yield nothing; the relation is one hop by construction.
    pub fn fk_refs(&self, row: &Row) -> Vec<ObjRef> {
        self.foreign_keys
            .iter()
            .filter_map(|fk| match row.get(&fk.column) {
                Some(FieldValue::Integer(pk)) => Some(ObjRef::new(fk.references, *pk)),
                _ => None,
            })
            .collect()
    }
}

/// Registry of every synchronized table, keyed by type tag.
///
/// Iteration order is deterministic so that schema-driven DDL and merge
/// passes replay identically.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: BTreeMap<TypeTag, TableSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: TableSchema) {
        self.tables.insert(schema.tag, schema);
    }

    pub fn get(&self, tag: TypeTag) -> Option<&TableSchema> {
        self.tables.get(&tag)
    }

    pub fn contains(&self, tag: TypeTag) -> bool {
        self.tables.contains_key(&tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }
}
