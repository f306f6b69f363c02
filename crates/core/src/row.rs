use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::field_value::FieldValue;

/// A full record image: every non-key column mapped to its value.
///
/// The primary key is carried by the accompanying `ObjRef`, never inside
/// the row itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    columns: BTreeMap<String, FieldValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.columns.get(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: FieldValue) {
        self.columns.insert(column.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.columns.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Overlay a delta onto this image, later values winning.
    pub fn apply_delta(&mut self, delta: &RowDelta) {
        for (column, value) in delta.iter() {
            self.columns.insert(column.clone(), value.clone());
        }
    }

    /// Reinterpret the full image as a delta touching every column.
    pub fn to_delta(&self) -> RowDelta {
        RowDelta {
            changes: self.columns.clone(),
        }
    }
}

impl FromIterator<(String, FieldValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

/// A field-level delta: only the columns an update touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDelta {
    changes: BTreeMap<String, FieldValue>,
}

impl RowDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.changes.get(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: FieldValue) {
        self.changes.insert(column.into(), value);
    }

    pub fn touches(&self, column: &str) -> bool {
        self.changes.contains_key(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.changes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Fold a later delta into this one, the later value winning per column.
    pub fn merge(&mut self, later: &RowDelta) {
        for (column, value) in later.iter() {
            self.changes.insert(column.clone(), value.clone());
        }
    }
}

impl FromIterator<(String, FieldValue)> for RowDelta {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}
