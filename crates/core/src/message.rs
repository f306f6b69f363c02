use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::ids::{ObjRef, TypeTag, VersionId};
use crate::ops::Operation;
use crate::row::Row;

/// The server pull payload: every operation committed to the authoritative
/// history since the node's last synchronized version, plus snapshots of
/// the objects needed to evaluate foreign-key conflicts during the merge.
///
/// The server guarantees the snapshot set is sufficient; the merge treats a
/// missing snapshot as a protocol violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub target_version: VersionId,
    pub operations: Vec<Operation>,
    pub objects: BTreeMap<ObjRef, Row>,
}

impl SyncMessage {
    pub fn new(target_version: VersionId) -> Self {
        Self {
            target_version,
            operations: Vec::new(),
            objects: BTreeMap::new(),
        }
    }

    pub fn add_operation(&mut self, op: Operation) {
        self.operations.push(op);
    }

    pub fn add_object(&mut self, target: ObjRef, row: Row) {
        self.objects.insert(target, row);
    }

    pub fn object(&self, target: ObjRef) -> Option<&Row> {
        self.objects.get(&target)
    }

    /// Largest primary key this message mentions for a table, across both
    /// snapshots and operation targets. `None` if the table is untouched.
    pub fn max_pk(&self, tag: TypeTag) -> Option<i64> {
        let from_objects = self
            .objects
            .keys()
            .filter(|r| r.tag == tag)
            .map(|r| r.pk)
            .max();
        let from_ops = self
            .operations
            .iter()
            .filter(|op| op.target.tag == tag)
            .map(|op| op.target.pk)
            .max();
        match (from_objects, from_ops) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// The client half of the pull handshake: the node's synchronized position
/// and its compressed unversioned journal, which the server diffs against
/// to build the `SyncMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub latest_version: Option<VersionId>,
    pub operations: Vec<Operation>,
}

impl PullRequest {
    pub fn new(latest_version: Option<VersionId>) -> Self {
        Self {
            latest_version,
            operations: Vec::new(),
        }
    }

    pub fn add_operation(&mut self, op: Operation) {
        self.operations.push(op);
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
