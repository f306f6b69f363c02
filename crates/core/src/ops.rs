use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::CoreError;
use crate::ids::ObjRef;
use crate::row::{Row, RowDelta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    /// Single-letter command code used in the journal table.
    pub fn letter(&self) -> char {
        match self {
            Self::Insert => 'i',
            Self::Update => 'u',
            Self::Delete => 'd',
        }
    }

    pub fn from_letter(letter: char) -> Result<Self, CoreError> {
        match letter {
            'i' => Ok(Self::Insert),
            'u' => Ok(Self::Update),
            'd' => Ok(Self::Delete),
            other => Err(CoreError::InvalidOperation(format!(
                "unknown command letter {other:?}"
            ))),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpPayload {
    Insert { row: Row },
    Update { delta: RowDelta },
    Delete,
}

impl OpPayload {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Insert { .. } => OpKind::Insert,
            Self::Update { .. } => OpKind::Update,
            Self::Delete => OpKind::Delete,
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// A single journaled mutation against one row.
///
/// Identity is `(target, kind, sequence_no)`; the payload carries the data
/// needed to replay the mutation but takes no part in equality. The
/// `sequence_no` gives the total order within the operation's journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub sequence_no: i64,
    pub target: ObjRef,
    pub payload: OpPayload,
}

impl Operation {
    pub fn insert(sequence_no: i64, target: ObjRef, row: Row) -> Self {
        Self {
            sequence_no,
            target,
            payload: OpPayload::Insert { row },
        }
    }

    pub fn update(sequence_no: i64, target: ObjRef, delta: RowDelta) -> Self {
        Self {
            sequence_no,
            target,
            payload: OpPayload::Update { delta },
        }
    }

    pub fn delete(sequence_no: i64, target: ObjRef) -> Self {
        Self {
            sequence_no,
            target,
            payload: OpPayload::Delete,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.payload.kind()
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target
            && self.kind() == other.kind()
            && self.sequence_no == other.sequence_no
    }
}

impl Eq for Operation {}

impl Ord for Operation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence_no
            .cmp(&other.sequence_no)
            .then(self.target.cmp(&other.target))
    }
}

impl PartialOrd for Operation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The edits a merge applies to the local journal at commit.
///
/// Compression contributes removals and payload folds; resolution
/// contributes further removals, command rewrites and reinsertion
/// operations. `prepend` entries take the lowest sequence slots, shifting
/// the surviving journal up to make room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalRewrite {
    pub remove: Vec<i64>,
    pub replace: Vec<(i64, OpPayload)>,
    pub prepend: Vec<(ObjRef, OpPayload)>,
}

impl JournalRewrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.replace.is_empty() && self.prepend.is_empty()
    }

    /// Fold another rewrite into this one. A later removal wins over an
    /// earlier replace of the same sequence number.
    pub fn extend(&mut self, other: JournalRewrite) {
        self.remove.extend(other.remove);
        self.replace.extend(other.replace);
        self.prepend.extend(other.prepend);
        self.remove.sort_unstable();
        self.remove.dedup();
        let removed = &self.remove;
        self.replace.retain(|(seq, _)| !removed.contains(seq));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TypeTag;

    fn target(pk: i64) -> ObjRef {
        ObjRef::new(TypeTag::new(1), pk)
    }

    #[test]
    fn equality_ignores_payload() {
        let mut row = Row::new();
        row.set("name", crate::field_value::FieldValue::Text("a".into()));
        let a = Operation::insert(3, target(1), row);
        let b = Operation::insert(3, target(1), Row::new());
        assert_eq!(a, b);
    }

    #[test]
    fn equality_distinguishes_kind() {
        let a = Operation::delete(3, target(1));
        let b = Operation::update(3, target(1), RowDelta::new());
        assert_ne!(a, b);
    }

    #[test]
    fn ordering_by_sequence() {
        let a = Operation::delete(1, target(9));
        let b = Operation::delete(2, target(1));
        assert!(a < b);
    }

    #[test]
    fn command_letters_roundtrip() {
        for kind in [OpKind::Insert, OpKind::Update, OpKind::Delete] {
            assert_eq!(OpKind::from_letter(kind.letter()).unwrap(), kind);
        }
        assert!(OpKind::from_letter('x').is_err());
    }

    #[test]
    fn payload_msgpack_roundtrip() {
        let mut delta = RowDelta::new();
        delta.set("count", crate::field_value::FieldValue::Integer(42));
        let payload = OpPayload::Update { delta };
        let bytes = payload.to_msgpack().unwrap();
        let recovered = OpPayload::from_msgpack(&bytes).unwrap();
        assert_eq!(payload, recovered);
    }

    #[test]
    fn rewrite_extend_prefers_removal() {
        let mut first = JournalRewrite {
            remove: vec![2],
            replace: vec![(3, OpPayload::Delete)],
            prepend: vec![],
        };
        let second = JournalRewrite {
            remove: vec![3],
            replace: vec![],
            prepend: vec![],
        };
        first.extend(second);
        assert_eq!(first.remove, vec![2, 3]);
        assert!(first.replace.is_empty());
    }
}
