//! Journal compression: reduce each journal to at most one operation per
//! object before conflict detection, so the message stays small and the
//! conflict rules see canonical operations.

use std::collections::BTreeMap;

use tracing::warn;

use rowsync_core::{JournalRewrite, ObjRef, OpKind, OpPayload, Operation, Row, RowDelta};

/// A per-object local sequence that matches none of the known patterns.
/// Non-fatal: the sequence is passed through uncompressed.
#[derive(Debug, Clone)]
pub struct SequenceWarning {
    pub target: ObjRef,
    pub kinds: Vec<OpKind>,
}

/// Result of compressing the local journal: the canonical operations, the
/// journal edits that make the stored journal match them, and the warnings
/// for sequences left alone.
#[derive(Debug, Default)]
pub struct LocalCompression {
    pub ops: Vec<Operation>,
    pub rewrite: JournalRewrite,
    pub warnings: Vec<SequenceWarning>,
}

fn group_by_target(ops: &[Operation]) -> BTreeMap<ObjRef, Vec<&Operation>> {
    let mut groups: BTreeMap<ObjRef, Vec<&Operation>> = BTreeMap::new();
    for op in ops {
        groups.entry(op.target).or_default().push(op);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|op| op.sequence_no);
    }
    groups
}

fn kind_string(kinds: &[OpKind]) -> String {
    kinds.iter().map(OpKind::letter).collect()
}

/// A local per-object sequence is well formed when an insert can only open
/// it and a delete can only close it. Primary keys are never recycled, so
/// anything else means external interference.
fn local_sequence_valid(kinds: &[OpKind]) -> bool {
    let last = kinds.len() - 1;
    kinds
        .iter()
        .enumerate()
        .all(|(idx, kind)| match kind {
            OpKind::Insert => idx == 0,
            OpKind::Update => true,
            OpKind::Delete => idx == last,
        })
}

fn insert_image(op: &Operation) -> Row {
    match &op.payload {
        OpPayload::Insert { row } => row.clone(),
        _ => Row::new(),
    }
}

/// Replay a multi-origin tail onto a live row image.
fn replay_onto(mut row: Row, rest: &[&Operation]) -> Row {
    let mut alive = true;
    for op in rest {
        match &op.payload {
            OpPayload::Insert { row: image } => {
                row = image.clone();
                alive = true;
            }
            OpPayload::Update { delta } => {
                if !alive {
                    row = Row::new();
                    alive = true;
                }
                row.apply_delta(delta);
            }
            OpPayload::Delete => {
                row = Row::new();
                alive = false;
            }
        }
    }
    row
}

/// Accumulate a group into a single delta, later operations winning.
fn fold_delta(group: &[&Operation]) -> RowDelta {
    let mut delta = RowDelta::new();
    for op in group {
        match &op.payload {
            OpPayload::Insert { row } => delta = row.to_delta(),
            OpPayload::Update { delta: d } => delta.merge(d),
            OpPayload::Delete => delta = RowDelta::new(),
        }
    }
    delta
}

/// Compress the local journal snapshot.
///
/// Valid patterns per object: `i u*` folds to the insert, `i u* d`
/// vanishes, `u u*` folds to one update in the newest slot, `u* d` leaves
/// the delete. Anything else is warned about and passed through unchanged;
/// this is the only place the merge tolerates a broken invariant input.
pub fn compress_local(ops: &[Operation]) -> LocalCompression {
    let mut result = LocalCompression::default();
    for (target, group) in group_by_target(ops) {
        if group.len() == 1 {
            result.ops.push(group[0].clone());
            continue;
        }
        let kinds: Vec<OpKind> = group.iter().map(|op| op.kind()).collect();
        if !local_sequence_valid(&kinds) {
            warn!(
                object = %target,
                sequence = %kind_string(&kinds),
                "inconsistent operation sequence; probable external interference or primary key reuse"
            );
            result.warnings.push(SequenceWarning { target, kinds });
            result.ops.extend(group.iter().map(|op| (*op).clone()));
            continue;
        }
        let first = kinds[0];
        let last = kinds[kinds.len() - 1];
        if first == OpKind::Insert {
            if last == OpKind::Delete {
                // It's as if the object never existed.
                for op in &group {
                    result.rewrite.remove.push(op.sequence_no);
                }
            } else {
                // i u*: the updates fold into the insert image.
                let mut row = insert_image(group[0]);
                for op in &group[1..] {
                    if let OpPayload::Update { delta } = &op.payload {
                        row.apply_delta(delta);
                    }
                    result.rewrite.remove.push(op.sequence_no);
                }
                let payload = OpPayload::Insert { row };
                result
                    .rewrite
                    .replace
                    .push((group[0].sequence_no, payload.clone()));
                result.ops.push(Operation {
                    sequence_no: group[0].sequence_no,
                    target,
                    payload,
                });
            }
        } else if last == OpKind::Delete {
            // u* d: only the delete matters.
            let kept = group[group.len() - 1];
            for op in &group[..group.len() - 1] {
                result.rewrite.remove.push(op.sequence_no);
            }
            result.ops.push(kept.clone());
        } else {
            // u u*: one update carrying the folded delta, newest slot.
            let mut delta = RowDelta::new();
            for op in &group {
                if let OpPayload::Update { delta: d } = &op.payload {
                    delta.merge(d);
                }
            }
            let kept_seq = group[group.len() - 1].sequence_no;
            for op in &group[..group.len() - 1] {
                result.rewrite.remove.push(op.sequence_no);
            }
            let payload = OpPayload::Update { delta };
            result.rewrite.replace.push((kept_seq, payload.clone()));
            result.ops.push(Operation {
                sequence_no: kept_seq,
                target,
                payload,
            });
        }
    }
    result.ops.sort();
    result
}

/// Compress a remote operation run. Total over non-empty sequences:
/// reinsertion after deletion is permitted because the server history
/// interleaves every node.
pub fn compress_remote(ops: &[Operation]) -> Vec<Operation> {
    let mut out = Vec::new();
    for (target, group) in group_by_target(ops) {
        if group.len() == 1 {
            out.push(group[0].clone());
            continue;
        }
        let first = group[0].kind();
        let last = group[group.len() - 1].kind();
        match (first, last) {
            (OpKind::Insert, OpKind::Delete) => {}
            (OpKind::Insert, _) => {
                let row = replay_onto(insert_image(group[0]), &group[1..]);
                out.push(Operation::insert(group[0].sequence_no, target, row));
            }
            (OpKind::Update, OpKind::Delete) | (OpKind::Delete, OpKind::Delete) => {
                let kept = if first == OpKind::Delete {
                    group[0]
                } else {
                    group[group.len() - 1]
                };
                out.push(kept.clone());
            }
            (OpKind::Update, _) => {
                out.push(Operation::update(
                    group[0].sequence_no,
                    target,
                    fold_delta(&group),
                ));
            }
            (OpKind::Delete, _) => {
                // The row died and came back; locally that reads as an
                // update carrying the resurrected image.
                out.push(Operation::update(
                    group[group.len() - 1].sequence_no,
                    target,
                    fold_delta(&group),
                ));
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_core::{FieldValue, TypeTag};

    const TAG: TypeTag = TypeTag::new(1);

    fn target(pk: i64) -> ObjRef {
        ObjRef::new(TAG, pk)
    }

    fn row(pairs: &[(&str, i64)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::Integer(*v)))
            .collect()
    }

    fn delta(pairs: &[(&str, i64)]) -> RowDelta {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::Integer(*v)))
            .collect()
    }

    #[test]
    fn local_insert_then_updates_folds_to_insert() {
        let ops = vec![
            Operation::insert(1, target(1), row(&[("a", 1), ("b", 2)])),
            Operation::update(2, target(1), delta(&[("a", 9)])),
            Operation::update(3, target(1), delta(&[("b", 8)])),
        ];
        let compressed = compress_local(&ops);
        assert_eq!(compressed.ops.len(), 1);
        let op = &compressed.ops[0];
        assert_eq!(op.kind(), OpKind::Insert);
        assert_eq!(op.sequence_no, 1);
        match &op.payload {
            OpPayload::Insert { row } => {
                assert_eq!(row.get("a"), Some(&FieldValue::Integer(9)));
                assert_eq!(row.get("b"), Some(&FieldValue::Integer(8)));
            }
            other => panic!("expected insert payload, got {other:?}"),
        }
        assert_eq!(compressed.rewrite.remove, vec![2, 3]);
        assert!(compressed.warnings.is_empty());
    }

    #[test]
    fn local_insert_then_delete_vanishes() {
        let ops = vec![
            Operation::insert(1, target(1), row(&[("a", 1)])),
            Operation::update(2, target(1), delta(&[("a", 2)])),
            Operation::delete(3, target(1)),
        ];
        let compressed = compress_local(&ops);
        assert!(compressed.ops.is_empty());
        assert_eq!(compressed.rewrite.remove, vec![1, 2, 3]);
    }

    #[test]
    fn local_updates_fold_to_newest_slot() {
        let ops = vec![
            Operation::update(4, target(1), delta(&[("a", 1), ("b", 1)])),
            Operation::update(7, target(1), delta(&[("a", 2)])),
        ];
        let compressed = compress_local(&ops);
        assert_eq!(compressed.ops.len(), 1);
        let op = &compressed.ops[0];
        assert_eq!(op.sequence_no, 7);
        match &op.payload {
            OpPayload::Update { delta } => {
                assert_eq!(delta.get("a"), Some(&FieldValue::Integer(2)));
                assert_eq!(delta.get("b"), Some(&FieldValue::Integer(1)));
            }
            other => panic!("expected update payload, got {other:?}"),
        }
        assert_eq!(compressed.rewrite.remove, vec![4]);
    }

    #[test]
    fn local_updates_then_delete_keeps_delete() {
        let ops = vec![
            Operation::update(1, target(1), delta(&[("a", 1)])),
            Operation::update(2, target(1), delta(&[("a", 2)])),
            Operation::delete(3, target(1)),
        ];
        let compressed = compress_local(&ops);
        assert_eq!(compressed.ops.len(), 1);
        assert_eq!(compressed.ops[0].kind(), OpKind::Delete);
        assert_eq!(compressed.ops[0].sequence_no, 3);
        assert_eq!(compressed.rewrite.remove, vec![1, 2]);
    }

    #[test]
    fn local_unmatched_sequence_passes_through_with_warning() {
        // Delete followed by insert: primary key reuse.
        let ops = vec![
            Operation::delete(1, target(1)),
            Operation::insert(2, target(1), row(&[("a", 1)])),
        ];
        let compressed = compress_local(&ops);
        assert_eq!(compressed.ops.len(), 2);
        assert!(compressed.rewrite.is_empty());
        assert_eq!(compressed.warnings.len(), 1);
        assert_eq!(compressed.warnings[0].target, target(1));
        assert_eq!(
            compressed.warnings[0].kinds,
            vec![OpKind::Delete, OpKind::Insert]
        );
    }

    #[test]
    fn local_compression_idempotent() {
        let ops = vec![
            Operation::insert(1, target(1), row(&[("a", 1)])),
            Operation::update(2, target(1), delta(&[("a", 2)])),
            Operation::update(3, target(2), delta(&[("b", 1)])),
            Operation::delete(4, target(3)),
            Operation::delete(5, target(4)),
            Operation::insert(6, target(4), row(&[("a", 4)])),
        ];
        let once = compress_local(&ops);
        let twice = compress_local(&once.ops);
        assert_eq!(once.ops, twice.ops);
        assert!(twice.rewrite.remove.is_empty());
    }

    #[test]
    fn remote_insert_then_delete_vanishes() {
        let ops = vec![
            Operation::insert(1, target(1), row(&[("a", 1)])),
            Operation::update(2, target(1), delta(&[("a", 2)])),
            Operation::delete(3, target(1)),
        ];
        assert!(compress_remote(&ops).is_empty());
    }

    #[test]
    fn remote_delete_then_insert_becomes_update() {
        let ops = vec![
            Operation::delete(1, target(1)),
            Operation::insert(4, target(1), row(&[("a", 7)])),
        ];
        let compressed = compress_remote(&ops);
        assert_eq!(compressed.len(), 1);
        let op = &compressed[0];
        assert_eq!(op.kind(), OpKind::Update);
        assert_eq!(op.sequence_no, 4);
        match &op.payload {
            OpPayload::Update { delta } => {
                assert_eq!(delta.get("a"), Some(&FieldValue::Integer(7)));
            }
            other => panic!("expected update payload, got {other:?}"),
        }
    }

    #[test]
    fn remote_insert_survives_middle_churn() {
        // i d i u keeps an insert carrying the final image.
        let ops = vec![
            Operation::insert(1, target(1), row(&[("a", 1)])),
            Operation::delete(2, target(1)),
            Operation::insert(3, target(1), row(&[("a", 5), ("b", 5)])),
            Operation::update(4, target(1), delta(&[("a", 6)])),
        ];
        let compressed = compress_remote(&ops);
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed[0].kind(), OpKind::Insert);
        match &compressed[0].payload {
            OpPayload::Insert { row } => {
                assert_eq!(row.get("a"), Some(&FieldValue::Integer(6)));
                assert_eq!(row.get("b"), Some(&FieldValue::Integer(5)));
            }
            other => panic!("expected insert payload, got {other:?}"),
        }
    }

    #[test]
    fn remote_update_then_delete_keeps_delete() {
        let ops = vec![
            Operation::update(1, target(1), delta(&[("a", 1)])),
            Operation::delete(2, target(1)),
        ];
        let compressed = compress_remote(&ops);
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed[0].kind(), OpKind::Delete);
        assert_eq!(compressed[0].sequence_no, 2);
    }

    #[test]
    fn remote_delete_delete_keeps_first() {
        let ops = vec![
            Operation::delete(1, target(1)),
            Operation::insert(2, target(1), row(&[("a", 1)])),
            Operation::delete(3, target(1)),
        ];
        let compressed = compress_remote(&ops);
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed[0].kind(), OpKind::Delete);
        assert_eq!(compressed[0].sequence_no, 1);
    }

    #[test]
    fn remote_compression_idempotent() {
        let ops = vec![
            Operation::delete(1, target(1)),
            Operation::insert(2, target(1), row(&[("a", 1)])),
            Operation::update(3, target(2), delta(&[("b", 1)])),
            Operation::update(4, target(2), delta(&[("b", 2)])),
            Operation::insert(5, target(3), row(&[("c", 1)])),
        ];
        let once = compress_remote(&ops);
        let twice = compress_remote(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn one_op_per_object_after_compression() {
        let ops = vec![
            Operation::insert(1, target(1), row(&[("a", 1)])),
            Operation::update(2, target(1), delta(&[("a", 2)])),
            Operation::update(3, target(1), delta(&[("a", 3)])),
            Operation::delete(4, target(2)),
            Operation::insert(5, target(2), row(&[("a", 2)])),
            Operation::delete(6, target(2)),
        ];
        let compressed = compress_remote(&ops);
        let mut seen = std::collections::BTreeSet::new();
        for op in &compressed {
            assert!(seen.insert(op.target), "duplicate target {:?}", op.target);
        }
    }
}
