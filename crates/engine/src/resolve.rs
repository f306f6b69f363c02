//! Conflict resolution. The strategy is fixed: the node's operations win
//! over the server's, except where that would destroy data still
//! referenced — those deletes are reverted instead.

use std::collections::BTreeMap;

use tracing::debug;

use rowsync_core::{
    FieldValue, JournalRewrite, ObjRef, OpKind, OpPayload, Operation, Row, SchemaRegistry, TypeTag,
};
use rowsync_storage::Store;

use crate::conflicts::ConflictSets;
use crate::error::{MergeError, StoreSide};

/// A primary-key move applied to a remote insert whose key collided with a
/// local one. `old_pk` no longer appears anywhere in the executed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PkRemap {
    pub tag: TypeTag,
    pub old_pk: i64,
    pub new_pk: i64,
}

/// What resolution decided: the remote operations to execute (rewritten),
/// the local journal edits, and the bookkeeping the merge report carries.
#[derive(Debug, Default)]
pub struct Resolution {
    pub execution: Vec<Operation>,
    pub journal: JournalRewrite,
    pub pk_remaps: Vec<PkRemap>,
    pub reverted_local_deletes: Vec<ObjRef>,
    pub reverted_remote_deletes: Vec<ObjRef>,
    pub dropped_remote: Vec<(ObjRef, OpKind)>,
}

fn fetch_replica(store: &dyn Store, target: ObjRef) -> Result<Row, MergeError> {
    match store.fetch(target)? {
        Some(row) => Ok(row),
        None => Err(MergeError::FetchMissing {
            side: StoreSide::Replica,
            target,
        }),
    }
}

fn fetch_message(store: &dyn Store, target: ObjRef) -> Result<Row, MergeError> {
    match store.fetch(target)? {
        Some(row) => Ok(row),
        None => Err(MergeError::MessageIntegrity {
            detail: format!("no snapshot backing {target}"),
        }),
    }
}

/// Rewrite FK columns in a payload that still point at a remapped key.
fn remap_payload_fks(
    registry: &SchemaRegistry,
    tag: TypeTag,
    payload: &mut OpPayload,
    remap: &PkRemap,
) {
    let Some(schema) = registry.get(tag) else {
        return;
    };
    for fk in schema
        .foreign_keys
        .iter()
        .filter(|fk| fk.references == remap.tag)
    {
        let old = FieldValue::Integer(remap.old_pk);
        match payload {
            OpPayload::Insert { row } => {
                if row.get(&fk.column) == Some(&old) {
                    row.set(fk.column.clone(), FieldValue::Integer(remap.new_pk));
                }
            }
            OpPayload::Update { delta } => {
                if delta.get(&fk.column) == Some(&old) {
                    delta.set(fk.column.clone(), FieldValue::Integer(remap.new_pk));
                }
            }
            OpPayload::Delete => {}
        }
    }
}

/// Apply the fixed strategy over the detector output.
///
/// Pure with respect to the database: it reads through the two stores and
/// produces the rewritten execution set plus journal edits, touching
/// nothing. Remote operations are visited in `sequence_no` order so a
/// replayed merge resolves identically.
pub fn resolve(
    remote: &[Operation],
    local: &[Operation],
    sets: &ConflictSets,
    replica: &dyn Store,
    message: &dyn Store,
    registry: &SchemaRegistry,
) -> Result<Resolution, MergeError> {
    let mut res = Resolution::default();
    let mut local_alive = vec![true; local.len()];
    // Highest key already handed out per table, so stacked insert
    // conflicts in one merge never reuse a replacement.
    let mut assigned_pk: BTreeMap<TypeTag, i64> = BTreeMap::new();

    let alive = |alive: &[bool], set: &[(usize, usize)], ri: usize| -> Vec<usize> {
        ConflictSets::locals_for(set, ri)
            .filter(|li| alive[*li])
            .collect()
    };

    for (ri, rop) in remote.iter().enumerate() {
        let mut exec_op = rop.clone();
        let mut can_perform = true;
        let mut reverted = false;
        let mut drop_kind: Option<OpKind> = None;

        let direct = alive(&local_alive, &sets.direct, ri);
        if !direct.is_empty() {
            if rop.kind() == OpKind::Delete {
                can_perform = false;
            }
            for li in direct {
                let lop = &local[li];
                match (rop.kind(), lop.kind()) {
                    (OpKind::Update, OpKind::Update) => {
                        // Local wins; the remote update is acknowledged
                        // data loss.
                        can_perform = false;
                        drop_kind = Some(OpKind::Update);
                        debug!(object = %rop.target, "update-update conflict, keeping local");
                    }
                    (OpKind::Update, OpKind::Delete) => {
                        // Revert the local delete: the row is gone from the
                        // replica, so the remote update materializes it
                        // from the message snapshot.
                        let row = fetch_message(message, rop.target)?;
                        exec_op.payload = OpPayload::Insert { row };
                        local_alive[li] = false;
                        res.journal.remove.push(lop.sequence_no);
                        res.reverted_local_deletes.push(lop.target);
                        debug!(object = %rop.target, "local delete reverted by remote update");
                    }
                    (OpKind::Delete, OpKind::Update) => {
                        // Suppress the remote delete; the local update must
                        // recreate the row server-side at the next push.
                        let row = fetch_replica(replica, lop.target)?;
                        res.journal
                            .replace
                            .push((lop.sequence_no, OpPayload::Insert { row }));
                        res.reverted_remote_deletes.push(rop.target);
                        reverted = true;
                        debug!(object = %rop.target, "remote delete reverted by local update");
                    }
                    (OpKind::Delete, OpKind::Delete) => {
                        // Both sides agree the row is gone; confirm the
                        // local entry and skip the remote one.
                        local_alive[li] = false;
                        res.journal.remove.push(lop.sequence_no);
                        drop_kind = Some(OpKind::Delete);
                    }
                    _ => {}
                }
            }
        }

        if rop.kind() == OpKind::Delete && !reverted {
            let dependency = alive(&local_alive, &sets.dependency, ri);
            if !dependency.is_empty() {
                // Local children still reference the parent: drop the
                // remote delete and reinsert the parent into the journal
                // so the next push restores it server-side.
                can_perform = false;
                let row = fetch_message(message, rop.target)?;
                res.journal
                    .prepend
                    .push((rop.target, OpPayload::Insert { row }));
                res.reverted_remote_deletes.push(rop.target);
                drop_kind = None;
                debug!(object = %rop.target, children = dependency.len(),
                       "remote delete reverted, local children depend on it");
            }
        }

        if matches!(rop.kind(), OpKind::Insert | OpKind::Update) {
            for li in alive(&local_alive, &sets.reversed_dependency, ri) {
                // The remote child references a parent deleted here:
                // revert the local delete with a compensating insert ahead
                // of the child operation.
                let lop = &local[li];
                let row = fetch_message(message, lop.target)?;
                res.execution.push(Operation {
                    sequence_no: exec_op.sequence_no,
                    target: lop.target,
                    payload: OpPayload::Insert { row },
                });
                local_alive[li] = false;
                res.journal.remove.push(lop.sequence_no);
                res.reverted_local_deletes.push(lop.target);
                debug!(parent_ref = %lop.target, child_ref = %rop.target,
                       "local delete reverted, remote child depends on it");
            }
        }

        if rop.kind() == OpKind::Insert {
            for _li in alive(&local_alive, &sets.insert, ri) {
                // Same reference inserted on both sides: keep the local row
                // where it is and move the remote insert past every key
                // either side has seen.
                let tag = rop.target.tag;
                let floor = assigned_pk.get(&tag).copied().unwrap_or(0);
                let new_pk = 1 + floor
                    .max(replica.max_pk(tag)?)
                    .max(message.max_pk(tag)?);
                assigned_pk.insert(tag, new_pk);
                res.pk_remaps.push(PkRemap {
                    tag,
                    old_pk: rop.target.pk,
                    new_pk,
                });
                exec_op.target = ObjRef::new(tag, new_pk);
                debug!(object = %rop.target, new_pk, "insert conflict, remote insert remapped");
            }
        }

        if can_perform {
            res.execution.push(exec_op);
        } else if let Some(kind) = drop_kind {
            res.dropped_remote.push((rop.target, kind));
        }
    }

    // Closure pass: no executed operation may still reference a remapped
    // key, either as its target or through an FK payload column.
    for remap in &res.pk_remaps {
        let old = ObjRef::new(remap.tag, remap.old_pk);
        for op in &mut res.execution {
            if op.target == old {
                op.target = ObjRef::new(remap.tag, remap.new_pk);
            }
            remap_payload_fks(registry, op.target.tag, &mut op.payload, remap);
        }
        for (target, payload) in &mut res.journal.prepend {
            remap_payload_fks(registry, target.tag, payload, remap);
        }
    }

    Ok(res)
}
