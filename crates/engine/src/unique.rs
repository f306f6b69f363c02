//! Unique-constraint checking over the resolved execution set.
//!
//! Compression collapses update runs, so an intermediate swap state can be
//! lost: two rows exchanging a unique value arrive as two single updates
//! that each collide with the other's current value. Those are rewritten
//! to go through a transaction-scoped temporary value. Collisions that no
//! operation in this merge resolves are surfaced as typed errors.

use std::collections::BTreeMap;

use tracing::debug;

use rowsync_core::{
    FieldValue, ObjRef, OpKind, OpPayload, Operation, Row, RowDelta, SchemaRegistry,
    UniqueConstraint,
};
use rowsync_storage::SqliteReplica;

use crate::error::MergeError;

/// The execution set after unique checking: operations in order, plus the
/// deferred second-phase updates that restore real values at the end of
/// the transaction.
#[derive(Debug, Default)]
pub struct ExecutionPlan {
    pub steps: Vec<Operation>,
    pub deferred: Vec<(ObjRef, RowDelta)>,
}

/// The values a constraint's columns hold once an operation lands, given
/// the row's current image. `None` when the operation cannot introduce a
/// new collision.
fn final_values(
    op: &Operation,
    constraint: &UniqueConstraint,
    current: Option<&Row>,
) -> Option<Vec<FieldValue>> {
    let values: Vec<FieldValue> = match &op.payload {
        OpPayload::Insert { row } => constraint
            .columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(FieldValue::Null))
            .collect(),
        OpPayload::Update { delta } => {
            if !constraint.columns.iter().any(|c| delta.touches(c)) {
                return None;
            }
            constraint
                .columns
                .iter()
                .map(|c| {
                    delta
                        .get(c)
                        .or_else(|| current.and_then(|row| row.get(c)))
                        .cloned()
                        .unwrap_or(FieldValue::Null)
                })
                .collect()
        }
        OpPayload::Delete => return None,
    };
    if values.iter().all(FieldValue::is_null) {
        return None;
    }
    Some(values)
}

/// Whether another operation in the set moves `counterpart` off `values`
/// for this constraint (or removes the row entirely).
fn vacated_by_execution(
    execution: &[Operation],
    counterpart: ObjRef,
    constraint: &UniqueConstraint,
    values: &[FieldValue],
    current_rows: &BTreeMap<ObjRef, Option<Row>>,
) -> bool {
    execution.iter().any(|op| {
        if op.target != counterpart {
            return false;
        }
        match op.kind() {
            OpKind::Delete => true,
            OpKind::Update => {
                let current = current_rows.get(&counterpart).and_then(|r| r.as_ref());
                match final_values(op, constraint, current) {
                    Some(theirs) => theirs != values,
                    None => false,
                }
            }
            OpKind::Insert => false,
        }
    })
}

/// A transaction-scoped placeholder that cannot collide with application
/// data or with another operation's placeholder.
fn temporary_text(constraint: &str, target: ObjRef, column: &str) -> FieldValue {
    FieldValue::Text(format!("\u{1a}merge:{constraint}:{target}:{column}"))
}

/// Rewrite one operation to run in two phases: placeholder values now, the
/// real values after every other step has executed. Only text columns can
/// carry a placeholder; anything else refuses.
fn two_phase(
    op: &mut Operation,
    constraint: &UniqueConstraint,
    values: &[FieldValue],
    counterpart: ObjRef,
) -> Result<(ObjRef, RowDelta), MergeError> {
    if !values
        .iter()
        .all(|v| matches!(v, FieldValue::Text(_) | FieldValue::Null))
    {
        return Err(MergeError::UniqueConstraintCollision {
            constraint: constraint.name.clone(),
            targets: vec![op.target, counterpart],
            values: values.to_vec(),
        });
    }
    let mut restore = RowDelta::new();
    for (column, value) in constraint.columns.iter().zip(values) {
        let placeholder = temporary_text(&constraint.name, op.target, column);
        match &mut op.payload {
            OpPayload::Insert { row } => row.set(column.clone(), placeholder),
            OpPayload::Update { delta } => delta.set(column.clone(), placeholder),
            OpPayload::Delete => {}
        }
        restore.set(column.clone(), value.clone());
    }
    debug!(object = %op.target, constraint = %constraint.name,
           "unique collision resolved through a two-phase update");
    Ok((op.target, restore))
}

/// Check every unique constraint against the combined outcome and rewrite
/// or reject colliding operations.
pub fn check(
    mut execution: Vec<Operation>,
    replica: &SqliteReplica,
    registry: &SchemaRegistry,
) -> Result<ExecutionPlan, MergeError> {
    // Current images of every touched row, one fetch each.
    let mut current_rows: BTreeMap<ObjRef, Option<Row>> = BTreeMap::new();
    for op in &execution {
        if !current_rows.contains_key(&op.target) {
            current_rows.insert(op.target, replica.fetch_row(op.target)?);
        }
    }

    // Two operations in the set may not end on the same values.
    for (i, a) in execution.iter().enumerate() {
        let Some(schema) = registry.get(a.target.tag) else {
            continue;
        };
        for constraint in &schema.unique_constraints {
            let current_a = current_rows.get(&a.target).and_then(|r| r.as_ref());
            let Some(values_a) = final_values(a, constraint, current_a) else {
                continue;
            };
            for b in execution.iter().skip(i + 1) {
                if b.target.tag != a.target.tag || b.target == a.target {
                    continue;
                }
                let current_b = current_rows.get(&b.target).and_then(|r| r.as_ref());
                if final_values(b, constraint, current_b).as_deref() == Some(&values_a[..]) {
                    return Err(MergeError::UniqueConstraintCollision {
                        constraint: constraint.name.clone(),
                        targets: vec![a.target, b.target],
                        values: values_a,
                    });
                }
            }
        }
    }

    // Probe the replica for rows currently holding each operation's final
    // values; decide per collision whether this merge vacates them.
    let mut deferred = Vec::new();
    let mut rewrites: Vec<(usize, UniqueConstraint, Vec<FieldValue>, ObjRef)> = Vec::new();
    for (idx, op) in execution.iter().enumerate() {
        let Some(schema) = registry.get(op.target.tag) else {
            continue;
        };
        for constraint in &schema.unique_constraints {
            let current = current_rows.get(&op.target).and_then(|r| r.as_ref());
            let Some(values) = final_values(op, constraint, current) else {
                continue;
            };
            let holder =
                replica.find_by_values(op.target.tag, &constraint.columns, &values)?;
            let Some(holder_pk) = holder else {
                continue;
            };
            if holder_pk == op.target.pk {
                continue;
            }
            let counterpart = ObjRef::new(op.target.tag, holder_pk);
            if vacated_by_execution(&execution, counterpart, constraint, &values, &current_rows) {
                rewrites.push((idx, constraint.clone(), values, counterpart));
            } else {
                // Either another node independently produced the value or
                // a pending local row holds it: cross-origin, fatal.
                return Err(MergeError::UniqueConstraintCollision {
                    constraint: constraint.name.clone(),
                    targets: vec![op.target, counterpart],
                    values,
                });
            }
        }
    }

    for (idx, constraint, values, counterpart) in rewrites {
        let restore = two_phase(&mut execution[idx], &constraint, &values, counterpart)?;
        deferred.push(restore);
    }

    Ok(ExecutionPlan {
        steps: execution,
        deferred,
    })
}
