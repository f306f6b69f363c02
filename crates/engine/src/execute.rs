//! Execution of the resolved remote operation set against the replica,
//! inside one transaction together with the journal rewrite and the
//! version advance. Either everything lands or nothing does.

use tracing::warn;

use rowsync_core::{JournalRewrite, OpPayload, VersionId};
use rowsync_storage::{rows_equivalent, SqliteReplica, StorageError, Store};

use crate::error::{MergeError, StoreSide};
use crate::unique::ExecutionPlan;

fn exec_err(e: StorageError) -> MergeError {
    MergeError::ExecutionFailed(e)
}

fn apply_step(
    replica: &SqliteReplica,
    op: &rowsync_core::Operation,
    message: &dyn Store,
) -> Result<(), MergeError> {
    match &op.payload {
        OpPayload::Insert { row } => {
            if let Some(existing) = replica.fetch_row(op.target).map_err(exec_err)? {
                let schema = replica
                    .registry()
                    .get(op.target.tag)
                    .ok_or(StorageError::Untracked(op.target.tag))
                    .map_err(exec_err)?;
                if rows_equivalent(schema, &existing, row) {
                    // Same image on both sides; nothing to redo.
                    warn!(object = %op.target, "insert of an identical existing row, skipping");
                } else {
                    return Err(exec_err(StorageError::RowCollision {
                        table: schema.table_name.clone(),
                        pk: op.target.pk,
                    }));
                }
            } else {
                replica.insert_row(op.target, row).map_err(exec_err)?;
            }
        }
        OpPayload::Update { delta } => {
            let affected = replica.update_row(op.target, delta).map_err(exec_err)?;
            if affected == 0 {
                // The row vanished outside the journal; rebuild it from
                // the server snapshot so both ends converge.
                warn!(object = %op.target, "update of an absent row, materializing from snapshot");
                let mut row = match message.fetch(op.target).map_err(exec_err)? {
                    Some(row) => row,
                    None => {
                        return Err(MergeError::FetchMissing {
                            side: StoreSide::Message,
                            target: op.target,
                        })
                    }
                };
                row.apply_delta(delta);
                replica.insert_row(op.target, &row).map_err(exec_err)?;
            }
        }
        OpPayload::Delete => {
            if !replica.delete_row(op.target).map_err(exec_err)? {
                warn!(object = %op.target, "delete of an already absent row, nothing to do");
            }
        }
    }
    Ok(())
}

/// Run the plan under `BEGIN IMMEDIATE`. On success the journal rewrite is
/// applied and the local version advances to the message's target in the
/// same transaction; on any error the transaction rolls back and the
/// replica and journal are exactly as before.
pub fn execute(
    replica: &SqliteReplica,
    plan: &ExecutionPlan,
    journal: &JournalRewrite,
    version: VersionId,
    message: &dyn Store,
) -> Result<(), MergeError> {
    replica.begin()?;

    let result = (|| -> Result<(), MergeError> {
        for op in &plan.steps {
            apply_step(replica, op, message)?;
        }
        for (target, restore) in &plan.deferred {
            let affected = replica.update_row(*target, restore).map_err(exec_err)?;
            if affected == 0 {
                return Err(exec_err(StorageError::NotFound(*target)));
            }
        }
        replica.apply_rewrite(journal).map_err(exec_err)?;
        replica.advance_version(version).map_err(exec_err)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            replica.commit()?;
            Ok(())
        }
        Err(e) => {
            let _ = replica.rollback();
            Err(e)
        }
    }
}
