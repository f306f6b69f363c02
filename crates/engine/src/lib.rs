//! The merge engine: reconcile a server pull message against the node's
//! local uncommitted journal so the replica ends observationally
//! equivalent to "apply remote first, then reapply local".

pub mod compress;
pub mod conflicts;
pub mod error;
pub mod execute;
pub mod resolve;
pub mod unique;

#[cfg(test)]
mod testutil;

pub use compress::{compress_local, compress_remote, LocalCompression, SequenceWarning};
pub use conflicts::{detect, ConflictSets};
pub use error::{MergeError, StoreSide};
pub use execute::execute;
pub use resolve::{resolve, PkRemap, Resolution};
pub use unique::{check as check_unique, ExecutionPlan};

use std::collections::BTreeSet;

use tracing::{debug, info};

use rowsync_core::{ObjRef, OpKind, Operation, SyncMessage, VersionId};
use rowsync_storage::{MessageStore, ReplicaStore, SqliteReplica};

/// What a merge did, for the caller and for the next push.
#[derive(Debug)]
pub struct MergeReport {
    pub version: VersionId,
    pub pk_remaps: Vec<PkRemap>,
    pub reverted_local_deletes: Vec<ObjRef>,
    pub reverted_remote_deletes: Vec<ObjRef>,
    pub dropped_remote: Vec<(ObjRef, OpKind)>,
    pub local_warnings: usize,
}

fn verify_one_op_per_object(
    ops: &[Operation],
    exempt: &[ObjRef],
    journal: &str,
) -> Result<(), MergeError> {
    let mut seen = BTreeSet::new();
    for op in ops {
        if exempt.contains(&op.target) {
            continue;
        }
        if !seen.insert(op.target) {
            return Err(MergeError::Invariant(format!(
                "{journal} journal holds more than one operation for {} after compression",
                op.target
            )));
        }
    }
    Ok(())
}

/// A single bounded merge computation over one replica.
///
/// Holds the replica exclusively for its lifetime; the journal snapshot is
/// taken at entry and no other writer may append during the merge.
pub struct Merger<'a> {
    replica: &'a mut SqliteReplica,
}

impl<'a> Merger<'a> {
    pub fn new(replica: &'a mut SqliteReplica) -> Self {
        Self { replica }
    }

    /// Merge a pull message: compress both journals, detect and resolve
    /// conflicts, check unique constraints, then execute the rewritten
    /// remote set and prune the journal in one transaction.
    pub fn merge(&mut self, message: &SyncMessage) -> Result<MergeReport, MergeError> {
        info!(
            remote_ops = message.operations.len(),
            target_version = %message.target_version,
            "begin merge"
        );
        let registry = self.replica.registry().clone();

        let snapshot = self.replica.journal_snapshot()?;
        let local = compress_local(&snapshot);
        let local_warnings = local.warnings.len();
        let warned: Vec<ObjRef> = local.warnings.iter().map(|w| w.target).collect();

        let tracked: Vec<Operation> = message
            .operations
            .iter()
            .filter(|op| registry.contains(op.target.tag))
            .cloned()
            .collect();
        if tracked.len() != message.operations.len() {
            debug!(
                skipped = message.operations.len() - tracked.len(),
                "skipping remote operations for untracked models"
            );
        }
        let remote = compress_remote(&tracked);

        verify_one_op_per_object(&remote, &[], "remote")?;
        verify_one_op_per_object(&local.ops, &warned, "local")?;

        let resolution = {
            let replica_store = ReplicaStore::new(self.replica);
            let message_store = MessageStore::new(message, &registry);
            let sets = detect(&remote, &local.ops, &replica_store, &message_store)?;
            resolve(
                &remote,
                &local.ops,
                &sets,
                &replica_store,
                &message_store,
                &registry,
            )?
        };

        let Resolution {
            execution,
            journal: resolver_journal,
            pk_remaps,
            reverted_local_deletes,
            reverted_remote_deletes,
            dropped_remote,
        } = resolution;

        let mut journal = local.rewrite;
        journal.extend(resolver_journal);

        let plan = check_unique(execution, self.replica, &registry)?;

        {
            let message_store = MessageStore::new(message, &registry);
            execute(
                self.replica,
                &plan,
                &journal,
                message.target_version,
                &message_store,
            )?;
        }

        info!(version = %message.target_version, "merge committed");
        Ok(MergeReport {
            version: message.target_version,
            pk_remaps,
            reverted_local_deletes,
            reverted_remote_deletes,
            dropped_remote,
            local_warnings,
        })
    }
}
