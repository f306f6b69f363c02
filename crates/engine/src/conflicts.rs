//! Conflict detection between the compressed remote operation set and the
//! compressed local journal. Four disjoint categories; foreign-key tests
//! fetch real column values through the object stores.

use rowsync_core::{ObjRef, OpKind, Operation, Row};
use rowsync_storage::Store;

use crate::error::{MergeError, StoreSide};

/// Pairs of `(remote index, local index)` into the two compressed journals.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConflictSets {
    /// Update/delete on both sides of the same object.
    pub direct: Vec<(usize, usize)>,
    /// Remote delete of an object that local inserts or updates depend on.
    pub dependency: Vec<(usize, usize)>,
    /// Local delete of an object that remote inserts or updates depend on.
    pub reversed_dependency: Vec<(usize, usize)>,
    /// Insert on both sides of the same object reference.
    pub insert: Vec<(usize, usize)>,
}

impl ConflictSets {
    pub fn is_empty(&self) -> bool {
        self.direct.is_empty()
            && self.dependency.is_empty()
            && self.reversed_dependency.is_empty()
            && self.insert.is_empty()
    }

    /// Local indexes conflicting with the given remote operation in one set.
    pub fn locals_for(set: &[(usize, usize)], remote_idx: usize) -> impl Iterator<Item = usize> + '_ {
        set.iter()
            .filter(move |(r, _)| *r == remote_idx)
            .map(|(_, l)| *l)
    }
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

/// Detect all four conflict categories.
///
/// A replica fetch miss for a local insert/update is fatal: the compressed
/// journal entry implies the row exists. A message fetch miss for a remote
/// insert/update breaks the server's construction guarantee.
pub fn detect(
    remote: &[Operation],
    local: &[Operation],
    replica: &dyn Store,
    message: &dyn Store,
) -> Result<ConflictSets, MergeError> {
    let mut sets = ConflictSets::default();

    for (ri, rop) in remote.iter().enumerate() {
        if !matches!(rop.kind(), OpKind::Update | OpKind::Delete) {
            continue;
        }
        for (li, lop) in local.iter().enumerate() {
            if matches!(lop.kind(), OpKind::Update | OpKind::Delete) && rop.target == lop.target {
                sets.direct.push((ri, li));
            }
        }
    }

    // Dependency: the local child's FK columns point at the remote-deleted
    // parent. Column values come from the replica.
    if remote.iter().any(|op| op.kind() == OpKind::Delete) {
        for (li, lop) in local.iter().enumerate() {
            if !matches!(lop.kind(), OpKind::Insert | OpKind::Update) {
                continue;
            }
            let row = fetch_replica(replica, lop.target)?;
            let neighbors = replica.fk_neighbors(lop.target, &row);
            if neighbors.is_empty() {
                continue;
            }
            for (ri, rop) in remote.iter().enumerate() {
                if rop.kind() == OpKind::Delete && neighbors.contains(&rop.target) {
                    sets.dependency.push((ri, li));
                }
            }
        }
    }

    // Reversed dependency: the remote child points at the locally-deleted
    // parent. Column values come from the message snapshots.
    if local.iter().any(|op| op.kind() == OpKind::Delete) {
        for (ri, rop) in remote.iter().enumerate() {
            if !matches!(rop.kind(), OpKind::Insert | OpKind::Update) {
                continue;
            }
            let row = fetch_message(message, rop.target)?;
            let neighbors = message.fk_neighbors(rop.target, &row);
            if neighbors.is_empty() {
                continue;
            }
            for (li, lop) in local.iter().enumerate() {
                if lop.kind() == OpKind::Delete && neighbors.contains(&lop.target) {
                    sets.reversed_dependency.push((ri, li));
                }
            }
        }
    }

    for (ri, rop) in remote.iter().enumerate() {
        if rop.kind() != OpKind::Insert {
            continue;
        }
        for (li, lop) in local.iter().enumerate() {
            if lop.kind() == OpKind::Insert && rop.target == lop.target {
                sets.insert.push((ri, li));
            }
        }
    }

    // Order pairs by remote sequence so resolution replays deterministically.
    sets.dependency.sort_unstable();
    sets.reversed_dependency.sort_unstable();

    Ok(sets)
}
