use rowsync_core::{FieldValue, OpKind};
use rowsync_engine::MergeError;
use rowsync_harness::{
    author, author_row, book, book_row, delta, text, MessageBuilder, TestPeer,
};

// ============================================================================
// Round-trip laws
// ============================================================================

#[test]
fn empty_journal_applies_remote_exactly() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(2), author_row("upd", None))?;
    peer.seed(author(3), author_row("gone", None))?;

    let message = MessageBuilder::new(5)
        .insert(author(1), author_row("new", Some("n@example.org")))
        .update(
            author(2),
            delta(&[("name", text("upd 2"))]),
            author_row("upd 2", None),
        )
        .delete(author(3))
        .build();
    let report = peer.merge(&message)?;

    assert_eq!(report.version.raw(), 5);
    assert!(report.pk_remaps.is_empty());
    assert!(report.dropped_remote.is_empty());

    assert_eq!(
        peer.fetch(author(1))?.unwrap().get("name"),
        Some(&text("new"))
    );
    assert_eq!(
        peer.fetch(author(2))?.unwrap().get("name"),
        Some(&text("upd 2"))
    );
    assert!(peer.fetch(author(3))?.is_none());
    assert!(peer.journal()?.is_empty());
    Ok(())
}

#[test]
fn empty_message_preserves_replica_and_journal() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(1), author_row("base", None))?;
    peer.insert(author(2), author_row("mine", None))?;

    peer.merge(&MessageBuilder::new(3).build())?;

    assert_eq!(
        peer.fetch(author(1))?.unwrap().get("name"),
        Some(&text("base"))
    );
    assert_eq!(
        peer.fetch(author(2))?.unwrap().get("name"),
        Some(&text("mine"))
    );
    let journal = peer.journal()?;
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].target, author(2));
    Ok(())
}

// ============================================================================
// Scenario 1: dependency revert
// ============================================================================

#[test]
fn dependency_revert_keeps_parent_and_child() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(1), author_row("parent", None))?;
    peer.insert(book(10), book_row("child", Some(1)))?;

    let message = MessageBuilder::new(2)
        .delete(author(1))
        .snapshot(author(1), author_row("parent", None))
        .build();
    let report = peer.merge(&message)?;

    assert_eq!(report.reverted_remote_deletes, vec![author(1)]);
    assert!(report.reverted_local_deletes.is_empty());

    // Both rows live; the journal now pushes the parent back first.
    assert!(peer.fetch(author(1))?.is_some());
    assert!(peer.fetch(book(10))?.is_some());
    let journal = peer.journal()?;
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[0].target, author(1));
    assert_eq!(journal[0].kind(), OpKind::Insert);
    assert_eq!(journal[1].target, book(10));
    assert_eq!(journal[1].kind(), OpKind::Insert);
    Ok(())
}

// ============================================================================
// Scenario 2: reversed-dependency revert
// ============================================================================

#[test]
fn reversed_dependency_revert_restores_parent() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(1), author_row("parent", Some("p@example.org")))?;
    peer.seed(book(10), book_row("child", Some(1)))?;
    peer.delete(author(1))?;

    let message = MessageBuilder::new(2)
        .update(
            book(10),
            delta(&[("title", text("child 2"))]),
            book_row("child 2", Some(1)),
        )
        .snapshot(author(1), author_row("parent", Some("p@example.org")))
        .build();
    let report = peer.merge(&message)?;

    assert_eq!(report.reverted_local_deletes, vec![author(1)]);

    // The parent is back from the snapshot, the child carries the remote
    // update, and the journal no longer holds the delete.
    let parent = peer.fetch(author(1))?.expect("parent reinserted");
    assert_eq!(parent.get("name"), Some(&text("parent")));
    assert_eq!(
        peer.fetch(book(10))?.unwrap().get("title"),
        Some(&text("child 2"))
    );
    assert!(peer.journal()?.is_empty());
    Ok(())
}

// ============================================================================
// Scenario 3: insert-insert PK remap
// ============================================================================

#[test]
fn insert_insert_remaps_remote_and_dependent_fks() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(12), author_row("ceiling", None))?;
    peer.insert(author(7), author_row("local", Some("l@example.org")))?;

    let message = MessageBuilder::new(2)
        .insert(author(7), author_row("remote", Some("r@example.org")))
        .insert(book(20), book_row("remote book", Some(7)))
        .build();
    let report = peer.merge(&message)?;

    assert_eq!(report.pk_remaps.len(), 1);
    let remap = report.pk_remaps[0];
    assert_eq!(remap.old_pk, 7);
    assert_eq!(remap.new_pk, 13);

    // Local insert untouched, remote insert moved past the high-water mark.
    assert_eq!(
        peer.fetch(author(7))?.unwrap().get("name"),
        Some(&text("local"))
    );
    assert_eq!(
        peer.fetch(author(13))?.unwrap().get("name"),
        Some(&text("remote"))
    );
    // The remote child's FK followed the remap.
    assert_eq!(
        peer.fetch(book(20))?.unwrap().get("author_id"),
        Some(&FieldValue::Integer(13))
    );
    // The local journal still pushes the local author later.
    let journal = peer.journal()?;
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].target, author(7));
    Ok(())
}

// ============================================================================
// Scenario 4: update-update, local wins
// ============================================================================

#[test]
fn update_update_keeps_local_value() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(1), author_row("base", None))?;
    peer.update(author(1), delta(&[("name", text("local"))]))?;

    let message = MessageBuilder::new(2)
        .update(
            author(1),
            delta(&[("name", text("remote"))]),
            author_row("remote", None),
        )
        .build();
    let report = peer.merge(&message)?;

    assert_eq!(report.dropped_remote, vec![(author(1), OpKind::Update)]);
    assert_eq!(
        peer.fetch(author(1))?.unwrap().get("name"),
        Some(&text("local")),
        "the replica keeps the local value"
    );
    // The local update stays pending for the next push.
    let journal = peer.journal()?;
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].kind(), OpKind::Update);
    Ok(())
}

// ============================================================================
// Scenario 5: delete-delete
// ============================================================================

#[test]
fn delete_delete_confirms_and_prunes() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(1), author_row("doomed", None))?;
    peer.delete(author(1))?;

    let message = MessageBuilder::new(2).delete(author(1)).build();
    let report = peer.merge(&message)?;

    assert_eq!(report.dropped_remote, vec![(author(1), OpKind::Delete)]);
    assert!(peer.fetch(author(1))?.is_none());
    assert!(peer.journal()?.is_empty(), "the confirmed delete is pruned");
    Ok(())
}

// ============================================================================
// Scenario 6: local i,u,u,d against a non-empty message
// ============================================================================

#[test]
fn ephemeral_local_object_cannot_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.insert(author(5), author_row("eph", None))?;
    peer.update(author(5), delta(&[("name", text("eph 2"))]))?;
    peer.update(author(5), delta(&[("name", text("eph 3"))]))?;
    peer.delete(author(5))?;

    // A remote delete of the same reference would be a direct conflict if
    // the compressed sequence hadn't vanished.
    let message = MessageBuilder::new(2).delete(author(5)).build();
    let report = peer.merge(&message)?;

    assert!(report.dropped_remote.is_empty());
    assert!(report.reverted_remote_deletes.is_empty());
    assert!(peer.journal()?.is_empty());
    assert!(peer.fetch(author(5))?.is_none());
    Ok(())
}

// ============================================================================
// Remote delete vs local update / remote update vs local delete
// ============================================================================

#[test]
fn remote_delete_vs_local_update_reverts_the_delete() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(1), author_row("base", None))?;
    peer.update(author(1), delta(&[("name", text("kept"))]))?;

    let message = MessageBuilder::new(2).delete(author(1)).build();
    let report = peer.merge(&message)?;

    assert_eq!(report.reverted_remote_deletes, vec![author(1)]);
    assert_eq!(
        peer.fetch(author(1))?.unwrap().get("name"),
        Some(&text("kept"))
    );
    // The journal entry became an insert so the push recreates the row
    // on the server.
    let journal = peer.journal()?;
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].kind(), OpKind::Insert);
    assert_eq!(journal[0].target, author(1));
    Ok(())
}

#[test]
fn remote_update_vs_local_delete_reverts_the_delete() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(1), author_row("base", None))?;
    peer.delete(author(1))?;

    let message = MessageBuilder::new(2)
        .update(
            author(1),
            delta(&[("name", text("fresh"))]),
            author_row("fresh", None),
        )
        .build();
    let report = peer.merge(&message)?;

    assert_eq!(report.reverted_local_deletes, vec![author(1)]);
    // The remote update materialized the row from the snapshot.
    assert_eq!(
        peer.fetch(author(1))?.unwrap().get("name"),
        Some(&text("fresh"))
    );
    assert!(peer.journal()?.is_empty());
    Ok(())
}

// ============================================================================
// Atomicity and determinism
// ============================================================================

#[test]
fn failed_execution_leaves_replica_and_journal_untouched()
-> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(1), author_row("bob", None))?;
    peer.insert(author(2), author_row("mine", None))?;

    // A remote insert colliding with an unjournaled row is not an insert
    // conflict; execution hits the existing, different row and fails.
    let message = MessageBuilder::new(9)
        .insert(author(1), author_row("impostor", None))
        .build();
    let err = peer.merge(&message).unwrap_err();
    assert!(matches!(err, MergeError::ExecutionFailed(_)));

    assert_eq!(
        peer.fetch(author(1))?.unwrap().get("name"),
        Some(&text("bob"))
    );
    let journal = peer.journal()?;
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].target, author(2));
    assert_eq!(peer.replica.version()?, None, "version did not advance");
    Ok(())
}

#[test]
fn identical_inputs_merge_identically() -> Result<(), Box<dyn std::error::Error>> {
    let build_peer = || -> Result<TestPeer, Box<dyn std::error::Error>> {
        let mut peer = TestPeer::new()?;
        peer.seed(author(12), author_row("ceiling", None))?;
        peer.insert(author(7), author_row("local", Some("l@example.org")))?;
        peer.update(author(12), delta(&[("name", text("c2"))]))?;
        Ok(peer)
    };
    let message = MessageBuilder::new(3)
        .insert(author(7), author_row("remote", Some("r@example.org")))
        .update(
            author(12),
            delta(&[("name", text("r12"))]),
            author_row("r12", None),
        )
        .build();

    let mut a = build_peer()?;
    let mut b = build_peer()?;
    let ra = a.merge(&message)?;
    let rb = b.merge(&message)?;

    assert_eq!(ra.pk_remaps, rb.pk_remaps);
    assert_eq!(ra.dropped_remote, rb.dropped_remote);
    assert_eq!(ra.version, rb.version);
    assert_eq!(a.fetch(author(7))?, b.fetch(author(7))?);
    assert_eq!(a.fetch(author(12))?, b.fetch(author(12))?);
    assert_eq!(a.fetch(author(13))?, b.fetch(author(13))?);
    assert_eq!(a.journal()?, b.journal()?);
    Ok(())
}

// ============================================================================
// Unique constraints
// ============================================================================

#[test]
fn cross_origin_unique_collision_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(1), author_row("holder", Some("taken@example.org")))?;

    let message = MessageBuilder::new(2)
        .insert(author(3), author_row("claimer", Some("taken@example.org")))
        .build();
    let err = peer.merge(&message).unwrap_err();
    match err {
        MergeError::UniqueConstraintCollision {
            constraint,
            targets,
            values,
        } => {
            assert_eq!(constraint, "uq_authors_email");
            assert_eq!(targets, vec![author(3), author(1)]);
            assert_eq!(values, vec![text("taken@example.org")]);
        }
        other => panic!("expected UniqueConstraintCollision, got {other:?}"),
    }

    // Nothing was applied.
    assert!(peer.fetch(author(3))?.is_none());
    assert_eq!(peer.replica.version()?, None);
    Ok(())
}

#[test]
fn compressed_swap_resolves_through_two_phases() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.seed(author(1), author_row("a", Some("a@example.org")))?;
    peer.seed(author(2), author_row("b", Some("b@example.org")))?;

    // The server history swapped the two emails through an intermediate
    // state compression discarded.
    let message = MessageBuilder::new(2)
        .update(
            author(1),
            delta(&[("email", text("b@example.org"))]),
            author_row("a", Some("b@example.org")),
        )
        .update(
            author(2),
            delta(&[("email", text("a@example.org"))]),
            author_row("b", Some("a@example.org")),
        )
        .build();
    peer.merge(&message)?;

    assert_eq!(
        peer.fetch(author(1))?.unwrap().get("email"),
        Some(&text("b@example.org"))
    );
    assert_eq!(
        peer.fetch(author(2))?.unwrap().get("email"),
        Some(&text("a@example.org"))
    );
    Ok(())
}

#[test]
fn unique_collision_on_non_text_column_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
    use rowsync_core::{ColumnType, SchemaRegistry, TableSchema, TypeTag};
    use rowsync_storage::SqliteReplica;

    // A schema whose unique column is an integer cannot host a
    // transaction-scoped placeholder.
    const SLOTS: TypeTag = TypeTag::new(9);
    let mut registry = SchemaRegistry::new();
    registry.register(
        TableSchema::new(SLOTS, "slots", "Slot", "id")
            .column("position", ColumnType::Integer, false)
            .unique("uq_slots_position", &["position"]),
    );
    let mut replica = SqliteReplica::open_in_memory(registry)?;

    let slot = |pk: i64| rowsync_core::ObjRef::new(SLOTS, pk);
    let slot_row = |pos: i64| {
        let mut row = rowsync_core::Row::new();
        row.set("position", FieldValue::Integer(pos));
        row
    };
    replica.insert_row(slot(1), &slot_row(1))?;
    replica.insert_row(slot(2), &slot_row(2))?;

    let message = MessageBuilder::new(2)
        .update(slot(1), delta(&[("position", FieldValue::Integer(2))]), slot_row(2))
        .update(slot(2), delta(&[("position", FieldValue::Integer(1))]), slot_row(1))
        .build();

    let err = rowsync_engine::Merger::new(&mut replica)
        .merge(&message)
        .unwrap_err();
    assert!(matches!(err, MergeError::UniqueConstraintCollision { .. }));
    Ok(())
}
