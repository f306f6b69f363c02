use rowsync_core::{
    ColumnType, FieldValue, ObjRef, OpPayload, Operation, PullRequest, Row, RowDelta,
    SchemaRegistry, SyncMessage, TableSchema, TypeTag, VersionId,
};
use rowsync_engine::{MergeError, MergeReport, Merger};
use rowsync_storage::{SqliteReplica, StorageError};

pub const AUTHORS: TypeTag = TypeTag::new(1);
pub const BOOKS: TypeTag = TypeTag::new(2);

/// The fixture schema every suite runs against: authors with a unique
/// email, books referencing authors by FK.
pub fn test_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry.register(
        TableSchema::new(AUTHORS, "authors", "Author", "id")
            .column("name", ColumnType::Text, false)
            .column("email", ColumnType::Text, true)
            .unique("uq_authors_email", &["email"]),
    );
    registry.register(
        TableSchema::new(BOOKS, "books", "Book", "id")
            .column("title", ColumnType::Text, false)
            .column("author_id", ColumnType::Integer, true)
            .foreign_key("author_id", AUTHORS),
    );
    registry
}

pub fn author(pk: i64) -> ObjRef {
    ObjRef::new(AUTHORS, pk)
}

pub fn book(pk: i64) -> ObjRef {
    ObjRef::new(BOOKS, pk)
}

pub fn author_row(name: &str, email: Option<&str>) -> Row {
    let mut row = Row::new();
    row.set("name", FieldValue::Text(name.into()));
    row.set(
        "email",
        email
            .map(|e| FieldValue::Text(e.into()))
            .unwrap_or(FieldValue::Null),
    );
    row
}

pub fn book_row(title: &str, author_id: Option<i64>) -> Row {
    let mut row = Row::new();
    row.set("title", FieldValue::Text(title.into()));
    row.set(
        "author_id",
        author_id.map(FieldValue::Integer).unwrap_or(FieldValue::Null),
    );
    row
}

pub fn delta(pairs: &[(&str, FieldValue)]) -> RowDelta {
    let mut delta = RowDelta::new();
    for (column, value) in pairs {
        delta.set(column.to_string(), value.clone());
    }
    delta
}

pub fn text(s: &str) -> FieldValue {
    FieldValue::Text(s.into())
}

/// A node under test: an in-memory replica whose mutation helpers both
/// apply the change and journal it, the way the tracking layer would.
pub struct TestPeer {
    pub replica: SqliteReplica,
}

impl TestPeer {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            replica: SqliteReplica::open_in_memory(test_registry())?,
        })
    }

    /// Install a row as already-synchronized state, with no journal entry.
    pub fn seed(&mut self, target: ObjRef, row: Row) -> Result<(), StorageError> {
        self.replica.insert_row(target, &row)
    }

    pub fn insert(&mut self, target: ObjRef, row: Row) -> Result<i64, StorageError> {
        self.replica.insert_row(target, &row)?;
        self.replica.record_op(target, OpPayload::Insert { row })
    }

    pub fn update(&mut self, target: ObjRef, delta: RowDelta) -> Result<i64, StorageError> {
        self.replica.update_row(target, &delta)?;
        self.replica.record_op(target, OpPayload::Update { delta })
    }

    pub fn delete(&mut self, target: ObjRef) -> Result<i64, StorageError> {
        self.replica.delete_row(target)?;
        self.replica.record_op(target, OpPayload::Delete)
    }

    pub fn journal(&self) -> Result<Vec<Operation>, StorageError> {
        self.replica.journal_snapshot()
    }

    pub fn fetch(&self, target: ObjRef) -> Result<Option<Row>, StorageError> {
        self.replica.fetch_row(target)
    }

    pub fn merge(&mut self, message: &SyncMessage) -> Result<MergeReport, MergeError> {
        Merger::new(&mut self.replica).merge(message)
    }

    /// The request this node would send to start a pull: its synchronized
    /// position plus the compressed journal.
    pub fn pull_request(&self) -> Result<PullRequest, StorageError> {
        let snapshot = self.replica.journal_snapshot()?;
        let compressed = rowsync_engine::compress_local(&snapshot);
        let mut request = PullRequest::new(self.replica.version()?);
        for op in compressed.ops {
            request.add_operation(op);
        }
        Ok(request)
    }
}

/// Fluent construction of server pull messages for tests. Insert and
/// update operations carry their snapshot the way the server builds them;
/// extra parent snapshots ride along via `snapshot`.
pub struct MessageBuilder {
    message: SyncMessage,
    seq: i64,
}

impl MessageBuilder {
    pub fn new(target_version: i64) -> Self {
        Self {
            message: SyncMessage::new(VersionId::new(target_version)),
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    pub fn insert(mut self, target: ObjRef, row: Row) -> Self {
        let seq = self.next_seq();
        self.message
            .add_operation(Operation::insert(seq, target, row.clone()));
        self.message.add_object(target, row);
        self
    }

    pub fn update(mut self, target: ObjRef, delta: RowDelta, snapshot: Row) -> Self {
        let seq = self.next_seq();
        self.message
            .add_operation(Operation::update(seq, target, delta));
        self.message.add_object(target, snapshot);
        self
    }

    /// An update with no backing snapshot, for exercising the dialect
    /// rules and integrity errors.
    pub fn bare_update(mut self, target: ObjRef, delta: RowDelta) -> Self {
        let seq = self.next_seq();
        self.message
            .add_operation(Operation::update(seq, target, delta));
        self
    }

    pub fn delete(mut self, target: ObjRef) -> Self {
        let seq = self.next_seq();
        self.message.add_operation(Operation::delete(seq, target));
        self
    }

    pub fn bare_insert(mut self, target: ObjRef, row: Row) -> Self {
        let seq = self.next_seq();
        self.message
            .add_operation(Operation::insert(seq, target, row));
        self
    }

    pub fn snapshot(mut self, target: ObjRef, row: Row) -> Self {
        self.message.add_object(target, row);
        self
    }

    pub fn build(self) -> SyncMessage {
        self.message
    }
}
