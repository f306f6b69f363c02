use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;

use rowsync_core::{
    ColumnType, FieldValue, JournalRewrite, ObjRef, OpPayload, Operation, Row, RowDelta,
    SchemaRegistry, TableSchema, TypeTag, VersionId,
};

use crate::error::StorageError;

fn to_sql_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Integer(n) => Value::Integer(*n),
        FieldValue::Float(f) => Value::Real(*f),
        FieldValue::Text(s) => Value::Text(s.clone()),
        FieldValue::Boolean(b) => Value::Integer(i64::from(*b)),
        FieldValue::Bytes(b) => Value::Blob(b.clone()),
    }
}

fn read_value(row: &rusqlite::Row, idx: usize, ty: ColumnType) -> rusqlite::Result<FieldValue> {
    if matches!(row.get_ref(idx)?, ValueRef::Null) {
        return Ok(FieldValue::Null);
    }
    Ok(match ty {
        ColumnType::Integer => FieldValue::Integer(row.get(idx)?),
        ColumnType::Boolean => FieldValue::Boolean(row.get::<_, i64>(idx)? != 0),
        ColumnType::Float => FieldValue::Float(row.get(idx)?),
        ColumnType::Text => FieldValue::Text(row.get(idx)?),
        ColumnType::Bytes => FieldValue::Bytes(row.get(idx)?),
    })
}

/// The local database replica: the synchronized data tables plus the
/// internal journal and version tables, behind one connection.
pub struct SqliteReplica {
    conn: Connection,
    registry: SchemaRegistry,
}

impl SqliteReplica {
    pub fn open(path: &str, registry: SchemaRegistry) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn, &registry)?;
        Ok(Self { conn, registry })
    }

    pub fn open_in_memory(registry: SchemaRegistry) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn, &registry)?;
        Ok(Self { conn, registry })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Expose the connection for transaction control from the merge engine.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn schema_for(&self, tag: TypeTag) -> Result<&TableSchema, StorageError> {
        self.registry.get(tag).ok_or(StorageError::Untracked(tag))
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    // ========================================================================
    // Row access
    // ========================================================================

    pub fn fetch_row(&self, target: ObjRef) -> Result<Option<Row>, StorageError> {
        let schema = self.schema_for(target.tag)?;
        let columns = schema
            .columns
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {columns} FROM \"{}\" WHERE \"{}\" = ?1",
            schema.table_name, schema.pk_column
        );
        let result = self.conn.query_row(&sql, rusqlite::params![target.pk], |r| {
            let mut row = Row::new();
            for (idx, col) in schema.columns.iter().enumerate() {
                row.set(col.name.clone(), read_value(r, idx, col.ty)?);
            }
            Ok(row)
        });
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    pub fn row_exists(&self, target: ObjRef) -> Result<bool, StorageError> {
        let schema = self.schema_for(target.tag)?;
        let sql = format!(
            "SELECT 1 FROM \"{}\" WHERE \"{}\" = ?1",
            schema.table_name, schema.pk_column
        );
        let result = self
            .conn
            .query_row(&sql, rusqlite::params![target.pk], |_| Ok(()));
        match result {
            Ok(()) => Ok(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    pub fn insert_row(&self, target: ObjRef, row: &Row) -> Result<(), StorageError> {
        let schema = self.schema_for(target.tag)?;
        let mut names = vec![format!("\"{}\"", schema.pk_column)];
        let mut values = vec![Value::Integer(target.pk)];
        for (column, value) in row.iter() {
            if schema.column_def(column).is_none() {
                return Err(StorageError::UnknownColumn {
                    table: schema.table_name.clone(),
                    column: column.clone(),
                });
            }
            names.push(format!("\"{column}\""));
            values.push(to_sql_value(value));
        }
        let placeholders = (1..=names.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            schema.table_name,
            names.join(", "),
            placeholders
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(())
    }

    /// Apply a field-level delta. Returns the number of rows affected, so
    /// the caller can tell an update of a vanished row from a real one.
    pub fn update_row(&self, target: ObjRef, delta: &RowDelta) -> Result<usize, StorageError> {
        let schema = self.schema_for(target.tag)?;
        if delta.is_empty() {
            return Ok(usize::from(self.row_exists(target)?));
        }
        let mut sets = Vec::new();
        let mut values = Vec::new();
        for (idx, (column, value)) in delta.iter().enumerate() {
            if schema.column_def(column).is_none() {
                return Err(StorageError::UnknownColumn {
                    table: schema.table_name.clone(),
                    column: column.clone(),
                });
            }
            sets.push(format!("\"{column}\" = ?{}", idx + 1));
            values.push(to_sql_value(value));
        }
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE \"{}\" = ?{}",
            schema.table_name,
            sets.join(", "),
            schema.pk_column,
            values.len() + 1
        );
        values.push(Value::Integer(target.pk));
        let affected = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(affected)
    }

    /// Returns whether a row was actually deleted.
    pub fn delete_row(&self, target: ObjRef) -> Result<bool, StorageError> {
        let schema = self.schema_for(target.tag)?;
        let sql = format!(
            "DELETE FROM \"{}\" WHERE \"{}\" = ?1",
            schema.table_name, schema.pk_column
        );
        let affected = self.conn.execute(&sql, rusqlite::params![target.pk])?;
        Ok(affected > 0)
    }

    /// Largest primary key currently in the table, 0 when empty. Keys are
    /// never recycled, so this is also the high-water mark.
    pub fn max_pk(&self, tag: TypeTag) -> Result<i64, StorageError> {
        let schema = self.schema_for(tag)?;
        let sql = format!(
            "SELECT COALESCE(MAX(\"{}\"), 0) FROM \"{}\"",
            schema.pk_column, schema.table_name
        );
        let max: i64 = self.conn.query_row(&sql, [], |r| r.get(0))?;
        Ok(max)
    }

    /// Probe a unique constraint: the primary key of the row currently
    /// holding these column values, if any. Null values never match.
    pub fn find_by_values(
        &self,
        tag: TypeTag,
        columns: &[String],
        values: &[FieldValue],
    ) -> Result<Option<i64>, StorageError> {
        let schema = self.schema_for(tag)?;
        let mut clauses = Vec::new();
        let mut bound = Vec::new();
        for (idx, (column, value)) in columns.iter().zip(values).enumerate() {
            clauses.push(format!("\"{column}\" = ?{}", idx + 1));
            bound.push(to_sql_value(value));
        }
        let sql = format!(
            "SELECT \"{}\" FROM \"{}\" WHERE {} LIMIT 1",
            schema.pk_column,
            schema.table_name,
            clauses.join(" AND ")
        );
        let result = self
            .conn
            .query_row(&sql, rusqlite::params_from_iter(bound), |r| r.get(0));
        match result {
            Ok(pk) => Ok(Some(pk)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    /// Move a row to a new primary key. Dependent FK columns are the
    /// caller's concern; the merge rewrites those through operation
    /// payloads before anything is executed.
    pub fn update_pk(&self, tag: TypeTag, old_pk: i64, new_pk: i64) -> Result<(), StorageError> {
        let schema = self.schema_for(tag)?;
        let sql = format!(
            "UPDATE \"{}\" SET \"{}\" = ?1 WHERE \"{}\" = ?2",
            schema.table_name, schema.pk_column, schema.pk_column
        );
        self.conn.execute(&sql, rusqlite::params![new_pk, old_pk])?;
        Ok(())
    }

    // ========================================================================
    // Journal
    // ========================================================================

    /// Append an unversioned operation to the journal, assigning the next
    /// sequence number. This is the journal-writer entry point the tracking
    /// layer calls after every local mutation.
    pub fn record_op(&self, target: ObjRef, payload: OpPayload) -> Result<i64, StorageError> {
        let next: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(sequence_no), 0) + 1 FROM sync_operations",
            [],
            |r| r.get(0),
        )?;
        let blob = payload.to_msgpack()?;
        self.conn.execute(
            "INSERT INTO sync_operations (sequence_no, type_tag, row_pk, command, payload, version_id)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            rusqlite::params![
                next,
                target.tag.raw(),
                target.pk,
                payload.kind().letter().to_string(),
                blob,
            ],
        )?;
        Ok(next)
    }

    /// Snapshot of the unversioned journal, ordered by sequence number.
    pub fn journal_snapshot(&self) -> Result<Vec<Operation>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence_no, type_tag, row_pk, payload FROM sync_operations
             WHERE version_id IS NULL ORDER BY sequence_no ASC",
        )?;
        let rows = stmt.query_map([], |r| {
            let sequence_no: i64 = r.get(0)?;
            let tag: u32 = r.get(1)?;
            let pk: i64 = r.get(2)?;
            let blob: Vec<u8> = r.get(3)?;
            Ok((sequence_no, tag, pk, blob))
        })?;
        let mut ops = Vec::new();
        for row in rows {
            let (sequence_no, tag, pk, blob) = row?;
            let payload = OpPayload::from_msgpack(&blob)?;
            ops.push(Operation {
                sequence_no,
                target: ObjRef::new(TypeTag::new(tag), pk),
                payload,
            });
        }
        Ok(ops)
    }

    /// Apply a merge's journal edits: removals, payload rewrites, and
    /// reinsertion operations taking the lowest sequence slots (surviving
    /// rows shift up to make room, preserving their relative order).
    pub fn apply_rewrite(&self, rewrite: &JournalRewrite) -> Result<(), StorageError> {
        for seq in &rewrite.remove {
            self.conn.execute(
                "DELETE FROM sync_operations WHERE sequence_no = ?1",
                rusqlite::params![seq],
            )?;
        }
        for (seq, payload) in &rewrite.replace {
            let blob = payload.to_msgpack()?;
            self.conn.execute(
                "UPDATE sync_operations SET command = ?1, payload = ?2 WHERE sequence_no = ?3",
                rusqlite::params![payload.kind().letter().to_string(), blob, seq],
            )?;
        }
        if !rewrite.prepend.is_empty() {
            let n = rewrite.prepend.len() as i64;
            let base: i64 = self.conn.query_row(
                "SELECT COALESCE(MIN(sequence_no), 1) FROM sync_operations WHERE version_id IS NULL",
                [],
                |r| r.get(0),
            )?;
            // Shift in two passes through negative space so the primary key
            // never transiently collides.
            self.conn.execute(
                "UPDATE sync_operations SET sequence_no = -(sequence_no + ?1) WHERE version_id IS NULL",
                rusqlite::params![n],
            )?;
            self.conn.execute(
                "UPDATE sync_operations SET sequence_no = -sequence_no WHERE sequence_no < 0",
                [],
            )?;
            for (offset, (target, payload)) in rewrite.prepend.iter().enumerate() {
                let blob = payload.to_msgpack()?;
                self.conn.execute(
                    "INSERT INTO sync_operations (sequence_no, type_tag, row_pk, command, payload, version_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                    rusqlite::params![
                        base + offset as i64,
                        target.tag.raw(),
                        target.pk,
                        payload.kind().letter().to_string(),
                        blob,
                    ],
                )?;
            }
        }
        Ok(())
    }

    /// Mark journal rows as covered by a version. Called by the push
    /// session once the server confirms.
    pub fn mark_versioned(&self, seqs: &[i64], version: VersionId) -> Result<(), StorageError> {
        for seq in seqs {
            self.conn.execute(
                "UPDATE sync_operations SET version_id = ?1 WHERE sequence_no = ?2",
                rusqlite::params![version.raw(), seq],
            )?;
        }
        Ok(())
    }

    /// Drop journal rows already covered by a version, to free space.
    pub fn trim_journal(&self) -> Result<usize, StorageError> {
        let affected = self
            .conn
            .execute("DELETE FROM sync_operations WHERE version_id IS NOT NULL", [])?;
        Ok(affected)
    }

    // ========================================================================
    // Version row
    // ========================================================================

    pub fn version(&self) -> Result<Option<VersionId>, StorageError> {
        let raw: Option<i64> =
            self.conn
                .query_row("SELECT version_id FROM sync_version WHERE id = 1", [], |r| {
                    r.get(0)
                })?;
        Ok(raw.map(VersionId::new))
    }

    pub fn advance_version(&self, version: VersionId) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE sync_version SET version_id = ?1 WHERE id = 1",
            rusqlite::params![version.raw()],
        )?;
        Ok(())
    }
}

/// Sanity check used by the executor's idempotent-insert path: two images
/// agree when every schema column reads the same, treating absent as null.
pub fn rows_equivalent(schema: &TableSchema, a: &Row, b: &Row) -> bool {
    schema.columns.iter().all(|col| {
        let va = a.get(&col.name).unwrap_or(&FieldValue::Null);
        let vb = b.get(&col.name).unwrap_or(&FieldValue::Null);
        va == vb
    })
}
