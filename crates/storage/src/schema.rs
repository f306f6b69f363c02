use rusqlite::Connection;

use rowsync_core::{SchemaRegistry, TableSchema};

use crate::error::StorageError;

/// Create the internal synchronization tables and the data tables described
/// by the registry. Idempotent.
pub fn init_schema(conn: &Connection, registry: &SchemaRegistry) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(INTERNAL_SQL)?;
    for schema in registry.iter() {
        conn.execute_batch(&table_ddl(schema))?;
    }
    Ok(())
}

const INTERNAL_SQL: &str = "
CREATE TABLE IF NOT EXISTS sync_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version_id INTEGER
);
INSERT OR IGNORE INTO sync_version (id, version_id) VALUES (1, NULL);

CREATE TABLE IF NOT EXISTS sync_operations (
    sequence_no INTEGER PRIMARY KEY,
    type_tag INTEGER NOT NULL,
    row_pk INTEGER NOT NULL,
    command TEXT NOT NULL CHECK (command IN ('i', 'u', 'd')),
    payload BLOB NOT NULL,
    version_id INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sync_operations_target ON sync_operations (type_tag, row_pk);
CREATE INDEX IF NOT EXISTS idx_sync_operations_version ON sync_operations (version_id);
";

/// DDL for one synchronized data table: integer primary key, typed
/// columns, named unique constraints. FK columns stay plain integers;
/// referential enforcement is the application schema's concern.
fn table_ddl(schema: &TableSchema) -> String {
    let mut parts = vec![format!("    \"{}\" INTEGER PRIMARY KEY", schema.pk_column)];
    for col in &schema.columns {
        let not_null = if col.nullable { "" } else { " NOT NULL" };
        parts.push(format!("    \"{}\" {}{}", col.name, col.ty.sql(), not_null));
    }
    for uc in &schema.unique_constraints {
        let columns = uc
            .columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("    CONSTRAINT \"{}\" UNIQUE ({})", uc.name, columns));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (\n{}\n);",
        schema.table_name,
        parts.join(",\n")
    )
}
