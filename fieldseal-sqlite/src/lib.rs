//! SQLite [`RowStore`] for `FieldSeal`.
//!
//! Each call to [`RowStore::apply`] runs in its own transaction, and every
//! write is conditional on the encrypted column still holding the value that
//! was read, so rows changed by live traffic in the meantime are left alone.

#![warn(clippy::pedantic, clippy::nursery)]

use fieldseal::config::ColumnPlan;
use fieldseal::error::StoreError;
use fieldseal::store::{CellUpdate, RowStore, StoredRow};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Row store over a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates a database file.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(backend)?;
        Ok(Self::from_connection(conn))
    }

    /// Opens an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if `SQLite` cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Connection::open_in_memory().map(Self::from_connection).map_err(backend)
    }

    /// Wraps an existing connection.
    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn: Mutex::new(conn) }
    }

    /// Runs arbitrary SQL, e.g. schema setup.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if any statement fails.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(sql).map_err(backend)
    }

    /// Reads one text cell, for inspection and tests.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MissingColumn` for an unknown column.
    pub fn read_text(
        &self,
        table: &str,
        primary_key: &str,
        id: i64,
        column: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        require_column(&conn, table, column)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            quote(column),
            quote(table),
            quote(primary_key)
        );
        let value = conn
            .query_row(&sql, params![id], |row| Ok(text_value(row.get_ref(0)?)))
            .optional()
            .map_err(backend)?;
        Ok(value.flatten())
    }

    /// Whether a table has a column.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the schema cannot be read.
    pub fn has_column(&self, table: &str, column: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        Ok(columns(&conn, table)?.iter().any(|c| c == column))
    }
}

impl RowStore for SqliteStore {
    fn count_rows(&self, plan: &ColumnPlan) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        require_table(&conn, &plan.table)?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote(&plan.table));
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0)).map_err(backend)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn scan(
        &self,
        plan: &ColumnPlan,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let conn = self.conn.lock();
        require_column(&conn, &plan.table, &plan.primary_key)?;
        require_column(&conn, &plan.table, &plan.encrypted_column)?;
        let plaintext = match &plan.plaintext_column {
            Some(column) => {
                require_column(&conn, &plan.table, column)?;
                quote(column)
            }
            None => "NULL".to_string(),
        };

        let sql = format!(
            "SELECT {pk}, {plaintext}, {enc} FROM {table} \
             WHERE ?1 IS NULL OR {pk} > ?1 ORDER BY {pk} LIMIT ?2",
            pk = quote(&plan.primary_key),
            enc = quote(&plan.encrypted_column),
            table = quote(&plan.table),
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(params![after, limit], |row| {
                Ok(StoredRow {
                    id: row.get(0)?,
                    plaintext: bytes_value(row.get_ref(1)?),
                    encrypted: text_value(row.get_ref(2)?),
                })
            })
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        Ok(rows)
    }

    fn apply(&self, plan: &ColumnPlan, updates: &[CellUpdate]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        require_column(&conn, &plan.table, &plan.encrypted_column)?;
        let sql = format!(
            "UPDATE {table} SET {enc} = ?1 WHERE {pk} = ?2 AND {enc} IS ?3",
            table = quote(&plan.table),
            enc = quote(&plan.encrypted_column),
            pk = quote(&plan.primary_key),
        );

        let tx = conn.transaction().map_err(backend)?;
        let mut applied = 0;
        {
            let mut stmt = tx.prepare(&sql).map_err(backend)?;
            for update in updates {
                applied += stmt
                    .execute(params![update.value, update.id, update.expected])
                    .map_err(backend)?;
            }
        }
        tx.commit().map_err(backend)?;

        tracing::debug!(table = %plan.table, applied, requested = updates.len(), "batch committed");
        Ok(applied)
    }

    fn count_with_prefix(&self, plan: &ColumnPlan, prefix: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        require_column(&conn, &plan.table, &plan.encrypted_column)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {table} WHERE substr({enc}, 1, length(?1)) = ?1",
            table = quote(&plan.table),
            enc = quote(&plan.encrypted_column),
        );
        let count: i64 = conn.query_row(&sql, params![prefix], |row| row.get(0)).map_err(backend)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn column_exists(&self, table: &str, column: &str) -> Result<bool, StoreError> {
        self.has_column(table, column)
    }

    fn drop_column(&self, table: &str, column: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        require_column(&conn, table, column)?;
        let sql = format!("ALTER TABLE {} DROP COLUMN {}", quote(table), quote(column));
        conn.execute(&sql, []).map_err(backend)?;
        tracing::info!(table, column, "dropped column");
        Ok(())
    }
}

#[allow(clippy::needless_pass_by_value)]
fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn columns(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)").map_err(backend)?;
    let names = stmt
        .query_map(params![table], |row| row.get(0))
        .map_err(backend)?
        .collect::<Result<Vec<String>, _>>()
        .map_err(backend)?;
    Ok(names)
}

fn require_table(conn: &Connection, table: &str) -> Result<(), StoreError> {
    if columns(conn, table)?.is_empty() {
        return Err(StoreError::MissingColumn(table.to_string()));
    }
    Ok(())
}

fn require_column(conn: &Connection, table: &str, column: &str) -> Result<(), StoreError> {
    if columns(conn, table)?.iter().any(|c| c == column) {
        Ok(())
    } else {
        Err(StoreError::MissingColumn(format!("{table}.{column}")))
    }
}

fn bytes_value(value: ValueRef<'_>) -> Option<Vec<u8>> {
    match value {
        ValueRef::Null => None,
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Some(bytes.to_vec()),
        ValueRef::Integer(i) => Some(i.to_string().into_bytes()),
        ValueRef::Real(f) => Some(f.to_string().into_bytes()),
    }
}

fn text_value(value: ValueRef<'_>) -> Option<String> {
    bytes_value(value).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}
