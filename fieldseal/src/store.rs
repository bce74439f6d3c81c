//! Persistence seam used by the migration, verification and rotation jobs.
//!
//! The jobs never hold a table-wide lock: they read a keyset page, compute
//! new values outside any transaction, then apply them as compare-and-swap
//! updates in one transaction per batch.

use crate::config::ColumnPlan;
use crate::error::StoreError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// One row as read for a [`ColumnPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Primary key
    pub id: i64,
    /// Raw legacy plaintext bytes, if the column exists and is not null
    pub plaintext: Option<Vec<u8>>,
    /// Stored envelope text, if not null
    pub encrypted: Option<String>,
}

/// Compare-and-swap write of an encrypted cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpdate {
    /// Primary key of the row
    pub id: i64,
    /// Value the cell must still hold for the write to apply
    pub expected: Option<String>,
    /// New envelope text
    pub value: String,
}

/// Row access needed by the batch jobs.
///
/// Implementations must be thread-safe (`Send + Sync`); batch jobs may run
/// on a background thread while the application keeps serving requests.
pub trait RowStore: Send + Sync {
    /// Counts all rows of the plan's table.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the query fails.
    fn count_rows(&self, plan: &ColumnPlan) -> Result<u64, StoreError>;

    /// Reads up to `limit` rows with primary key greater than `after`, in
    /// primary key order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the query fails.
    fn scan(
        &self,
        plan: &ColumnPlan,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError>;

    /// Applies updates in a single transaction.
    ///
    /// An update whose cell no longer holds `expected` is skipped. Returns the
    /// number of rows written.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the transaction fails; no update is applied.
    fn apply(&self, plan: &ColumnPlan, updates: &[CellUpdate]) -> Result<usize, StoreError>;

    /// Counts encrypted cells whose stored text starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the query fails.
    fn count_with_prefix(&self, plan: &ColumnPlan, prefix: &str) -> Result<u64, StoreError>;

    /// Whether `table` exists and has `column`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the schema cannot be read.
    fn column_exists(&self, table: &str, column: &str) -> Result<bool, StoreError>;

    /// Drops a column.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the schema change fails.
    fn drop_column(&self, table: &str, column: &str) -> Result<(), StoreError>;
}

/// A cell value in [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// SQL null
    Null,
    /// Text value
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
}

impl Cell {
    fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Null => None,
            Self::Text(text) => Some(text.as_bytes().to_vec()),
            Self::Blob(bytes) => Some(bytes.clone()),
        }
    }

    fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(text) => Some(text.clone()),
            Self::Blob(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Option<&str>> for Cell {
    fn from(value: Option<&str>) -> Self {
        value.map_or(Self::Null, Self::from)
    }
}

type Row = HashMap<String, Cell>;

#[derive(Default)]
struct Table {
    columns: Vec<String>,
    rows: BTreeMap<i64, Row>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    fail_applies: usize,
    commits: usize,
}

/// In-memory [`RowStore`] for tests and embedding.
///
/// The primary key of every table is the map key; any `primary_key` name in a
/// plan is accepted.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table with the given non-key columns.
    pub fn create_table(&self, table: &str, columns: &[&str]) {
        let columns = columns.iter().map(ToString::to_string).collect();
        let table_entry = Table { columns, rows: BTreeMap::new() };
        self.state.lock().tables.insert(table.to_string(), table_entry);
    }

    /// Inserts or replaces a row; unspecified columns are null.
    pub fn insert(&self, table: &str, id: i64, cells: Vec<(&str, Cell)>) {
        let mut state = self.state.lock();
        let table = state.tables.entry(table.to_string()).or_default();
        let mut row: Row = table.columns.iter().map(|c| (c.clone(), Cell::Null)).collect();
        for (column, cell) in cells {
            row.insert(column.to_string(), cell);
        }
        table.rows.insert(id, row);
    }

    /// Sets one cell of an existing row.
    pub fn set(&self, table: &str, id: i64, column: &str, cell: Cell) {
        let mut state = self.state.lock();
        if let Some(row) = state.tables.get_mut(table).and_then(|t| t.rows.get_mut(&id)) {
            row.insert(column.to_string(), cell);
        }
    }

    /// Reads one cell; `None` if the row or column does not exist.
    #[must_use]
    pub fn get(&self, table: &str, id: i64, column: &str) -> Option<Cell> {
        let state = self.state.lock();
        state.tables.get(table)?.rows.get(&id)?.get(column).cloned()
    }

    /// Reads one cell as text.
    #[must_use]
    pub fn get_text(&self, table: &str, id: i64, column: &str) -> Option<String> {
        self.get(table, id, column).and_then(|cell| cell.to_text())
    }

    /// Makes the next `count` calls to [`RowStore::apply`] fail.
    pub fn fail_next_applies(&self, count: usize) {
        self.state.lock().fail_applies = count;
    }

    /// Number of successful [`RowStore::apply`] transactions so far.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    /// Whether a table has a column.
    #[must_use]
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.state.lock().tables.get(table).is_some_and(|t| t.columns.iter().any(|c| c == column))
    }
}

fn table<'a>(state: &'a State, name: &str) -> Result<&'a Table, StoreError> {
    state.tables.get(name).ok_or_else(|| StoreError::MissingColumn(name.to_string()))
}

fn require_column(table: &Table, plan_table: &str, column: &str) -> Result<(), StoreError> {
    if table.columns.iter().any(|c| c == column) {
        Ok(())
    } else {
        Err(StoreError::MissingColumn(format!("{plan_table}.{column}")))
    }
}

impl RowStore for MemoryStore {
    fn count_rows(&self, plan: &ColumnPlan) -> Result<u64, StoreError> {
        let state = self.state.lock();
        Ok(table(&state, &plan.table)?.rows.len() as u64)
    }

    fn scan(
        &self,
        plan: &ColumnPlan,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let state = self.state.lock();
        let table = table(&state, &plan.table)?;
        require_column(table, &plan.table, &plan.encrypted_column)?;
        if let Some(plaintext) = &plan.plaintext_column {
            require_column(table, &plan.table, plaintext)?;
        }

        let start = after.map_or(i64::MIN, |id| id.saturating_add(1));
        if after == Some(i64::MAX) {
            return Ok(Vec::new());
        }
        let rows = table
            .rows
            .range(start..)
            .take(limit)
            .map(|(id, row)| StoredRow {
                id: *id,
                plaintext: plan
                    .plaintext_column
                    .as_ref()
                    .and_then(|c| row.get(c))
                    .and_then(Cell::to_bytes),
                encrypted: row.get(&plan.encrypted_column).and_then(Cell::to_text),
            })
            .collect();
        Ok(rows)
    }

    fn apply(&self, plan: &ColumnPlan, updates: &[CellUpdate]) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        if state.fail_applies > 0 {
            state.fail_applies -= 1;
            return Err(StoreError::Backend("injected transaction failure".to_string()));
        }

        let table = state
            .tables
            .get_mut(&plan.table)
            .ok_or_else(|| StoreError::MissingColumn(plan.table.clone()))?;
        require_column(table, &plan.table, &plan.encrypted_column)?;

        let mut applied = 0;
        for update in updates {
            let Some(row) = table.rows.get_mut(&update.id) else { continue };
            let current = row.get(&plan.encrypted_column).and_then(Cell::to_text);
            if current == update.expected {
                row.insert(plan.encrypted_column.clone(), Cell::Text(update.value.clone()));
                applied += 1;
            }
        }
        state.commits += 1;
        Ok(applied)
    }

    fn count_with_prefix(&self, plan: &ColumnPlan, prefix: &str) -> Result<u64, StoreError> {
        let state = self.state.lock();
        let table = table(&state, &plan.table)?;
        require_column(table, &plan.table, &plan.encrypted_column)?;
        let count = table
            .rows
            .values()
            .filter_map(|row| row.get(&plan.encrypted_column).and_then(Cell::to_text))
            .filter(|value| value.starts_with(prefix))
            .count();
        Ok(count as u64)
    }

    fn column_exists(&self, table: &str, column: &str) -> Result<bool, StoreError> {
        Ok(self.has_column(table, column))
    }

    fn drop_column(&self, table: &str, column: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingColumn(table.to_string()))?;
        require_column(entry, table, column)?;
        entry.columns.retain(|c| c != column);
        for row in entry.rows.values_mut() {
            row.remove(column);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (MemoryStore, ColumnPlan) {
        let store = MemoryStore::new();
        store.create_table("clients", &["name", "name_enc"]);
        for id in 1..=5 {
            let name = format!("client {id}");
            store.insert("clients", id, vec![("name", Cell::from(name.as_str()))]);
        }
        (store, ColumnPlan::new("clients", "name_enc").with_plaintext("name"))
    }

    #[test]
    fn test_scan_pages_by_key() {
        let (store, plan) = store();
        let first = store.scan(&plan, None, 2).unwrap();
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(first[0].plaintext.as_deref(), Some(b"client 1".as_slice()));
        assert_eq!(first[0].encrypted, None);

        let rest = store.scan(&plan, Some(2), 10).unwrap();
        assert_eq!(rest.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(store.scan(&plan, Some(5), 10).unwrap().is_empty());
    }

    #[test]
    fn test_apply_is_compare_and_swap() {
        let (store, plan) = store();
        store.set("clients", 2, "name_enc", Cell::from("fs1:v1:already"));

        let updates = vec![
            CellUpdate { id: 1, expected: None, value: "new-1".to_string() },
            CellUpdate { id: 2, expected: None, value: "new-2".to_string() },
        ];
        assert_eq!(store.apply(&plan, &updates).unwrap(), 1);
        assert_eq!(store.get_text("clients", 1, "name_enc").as_deref(), Some("new-1"));
        assert_eq!(store.get_text("clients", 2, "name_enc").as_deref(), Some("fs1:v1:already"));
        assert_eq!(store.commits(), 1);
    }

    #[test]
    fn test_injected_failure() {
        let (store, plan) = store();
        store.fail_next_applies(1);
        let update = CellUpdate { id: 1, expected: None, value: "x".to_string() };
        assert!(store.apply(&plan, std::slice::from_ref(&update)).is_err());
        assert_eq!(store.apply(&plan, &[update]).unwrap(), 1);
    }

    #[test]
    fn test_count_with_prefix() {
        let (store, plan) = store();
        store.set("clients", 1, "name_enc", Cell::from("fs1:v1:a:b"));
        store.set("clients", 2, "name_enc", Cell::from("fs1:v10:a:b"));
        store.set("clients", 3, "name_enc", Cell::from("fs1:v2:a:b"));
        assert_eq!(store.count_with_prefix(&plan, "fs1:v1:").unwrap(), 1);
        assert_eq!(store.count_with_prefix(&plan, "fs1:").unwrap(), 3);
    }

    #[test]
    fn test_drop_column() {
        let (store, plan) = store();
        store.drop_column("clients", "name").unwrap();
        assert!(!store.has_column("clients", "name"));
        assert!(!store.column_exists("clients", "name").unwrap());
        assert!(store.column_exists("clients", "name_enc").unwrap());
        assert!(matches!(store.scan(&plan, None, 10), Err(StoreError::MissingColumn(_))));
        assert!(matches!(store.drop_column("clients", "name"), Err(StoreError::MissingColumn(_))));
    }
}
