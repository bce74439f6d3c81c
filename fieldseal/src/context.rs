//! Identity of a protected cell, bound into every ciphertext as associated data.

use std::fmt;

/// Identity of one protected cell: table, column and optionally the owning row.
///
/// The context is never stored; it is rebuilt from the schema when reading,
/// so a ciphertext copied into another column or row fails authentication.
///
/// # Example
///
/// ```
/// use fieldseal::context::FieldContext;
///
/// let ctx = FieldContext::new("clients", "date_of_birth").with_row(42);
/// assert_eq!(ctx.to_string(), "clients|date_of_birth|42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldContext {
    table_name: String,
    column_name: String,
    row_id: Option<i64>,
}

impl FieldContext {
    /// Creates a context bound to a table and column only.
    #[must_use]
    pub fn new(table_name: impl Into<String>, column_name: impl Into<String>) -> Self {
        Self { table_name: table_name.into(), column_name: column_name.into(), row_id: None }
    }

    /// Binds the context to a specific row.
    #[must_use]
    pub const fn with_row(mut self, row_id: i64) -> Self {
        self.row_id = Some(row_id);
        self
    }

    /// Returns the table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Returns the column name.
    #[must_use]
    pub fn column_name(&self) -> &str {
        &self.column_name
    }

    /// Returns the bound row id, if any.
    #[must_use]
    pub const fn row_id(&self) -> Option<i64> {
        self.row_id
    }

    /// Associated data bytes fed to the AEAD.
    #[must_use]
    pub fn aad(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for FieldContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row_id {
            Some(id) => write!(f, "{}|{}|{id}", self.table_name, self.column_name),
            None => write!(f, "{}|{}|-", self.table_name, self.column_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_context_display_with_row() {
        let ctx = FieldContext::new("clients", "email").with_row(7);
        assert_eq!(ctx.to_string(), "clients|email|7");
        assert_eq!(ctx.row_id(), Some(7));
    }

    #[test]
    fn test_field_context_display_without_row() {
        let ctx = FieldContext::new("clients", "email");
        assert_eq!(ctx.to_string(), "clients|email|-");
        assert_eq!(ctx.aad(), b"clients|email|-".to_vec());
    }

    #[test]
    fn test_field_context_distinguishes_columns() {
        let a = FieldContext::new("clients", "first_name").with_row(1);
        let b = FieldContext::new("clients", "last_name").with_row(1);
        assert_ne!(a.aad(), b.aad());
    }
}
