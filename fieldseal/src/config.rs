//! Engine configuration.
//!
//! The library only defines the shape and validation; binaries decide where
//! it is loaded from.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Default number of rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default pause between batches in milliseconds.
pub const DEFAULT_RATE_LIMIT_MS: u64 = 50;

/// Default number of rows sampled by verification.
pub const DEFAULT_VERIFY_SAMPLE: usize = 100;

/// One protected column as the migration tooling sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPlan {
    /// Table holding the column
    pub table: String,
    /// Integer primary key used for keyset iteration
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Legacy plaintext column, absent once it has been dropped
    #[serde(default)]
    pub plaintext_column: Option<String>,
    /// Column receiving the serialized envelope
    pub encrypted_column: String,
    /// Whether the row id is bound into the associated data
    #[serde(default = "default_true")]
    pub bind_row_id: bool,
}

fn default_primary_key() -> String {
    "id".to_string()
}

const fn default_true() -> bool {
    true
}

impl ColumnPlan {
    /// Creates a plan for an encrypted column keyed by `id`, bound to row ids.
    #[must_use]
    pub fn new(table: impl Into<String>, encrypted_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: default_primary_key(),
            plaintext_column: None,
            encrypted_column: encrypted_column.into(),
            bind_row_id: true,
        }
    }

    /// Sets the legacy plaintext column to backfill from.
    #[must_use]
    pub fn with_plaintext(mut self, column: impl Into<String>) -> Self {
        self.plaintext_column = Some(column.into());
        self
    }

    /// Binds only table and column, not the row id.
    #[must_use]
    pub const fn without_row_binding(mut self) -> Self {
        self.bind_row_id = false;
        self
    }

    /// The same plan without its legacy plaintext column.
    #[must_use]
    pub fn encrypted_only(&self) -> Self {
        Self { plaintext_column: None, ..self.clone() }
    }

    /// Checks that every identifier is a plain SQL identifier.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` on an invalid identifier or when the
    /// plaintext and encrypted columns coincide.
    pub fn validate(&self) -> Result<(), Error> {
        validate_identifier(&self.table)?;
        validate_identifier(&self.primary_key)?;
        validate_identifier(&self.encrypted_column)?;
        if let Some(plaintext) = &self.plaintext_column {
            validate_identifier(plaintext)?;
            if plaintext == &self.encrypted_column {
                return Err(Error::Configuration(format!(
                    "{}.{plaintext}: plaintext and encrypted column must differ",
                    self.table
                )));
            }
        }
        Ok(())
    }
}

/// Tuning and column layout for the migration tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows per batch
    pub batch_size: usize,
    /// Pause between batches in milliseconds
    pub rate_limit_ms: u64,
    /// Rows sampled by `verify` when no explicit size is given
    pub verify_sample: usize,
    /// Protected columns
    pub columns: Vec<ColumnPlan>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            rate_limit_ms: DEFAULT_RATE_LIMIT_MS,
            verify_sample: DEFAULT_VERIFY_SAMPLE,
            columns: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Pause between batches.
    #[must_use]
    pub const fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    /// Validates sizes and every column plan.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` on a zero batch or sample size, an
    /// invalid plan, or the same encrypted column configured twice.
    pub fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::Configuration("batch_size must be at least 1".to_string()));
        }
        if self.verify_sample == 0 {
            return Err(Error::Configuration("verify_sample must be at least 1".to_string()));
        }
        let mut seen = HashSet::new();
        for plan in &self.columns {
            plan.validate()?;
            if !seen.insert((plan.table.as_str(), plan.encrypted_column.as_str())) {
                return Err(Error::Configuration(format!(
                    "{}.{} is configured more than once",
                    plan.table, plan.encrypted_column
                )));
            }
        }
        Ok(())
    }

    /// Finds the plans for a table.
    pub fn columns_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ColumnPlan> + 'a {
        self.columns.iter().filter(move |plan| plan.table == table)
    }
}

fn validate_identifier(name: &str) -> Result<(), Error> {
    let mut bytes = name.bytes();
    let valid = bytes.next().is_some_and(|b| b.is_ascii_alphabetic() || b == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(format!("invalid SQL identifier: {name:?}")))
    }
}
