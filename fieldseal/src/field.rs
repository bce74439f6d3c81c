//! Encrypt-on-write / decrypt-on-read adapter for protected columns.
//!
//! The persistence layer calls [`ColumnHooks`] on its generic read and write
//! path; application code only ever sees plaintext. Nulls pass through
//! without touching the cipher, and any failure on read is returned as an
//! error rather than an empty value.

use crate::cipher::FieldCipher;
use crate::config::ColumnPlan;
use crate::context::FieldContext;
use crate::envelope::Envelope;
use crate::error::Error;
use crate::key_registry::KeyRegistry;
use std::collections::HashMap;
use std::sync::Arc;

/// Pair of pure conversions registered against one column.
pub trait ColumnCodec: Send + Sync {
    /// Converts an application value into its stored form.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted.
    fn to_storage(&self, value: Option<&str>, row_id: Option<i64>) -> Result<Option<String>, Error>;

    /// Converts a stored value back into the application value.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value cannot be converted.
    fn from_storage(
        &self,
        stored: Option<&str>,
        row_id: Option<i64>,
    ) -> Result<Option<String>, Error>;
}

/// Codec encrypting one column with the registry's current key.
///
/// # Example
///
/// ```ignore
/// use fieldseal::config::ColumnPlan;
/// use fieldseal::field::EncryptedField;
///
/// let plan = ColumnPlan::new("clients", "date_of_birth");
/// let field = EncryptedField::new(registry.clone(), &plan);
///
/// let stored = field.to_storage(Some("1990-05-15"), Some(42))?;
/// let value = field.from_storage(stored.as_deref(), Some(42))?;
/// assert_eq!(value.as_deref(), Some("1990-05-15"));
/// ```
#[derive(Clone)]
pub struct EncryptedField {
    registry: Arc<KeyRegistry>,
    table: String,
    column: String,
    bind_row_id: bool,
}

impl EncryptedField {
    /// Creates the codec for the encrypted column of `plan`.
    #[must_use]
    pub fn new(registry: Arc<KeyRegistry>, plan: &ColumnPlan) -> Self {
        Self {
            registry,
            table: plan.table.clone(),
            column: plan.encrypted_column.clone(),
            bind_row_id: plan.bind_row_id,
        }
    }

    /// Associated-data context for a row.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the column binds row ids and none was
    /// supplied.
    pub fn context(&self, row_id: Option<i64>) -> Result<FieldContext, Error> {
        let context = FieldContext::new(&self.table, &self.column);
        if !self.bind_row_id {
            return Ok(context);
        }
        row_id.map(|id| context.with_row(id)).ok_or_else(|| {
            Error::Configuration(format!("{}.{} requires a row id", self.table, self.column))
        })
    }

    /// Encrypts a non-null value under the current key.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoCurrentKey` if no key is current, or a cipher error.
    pub fn encrypt_value(&self, value: &str, row_id: Option<i64>) -> Result<String, Error> {
        let context = self.context(row_id)?;
        let key = self.registry.current()?;
        FieldCipher::seal(value, &key, Some(&context))
    }

    /// Decrypts a non-null stored value.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedEnvelope`, `Error::UnknownKeyVersion` or
    /// `Error::Decryption`; never a default value.
    pub fn decrypt_value(&self, stored: &str, row_id: Option<i64>) -> Result<String, Error> {
        let context = self.context(row_id)?;
        let envelope = Envelope::parse(stored)?;
        let key = self.registry.resolve(envelope.version_label())?;
        FieldCipher::decrypt(&envelope, &key, Some(&context))
    }

    /// Re-encrypts a stored value under the current key.
    ///
    /// Returns `None` if the value is already under the current key.
    ///
    /// # Errors
    ///
    /// Same as [`decrypt_value`](Self::decrypt_value) and
    /// [`encrypt_value`](Self::encrypt_value).
    pub fn reseal(&self, stored: &str, row_id: Option<i64>) -> Result<Option<String>, Error> {
        let context = self.context(row_id)?;
        let envelope = Envelope::parse(stored)?;
        let current = self.registry.current()?;
        if envelope.version_label() == current.label() {
            return Ok(None);
        }
        let old = self.registry.resolve(envelope.version_label())?;
        let plaintext = FieldCipher::decrypt(&envelope, &old, Some(&context))?;
        FieldCipher::seal(&plaintext, &current, Some(&context)).map(Some)
    }

    /// Encrypts a default value for a new record.
    ///
    /// Each call produces a new envelope; callers must not cache the result
    /// across records.
    ///
    /// # Errors
    ///
    /// Same as [`encrypt_value`](Self::encrypt_value).
    pub fn fresh_default(&self, value: &str, row_id: Option<i64>) -> Result<String, Error> {
        self.encrypt_value(value, row_id)
    }

    /// Whether a stored value is an envelope rather than legacy plaintext.
    #[must_use]
    pub fn is_sealed(stored: &str) -> bool {
        Envelope::parse(stored).is_ok()
    }
}

impl ColumnCodec for EncryptedField {
    fn to_storage(
        &self,
        value: Option<&str>,
        row_id: Option<i64>,
    ) -> Result<Option<String>, Error> {
        value.map(|v| self.encrypt_value(v, row_id)).transpose()
    }

    fn from_storage(
        &self,
        stored: Option<&str>,
        row_id: Option<i64>,
    ) -> Result<Option<String>, Error> {
        stored.map(|s| self.decrypt_value(s, row_id)).transpose()
    }
}

/// Codecs registered per `(table, column)`.
///
/// Columns without a codec pass through unchanged.
#[derive(Clone, Default)]
pub struct ColumnHooks {
    codecs: HashMap<(String, String), Arc<dyn ColumnCodec>>,
}

impl ColumnHooks {
    /// Creates an empty hook table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers encrypted fields for every plan.
    #[must_use]
    pub fn from_plans(registry: &Arc<KeyRegistry>, plans: &[ColumnPlan]) -> Self {
        let mut hooks = Self::new();
        for plan in plans {
            hooks.register(
                &plan.table,
                &plan.encrypted_column,
                Arc::new(EncryptedField::new(Arc::clone(registry), plan)),
            );
        }
        hooks
    }

    /// Registers a codec for a column, replacing any previous one.
    pub fn register(&mut self, table: &str, column: &str, codec: Arc<dyn ColumnCodec>) {
        self.codecs.insert((table.to_string(), column.to_string()), codec);
    }

    /// Whether a column has a codec.
    #[must_use]
    pub fn is_protected(&self, table: &str, column: &str) -> bool {
        self.codecs.contains_key(&(table.to_string(), column.to_string()))
    }

    /// Write-path hook.
    ///
    /// # Errors
    ///
    /// Propagates the codec's error.
    pub fn to_storage(
        &self,
        table: &str,
        column: &str,
        value: Option<&str>,
        row_id: Option<i64>,
    ) -> Result<Option<String>, Error> {
        match self.codec(table, column) {
            Some(codec) => codec.to_storage(value, row_id),
            None => Ok(value.map(str::to_string)),
        }
    }

    /// Read-path hook.
    ///
    /// # Errors
    ///
    /// Propagates the codec's error.
    pub fn from_storage(
        &self,
        table: &str,
        column: &str,
        stored: Option<&str>,
        row_id: Option<i64>,
    ) -> Result<Option<String>, Error> {
        match self.codec(table, column) {
            Some(codec) => codec.from_storage(stored, row_id),
            None => Ok(stored.map(str::to_string)),
        }
    }

    fn codec(&self, table: &str, column: &str) -> Option<&Arc<dyn ColumnCodec>> {
        self.codecs.get(&(table.to_string(), column.to_string()))
    }
}
