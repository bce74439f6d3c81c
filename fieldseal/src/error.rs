//! Error types for `FieldSeal` operations.

use std::fmt;

/// Main error type for `FieldSeal` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key material or engine configuration is invalid (fatal at startup)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The registry has no current key to encrypt with
    #[error("no current key version configured")]
    NoCurrentKey,

    /// Stored data references a key version the registry does not hold
    #[error("unknown key version: {0}")]
    UnknownKeyVersion(String),

    /// Stored value is not a valid envelope (legacy plaintext or corruption)
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Authentication failed; the cause is deliberately not reported
    #[error("decryption failed")]
    Decryption,

    /// A legacy plaintext value cannot be read as text
    #[error("invalid legacy plaintext: {0}")]
    InvalidPlaintext(String),

    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Retirement refused because stored envelopes still use the version
    #[error("key version {version} is still referenced by {references} stored value(s)")]
    VersionStillInUse {
        /// The version that was asked to retire
        version: String,
        /// Number of stored values still under that version
        references: u64,
    },

    /// A rotation is already under way
    #[error("rotation from {from} to {to} has not been retired yet")]
    RotationInProgress {
        /// Version being drained
        from: String,
        /// Version that is current
        to: String,
    },

    /// A destructive step was refused because an earlier step is not clean
    #[error("destructive step refused: {0}")]
    GateRefused(String),

    /// Persistence layer failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Short, stable name of the error kind, safe to put in logs and reports.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::NoCurrentKey => "no_current_key",
            Self::UnknownKeyVersion(_) => "unknown_key_version",
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::Decryption => "decryption",
            Self::InvalidPlaintext(_) => "invalid_plaintext",
            Self::EncryptionFailed(_) => "encryption",
            Self::VersionStillInUse { .. } => "version_still_in_use",
            Self::RotationInProgress { .. } => "rotation_in_progress",
            Self::GateRefused(_) => "gate_refused",
            Self::Store(_) => "store",
        }
    }
}

/// Errors raised by a [`RowStore`](crate::store::RowStore) implementation.
#[derive(Debug)]
pub enum StoreError {
    /// The backend rejected or failed the operation
    Backend(String),

    /// The referenced table or column does not exist
    MissingColumn(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(msg) => write!(f, "backend failure: {msg}"),
            Self::MissingColumn(name) => write!(f, "missing column: {name}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decryption_error_is_uniform() {
        assert_eq!(Error::Decryption.to_string(), "decryption failed");
    }

    #[test]
    fn test_store_error_converts() {
        let err: Error = StoreError::Backend("database is locked".to_string()).into();
        assert_eq!(err.kind(), "store");
        assert!(err.to_string().contains("database is locked"));
    }

    #[test]
    fn test_version_still_in_use_message() {
        let err = Error::VersionStillInUse { version: "v1".to_string(), references: 3 };
        assert_eq!(err.to_string(), "key version v1 is still referenced by 3 stored value(s)");
    }
}
