//! # `FieldSeal`
//!
//! Field-level authenticated encryption for protected columns, with online
//! migration of legacy plaintext and zero-downtime key rotation.
//!
//! ## Features
//!
//! - AES-256-GCM with a fresh nonce per value and `(table, column, row)`
//!   bound as associated data
//! - Versioned text envelopes (`fs1:<version>:<nonce>:<ciphertext>`)
//! - A key registry whose current version is swapped atomically
//! - Batched, resumable backfill with per-row failure isolation
//! - Verification gates before destructive schema changes
//! - Rotation with draining and guarded retirement of old versions
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldseal::prelude::*;
//!
//! let registry = Arc::new(KeyRegistry::from_source(&FileKeySource::open("./keys")?)?);
//! let plan = ColumnPlan::new("clients", "date_of_birth_enc");
//! let field = EncryptedField::new(registry, &plan);
//!
//! let stored = field.encrypt_value("1990-05-15", Some(42))?;
//! assert_eq!(field.decrypt_value(&stored, Some(42))?, "1990-05-15");
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod audit;
pub mod cipher;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod field;
pub mod key_registry;
pub mod key_source;
pub mod migration;
pub mod rotation;
pub mod store;
pub mod tooling;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::audit::{Sample, VerificationAuditor, VerificationReport};
    pub use crate::cipher::FieldCipher;
    pub use crate::config::{ColumnPlan, EngineConfig};
    pub use crate::context::FieldContext;
    pub use crate::envelope::Envelope;
    pub use crate::error::{Error, StoreError};
    pub use crate::field::{ColumnCodec, ColumnHooks, EncryptedField};
    pub use crate::key_registry::{KeyMaterial, KeyRegistry, KeyVersion};
    pub use crate::key_source::KeySource;
    pub use crate::migration::{CancelFlag, MigrationBatchRunner, Summary};
    pub use crate::rotation::{RotationCoordinator, RotationHandle, RotationPhase, RotationStatus};
    pub use crate::store::RowStore;
    pub use crate::tooling::MigrationTooling;
}
