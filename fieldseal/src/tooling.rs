//! Entry points used by operators and the CLI.

use crate::audit::{Sample, VerificationAuditor, VerificationReport};
use crate::config::{ColumnPlan, EngineConfig};
use crate::error::Error;
use crate::key_registry::KeyRegistry;
use crate::migration::{CancelFlag, MigrationBatchRunner, Summary};
use crate::rotation::{RotationCoordinator, RotationHandle, RotationStatus};
use crate::store::RowStore;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of [`MigrationTooling::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    /// Final backfill pass
    pub summary: Summary,
    /// Full verification pass
    pub report: VerificationReport,
    /// Column that was dropped
    pub dropped_column: String,
}

/// Backfill, verification, rotation and retirement over one store.
pub struct MigrationTooling<S: RowStore> {
    store: Arc<S>,
    registry: Arc<KeyRegistry>,
    config: RwLock<EngineConfig>,
    coordinator: RotationCoordinator<S>,
    cancel: CancelFlag,
}

impl<S: RowStore> MigrationTooling<S> {
    /// Creates the tooling after validating `config`.
    ///
    /// Plaintext columns that no longer exist in the store are treated as
    /// already finalized.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the configuration is invalid and
    /// `Error::Store` if the schema cannot be read.
    pub fn new(
        store: Arc<S>,
        registry: Arc<KeyRegistry>,
        config: EngineConfig,
    ) -> Result<Self, Error> {
        Self::with_cancel_flag(store, registry, config, CancelFlag::new())
    }

    /// Like [`new`](Self::new), with a cancel flag shared by every batch job.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_cancel_flag(
        store: Arc<S>,
        registry: Arc<KeyRegistry>,
        mut config: EngineConfig,
        cancel: CancelFlag,
    ) -> Result<Self, Error> {
        config.validate()?;
        for plan in &mut config.columns {
            let Some(plaintext) = &plan.plaintext_column else { continue };
            if !store.column_exists(&plan.table, plaintext)? {
                tracing::warn!(
                    table = %plan.table,
                    column = %plaintext,
                    "plaintext column not found; treating it as dropped"
                );
                plan.plaintext_column = None;
            }
        }

        let coordinator = RotationCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            config.columns.clone(),
        )
        .with_pause(config.rate_limit())
        .with_cancel_flag(cancel.clone());
        Ok(Self { store, registry, config: RwLock::new(config), coordinator, cancel })
    }

    /// The validated configuration, reflecting columns dropped so far.
    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// The key registry shared with the live read/write path.
    #[must_use]
    pub const fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    /// Backfills every column that still has a plaintext column.
    ///
    /// # Errors
    ///
    /// See [`MigrationBatchRunner::run`].
    pub fn run_backfill(&self, batch_size: usize, rate_limit_ms: u64) -> Result<Summary, Error> {
        let columns = self.config.read().columns.clone();
        self.runner(batch_size, Duration::from_millis(rate_limit_ms)).run_all(&columns)
    }

    /// Verifies every configured column.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if reading fails.
    pub fn verify(&self, sample: Sample) -> Result<VerificationReport, Error> {
        let columns = self.config.read().columns.clone();
        self.auditor().verify_all(&columns, sample)
    }

    /// Starts a rotation to a new key version.
    ///
    /// # Errors
    ///
    /// See [`RotationCoordinator::rotate`].
    pub fn rotate(&self, version_label: &str, key_bytes: Vec<u8>) -> Result<RotationHandle, Error> {
        self.coordinator.rotate(version_label, key_bytes)
    }

    /// Reseals rows still under an old version.
    ///
    /// # Errors
    ///
    /// See [`RotationCoordinator::drain`].
    pub fn drain(&self, handle: &RotationHandle, batch_size: usize) -> Result<Summary, Error> {
        self.coordinator.drain(handle, batch_size)
    }

    /// Retires a version nothing references any more.
    ///
    /// # Errors
    ///
    /// See [`RotationCoordinator::retire`].
    pub fn retire(&self, version_label: &str) -> Result<(), Error> {
        self.coordinator.retire(version_label)
    }

    /// Stored values under a version across all columns.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if counting fails.
    pub fn references(&self, version_label: &str) -> Result<u64, Error> {
        self.coordinator.references(version_label)
    }

    /// Rotation phase and versions.
    #[must_use]
    pub fn status(&self) -> RotationStatus {
        self.coordinator.status()
    }

    /// Drops the legacy plaintext column of `plan` once it is safe.
    ///
    /// Runs a last backfill pass and a full verification first; the column is
    /// only dropped when both are clean.
    ///
    /// # Errors
    ///
    /// - `Error::Configuration` if the plan has no plaintext column or it was
    ///   already dropped
    /// - `Error::GateRefused` if the backfill or verification is not clean
    /// - `Error::Store` on persistence failures
    pub fn finalize(&self, plan: &ColumnPlan) -> Result<Finalized, Error> {
        let Some(plaintext) = plan.plaintext_column.clone() else {
            return Err(Error::Configuration(format!(
                "{}.{} has no plaintext column to drop",
                plan.table, plan.encrypted_column
            )));
        };
        if !self.store.column_exists(&plan.table, &plaintext)? {
            return Err(Error::Configuration(format!(
                "{}.{plaintext} was already dropped",
                plan.table
            )));
        }

        let (batch_size, pause) = {
            let config = self.config.read();
            (config.batch_size, config.rate_limit())
        };
        let summary = self.runner(batch_size, pause).run(plan)?;
        summary.ensure_clean()?;

        let report = self.auditor().verify(plan, Sample::All)?;
        report.ensure_clean()?;

        if self.cancel.is_cancelled() {
            return Err(Error::GateRefused("cancelled before dropping the column".to_string()));
        }
        self.store.drop_column(&plan.table, &plaintext)?;
        self.forget_plaintext(&plan.table, &plaintext);
        tracing::warn!(
            table = %plan.table,
            column = %plaintext,
            "dropped legacy plaintext column; remove plaintext_column from the configuration"
        );

        Ok(Finalized { summary, report, dropped_column: plaintext })
    }

    fn forget_plaintext(&self, table: &str, column: &str) {
        let mut config = self.config.write();
        for plan in &mut config.columns {
            if plan.table == table && plan.plaintext_column.as_deref() == Some(column) {
                plan.plaintext_column = None;
            }
        }
    }

    fn runner(&self, batch_size: usize, pause: Duration) -> MigrationBatchRunner<S> {
        MigrationBatchRunner::new(Arc::clone(&self.store), Arc::clone(&self.registry))
            .with_batch_size(batch_size)
            .with_pause(pause)
            .with_cancel_flag(self.cancel.clone())
    }

    fn auditor(&self) -> VerificationAuditor<S> {
        VerificationAuditor::new(Arc::clone(&self.store), Arc::clone(&self.registry))
            .with_batch_size(self.config.read().batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_registry::{KeyMaterial, KEY_SIZE};
    use crate::store::{Cell, MemoryStore};

    fn tooling(rows: i64) -> (Arc<MemoryStore>, MigrationTooling<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.create_table("clients", &["phone", "phone_enc"]);
        for id in 1..=rows {
            let phone = format!("555-010{id}");
            store.insert("clients", id, vec![("phone", Cell::from(phone.as_str()))]);
        }
        let registry = Arc::new(KeyRegistry::new());
        registry.register(KeyMaterial::new("v1", vec![5u8; KEY_SIZE]).current()).unwrap();
        let config = EngineConfig {
            batch_size: 4,
            rate_limit_ms: 0,
            columns: vec![ColumnPlan::new("clients", "phone_enc").with_plaintext("phone")],
            ..EngineConfig::default()
        };
        let tooling = MigrationTooling::new(Arc::clone(&store), registry, config).unwrap();
        (store, tooling)
    }

    #[test]
    fn test_finalize_drops_column_when_clean() {
        let (store, tooling) = tooling(6);
        let plan = tooling.config().columns[0].clone();

        let finalized = tooling.finalize(&plan).unwrap();
        assert_eq!(finalized.summary.migrated, 6);
        assert_eq!(finalized.report.passed, 6);
        assert_eq!(finalized.dropped_column, "phone");
        assert!(!store.has_column("clients", "phone"));
        assert!(store.get_text("clients", 2, "phone_enc").is_some());
    }

    #[test]
    fn test_rotation_after_finalize() {
        let (store, tooling) = tooling(6);
        let plan = tooling.config().columns[0].clone();
        tooling.finalize(&plan).unwrap();
        assert_eq!(tooling.config().columns[0].plaintext_column, None);

        let handle = tooling.rotate("v2", vec![6u8; KEY_SIZE]).unwrap();
        let summary = tooling.drain(&handle, 4).unwrap();
        assert_eq!(summary.migrated, 6);
        assert!(summary.is_clean());

        let report = tooling.verify(Sample::All).unwrap();
        assert_eq!(report.checked, 6);
        assert!(report.ensure_clean().is_ok());
        assert_eq!(tooling.run_backfill(4, 0).unwrap(), Summary::default());

        tooling.retire("v1").unwrap();
        assert_eq!(tooling.references("v2").unwrap(), 6);
        assert!(matches!(tooling.finalize(&plan), Err(Error::Configuration(_))));
        assert!(store.get_text("clients", 1, "phone_enc").is_some());
    }

    #[test]
    fn test_restart_after_finalize_skips_dropped_column() {
        let (store, tooling) = tooling(3);
        let original = tooling.config();
        tooling.finalize(&original.columns[0]).unwrap();

        let registry = Arc::clone(tooling.registry());
        let restarted = MigrationTooling::new(Arc::clone(&store), registry, original).unwrap();
        assert_eq!(restarted.config().columns[0].plaintext_column, None);
        assert_eq!(restarted.verify(Sample::All).unwrap().passed, 3);

        let handle = restarted.rotate("v2", vec![6u8; KEY_SIZE]).unwrap();
        assert_eq!(restarted.drain(&handle, 10).unwrap().migrated, 3);
    }

    #[test]
    fn test_finalize_refused_on_failed_backfill() {
        let (store, tooling) = tooling(6);
        store.set("clients", 5, "phone", Cell::Blob(vec![0xff, 0xfe]));
        let plan = tooling.config().columns[0].clone();

        assert!(matches!(tooling.finalize(&plan), Err(Error::GateRefused(_))));
        assert!(store.has_column("clients", "phone"));
    }

    #[test]
    fn test_finalize_refused_on_failed_verification() {
        let (store, tooling) = tooling(3);
        tooling.run_backfill(10, 0).unwrap();
        store.set("clients", 2, "phone_enc", Cell::from("fs1:v1:bm9wZQ==:bm9wZQ=="));
        let plan = tooling.config().columns[0].clone();

        assert!(matches!(tooling.finalize(&plan), Err(Error::GateRefused(_))));
        assert!(store.has_column("clients", "phone"));
    }

    #[test]
    fn test_finalize_requires_plaintext_column() {
        let (_, tooling) = tooling(1);
        let plan = ColumnPlan::new("clients", "phone_enc");
        assert!(matches!(tooling.finalize(&plan), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig { batch_size: 0, ..EngineConfig::default() };
        let result = MigrationTooling::new(store, Arc::new(KeyRegistry::new()), config);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
