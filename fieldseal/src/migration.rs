//! Online backfill of legacy plaintext columns into encrypted columns.
//!
//! Rows are visited in primary key order, one batch per transaction. Rows
//! whose encrypted column is already populated are skipped, so a run can be
//! stopped and started again at any point. A row that cannot be converted is
//! recorded and left alone; it never rolls back the rest of its batch.

use crate::config::{ColumnPlan, DEFAULT_BATCH_SIZE, DEFAULT_RATE_LIMIT_MS};
use crate::error::Error;
use crate::field::EncryptedField;
use crate::key_registry::KeyRegistry;
use crate::store::{CellUpdate, RowStore, StoredRow};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroize;

/// Cooperative cancellation, checked only between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a flag that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation at the next batch boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A row that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// Table name
    pub table: String,
    /// Encrypted column name
    pub column: String,
    /// Primary key of the row
    pub id: i64,
    /// Why the row failed; never contains the value
    pub reason: String,
}

/// Outcome of a backfill or drain run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    /// Rows visited
    pub total: u64,
    /// Rows written
    pub migrated: u64,
    /// Rows that failed
    pub failed: u64,
    /// Rows left untouched (already done, null, or changed concurrently)
    pub skipped: u64,
    /// Per-row failure details
    pub failures: Vec<RowFailure>,
    /// Whether the run stopped early on request
    pub cancelled: bool,
}

impl Summary {
    /// Folds another run into this one.
    pub fn merge(&mut self, other: Self) {
        self.total += other.total;
        self.migrated += other.migrated;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
        self.cancelled |= other.cancelled;
    }

    /// Failed row ids.
    #[must_use]
    pub fn failed_ids(&self) -> Vec<i64> {
        self.failures.iter().map(|f| f.id).collect()
    }

    /// A run is clean when it completed and no row failed.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    /// Gate for destructive follow-up steps.
    ///
    /// # Errors
    ///
    /// Returns `Error::GateRefused` unless the run [`is_clean`](Self::is_clean).
    pub fn ensure_clean(&self) -> Result<(), Error> {
        if self.cancelled {
            return Err(Error::GateRefused("run was cancelled before completion".to_string()));
        }
        if self.failed > 0 {
            return Err(Error::GateRefused(format!("{} row(s) failed", self.failed)));
        }
        Ok(())
    }
}

/// Position of a run, kept only for the duration of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationCursor {
    /// Rows scanned so far
    pub offset: u64,
    /// Last primary key scanned
    pub last_id: Option<i64>,
    /// Rows per batch
    pub batch_size: usize,
    /// Rows in the table when the run started
    pub total_count: u64,
    /// Rows that failed so far
    pub failed_ids: Vec<i64>,
}

/// What to do with one scanned row.
pub(crate) enum RowOutcome {
    Skip,
    Write(CellUpdate),
    Fail(Error),
}

/// Batch size, pause and cancellation shared by the batch jobs.
#[derive(Debug, Clone)]
pub(crate) struct BatchSettings {
    pub batch_size: usize,
    pub pause: Duration,
    pub cancel: CancelFlag,
}

/// Visits every row of `plan` in batches, committing the writes `prepare`
/// asks for once per batch.
pub(crate) fn run_batches<S, F>(
    store: &S,
    plan: &ColumnPlan,
    settings: &BatchSettings,
    job: &'static str,
    mut prepare: F,
) -> Result<Summary, Error>
where
    S: RowStore + ?Sized,
    F: FnMut(&StoredRow) -> RowOutcome,
{
    let batch_size = settings.batch_size.max(1);
    let mut cursor = MigrationCursor {
        batch_size,
        total_count: store.count_rows(plan)?,
        ..MigrationCursor::default()
    };
    let mut summary = Summary::default();

    tracing::info!(
        job,
        table = %plan.table,
        column = %plan.encrypted_column,
        rows = cursor.total_count,
        batch_size,
        "starting batch job"
    );

    loop {
        if settings.cancel.is_cancelled() {
            summary.cancelled = true;
            tracing::warn!(job, table = %plan.table, offset = cursor.offset, "batch job cancelled");
            break;
        }

        let rows = store.scan(plan, cursor.last_id, batch_size)?;
        let Some(last) = rows.last() else { break };
        cursor.last_id = Some(last.id);
        cursor.offset += rows.len() as u64;
        summary.total += rows.len() as u64;

        let mut updates = Vec::new();
        for row in &rows {
            match prepare(row) {
                RowOutcome::Skip => summary.skipped += 1,
                RowOutcome::Write(update) => updates.push(update),
                RowOutcome::Fail(err) => {
                    tracing::warn!(
                        job,
                        table = %plan.table,
                        column = %plan.encrypted_column,
                        row_id = row.id,
                        error = err.kind(),
                        "row failed"
                    );
                    cursor.failed_ids.push(row.id);
                    summary.failed += 1;
                    summary.failures.push(RowFailure {
                        table: plan.table.clone(),
                        column: plan.encrypted_column.clone(),
                        id: row.id,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if !updates.is_empty() {
            let applied = store.apply(plan, &updates)?;
            summary.migrated += applied as u64;
            summary.skipped += (updates.len() - applied) as u64;
        }

        tracing::info!(
            job,
            table = %plan.table,
            column = %plan.encrypted_column,
            offset = cursor.offset,
            total = cursor.total_count,
            migrated = summary.migrated,
            failed = summary.failed,
            "batch committed"
        );

        if rows.len() < batch_size {
            break;
        }
        if !settings.pause.is_zero() {
            std::thread::sleep(settings.pause);
        }
    }

    tracing::info!(
        job,
        table = %plan.table,
        column = %plan.encrypted_column,
        total = summary.total,
        migrated = summary.migrated,
        failed = summary.failed,
        skipped = summary.skipped,
        cancelled = summary.cancelled,
        "batch job finished"
    );
    Ok(summary)
}

/// Backfills encrypted columns from their legacy plaintext columns.
pub struct MigrationBatchRunner<S: RowStore> {
    store: Arc<S>,
    registry: Arc<KeyRegistry>,
    settings: BatchSettings,
}

impl<S: RowStore> MigrationBatchRunner<S> {
    /// Creates a runner with the default batch size and pause.
    pub fn new(store: Arc<S>, registry: Arc<KeyRegistry>) -> Self {
        Self {
            store,
            registry,
            settings: BatchSettings {
                batch_size: DEFAULT_BATCH_SIZE,
                pause: Duration::from_millis(DEFAULT_RATE_LIMIT_MS),
                cancel: CancelFlag::new(),
            },
        }
    }

    /// Sets the number of rows per batch.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.settings.batch_size = batch_size;
        self
    }

    /// Sets the pause between batches.
    #[must_use]
    pub const fn with_pause(mut self, pause: Duration) -> Self {
        self.settings.pause = pause;
        self
    }

    /// Uses an externally controlled cancel flag.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.settings.cancel = cancel;
        self
    }

    /// Backfills one column.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the plan has no plaintext column or is
    /// invalid, `Error::NoCurrentKey` if there is nothing to encrypt with, and
    /// `Error::Store` if the store fails. Row-level problems are reported in
    /// the summary instead.
    pub fn run(&self, plan: &ColumnPlan) -> Result<Summary, Error> {
        plan.validate()?;
        if plan.plaintext_column.is_none() {
            return Err(Error::Configuration(format!(
                "{}.{} has no plaintext column to backfill from",
                plan.table, plan.encrypted_column
            )));
        }
        self.registry.current()?;

        let field = EncryptedField::new(Arc::clone(&self.registry), plan);
        run_batches(self.store.as_ref(), plan, &self.settings, "backfill", |row| {
            backfill_row(&field, row)
        })
    }

    /// Backfills every plan that still has a plaintext column.
    ///
    /// # Errors
    ///
    /// Stops at the first plan-level error; see [`run`](Self::run).
    pub fn run_all(&self, plans: &[ColumnPlan]) -> Result<Summary, Error> {
        let mut summary = Summary::default();
        for plan in plans.iter().filter(|p| p.plaintext_column.is_some()) {
            summary.merge(self.run(plan)?);
            if summary.cancelled {
                break;
            }
        }
        Ok(summary)
    }
}

fn backfill_row(field: &EncryptedField, row: &StoredRow) -> RowOutcome {
    if row.encrypted.is_some() {
        return RowOutcome::Skip;
    }
    let Some(bytes) = &row.plaintext else {
        return RowOutcome::Skip;
    };
    let mut plaintext = match String::from_utf8(bytes.clone()) {
        Ok(text) => text,
        Err(err) => {
            err.into_bytes().zeroize();
            return RowOutcome::Fail(Error::InvalidPlaintext("not valid UTF-8".to_string()));
        }
    };
    let sealed = field.encrypt_value(&plaintext, Some(row.id));
    plaintext.zeroize();
    match sealed {
        Ok(value) => RowOutcome::Write(CellUpdate { id: row.id, expected: None, value }),
        Err(err) => RowOutcome::Fail(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::key_registry::{KeyMaterial, KEY_SIZE};
    use crate::store::{Cell, MemoryStore};

    /// Memory store that runs a hook right before each batch is applied.
    struct BeforeApply<F> {
        inner: MemoryStore,
        hook: F,
    }

    impl<F: Fn(&MemoryStore) + Send + Sync> RowStore for BeforeApply<F> {
        fn count_rows(&self, plan: &ColumnPlan) -> Result<u64, StoreError> {
            self.inner.count_rows(plan)
        }

        fn scan(
            &self,
            plan: &ColumnPlan,
            after: Option<i64>,
            limit: usize,
        ) -> Result<Vec<StoredRow>, StoreError> {
            self.inner.scan(plan, after, limit)
        }

        fn apply(&self, plan: &ColumnPlan, updates: &[CellUpdate]) -> Result<usize, StoreError> {
            (self.hook)(&self.inner);
            self.inner.apply(plan, updates)
        }

        fn count_with_prefix(&self, plan: &ColumnPlan, prefix: &str) -> Result<u64, StoreError> {
            self.inner.count_with_prefix(plan, prefix)
        }

        fn column_exists(&self, table: &str, column: &str) -> Result<bool, StoreError> {
            self.inner.column_exists(table, column)
        }

        fn drop_column(&self, table: &str, column: &str) -> Result<(), StoreError> {
            self.inner.drop_column(table, column)
        }
    }

    fn hooked<F>(rows: i64, hook: F) -> (Arc<BeforeApply<F>>, Arc<KeyRegistry>, ColumnPlan)
    where
        F: Fn(&MemoryStore) + Send + Sync,
    {
        let (store, registry, plan) = setup(rows);
        let inner = Arc::try_unwrap(store).ok().unwrap();
        (Arc::new(BeforeApply { inner, hook }), registry, plan)
    }

    fn setup(rows: i64) -> (Arc<MemoryStore>, Arc<KeyRegistry>, ColumnPlan) {
        let store = MemoryStore::new();
        store.create_table("clients", &["last_name", "last_name_enc"]);
        for id in 1..=rows {
            let last_name = format!("Doe {id}");
            store.insert("clients", id, vec![("last_name", Cell::from(last_name.as_str()))]);
        }
        let registry = KeyRegistry::new();
        registry.register(KeyMaterial::new("v1", vec![1u8; KEY_SIZE]).current()).unwrap();
        let plan = ColumnPlan::new("clients", "last_name_enc").with_plaintext("last_name");
        (Arc::new(store), Arc::new(registry), plan)
    }

    fn runner(
        store: &Arc<MemoryStore>,
        registry: &Arc<KeyRegistry>,
    ) -> MigrationBatchRunner<MemoryStore> {
        MigrationBatchRunner::new(Arc::clone(store), Arc::clone(registry))
            .with_batch_size(10)
            .with_pause(Duration::ZERO)
    }

    #[test]
    fn test_backfill_encrypts_every_row() {
        let (store, registry, plan) = setup(25);
        let summary = runner(&store, &registry).run(&plan).unwrap();

        assert_eq!(summary.total, 25);
        assert_eq!(summary.migrated, 25);
        assert_eq!(summary.failed, 0);
        assert!(summary.is_clean());
        assert_eq!(store.commits(), 3);

        let field = EncryptedField::new(Arc::clone(&registry), &plan);
        let stored = store.get_text("clients", 7, "last_name_enc").unwrap();
        assert_eq!(field.decrypt_value(&stored, Some(7)).unwrap(), "Doe 7");
    }

    #[test]
    fn test_backfill_is_idempotent() {
        let (store, registry, plan) = setup(12);
        let runner = runner(&store, &registry);
        assert_eq!(runner.run(&plan).unwrap().migrated, 12);

        let before = store.get_text("clients", 3, "last_name_enc");
        let second = runner.run(&plan).unwrap();
        assert_eq!(second.migrated, 0);
        assert_eq!(second.skipped, 12);
        assert_eq!(store.get_text("clients", 3, "last_name_enc"), before);
    }

    #[test]
    fn test_row_failure_is_isolated() {
        let (store, registry, plan) = setup(10);
        store.set("clients", 4, "last_name", Cell::Blob(vec![0xC3, 0x28, 0xff]));

        let summary = runner(&store, &registry).run(&plan).unwrap();
        assert_eq!(summary.migrated, 9);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_ids(), vec![4]);
        assert_eq!(summary.failures[0].reason, "invalid legacy plaintext: not valid UTF-8");
        assert_eq!(store.commits(), 1);
        assert_eq!(store.get("clients", 4, "last_name_enc"), Some(Cell::Null));
        assert!(matches!(summary.ensure_clean(), Err(Error::GateRefused(_))));
    }

    #[test]
    fn test_null_plaintext_stays_null() {
        let (store, registry, plan) = setup(3);
        store.set("clients", 2, "last_name", Cell::Null);
        store.set("clients", 3, "last_name", Cell::from(""));

        let summary = runner(&store, &registry).run(&plan).unwrap();
        assert_eq!(summary.migrated, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(store.get("clients", 2, "last_name_enc"), Some(Cell::Null));

        let field = EncryptedField::new(Arc::clone(&registry), &plan);
        let stored = store.get_text("clients", 3, "last_name_enc").unwrap();
        assert_eq!(field.decrypt_value(&stored, Some(3)).unwrap(), "");
    }

    #[test]
    fn test_cancel_stops_at_batch_boundary() {
        let (store, registry, plan) = setup(30);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let summary =
            runner(&store, &registry).with_cancel_flag(cancel).run(&plan).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.total, 0);
        assert!(matches!(summary.ensure_clean(), Err(Error::GateRefused(_))));
    }

    #[test]
    fn test_cancel_mid_run_keeps_partial_summary() {
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let (store, registry, plan) = hooked(30, move |_| trigger.cancel());

        let summary = MigrationBatchRunner::new(Arc::clone(&store), Arc::clone(&registry))
            .with_batch_size(10)
            .with_pause(Duration::ZERO)
            .with_cancel_flag(cancel)
            .run(&plan)
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.total, 10);
        assert_eq!(summary.migrated, 10);
        assert!(matches!(summary.ensure_clean(), Err(Error::GateRefused(_))));
        assert!(store.inner.get_text("clients", 10, "last_name_enc").is_some());
        assert_eq!(store.inner.get("clients", 11, "last_name_enc"), Some(Cell::Null));

        let rest = MigrationBatchRunner::new(Arc::clone(&store), registry)
            .with_batch_size(10)
            .with_pause(Duration::ZERO)
            .run(&plan)
            .unwrap();
        assert!(rest.is_clean());
        assert_eq!(rest.migrated, 20);
        assert_eq!(rest.skipped, 10);
    }

    #[test]
    fn test_concurrent_write_wins_over_backfill() {
        let (store, registry, plan) = hooked(5, |inner: &MemoryStore| {
            inner.set("clients", 2, "last_name_enc", Cell::from("fs1:v1:live:write"));
        });

        let summary = MigrationBatchRunner::new(Arc::clone(&store), registry)
            .with_batch_size(10)
            .with_pause(Duration::ZERO)
            .run(&plan)
            .unwrap();
        assert_eq!(summary.total, 5);
        assert_eq!(summary.migrated, 4);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(
            store.inner.get_text("clients", 2, "last_name_enc").as_deref(),
            Some("fs1:v1:live:write")
        );
    }

    #[test]
    fn test_store_failure_aborts_and_resumes() {
        let (store, registry, plan) = setup(25);
        store.fail_next_applies(1);
        let runner = runner(&store, &registry);

        assert!(matches!(runner.run(&plan), Err(Error::Store(_))));
        let summary = runner.run(&plan).unwrap();
        assert_eq!(summary.migrated, 25);
    }

    #[test]
    fn test_backfill_requires_plaintext_column() {
        let (store, registry, _) = setup(1);
        let plan = ColumnPlan::new("clients", "last_name_enc");
        assert!(matches!(runner(&store, &registry).run(&plan), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_backfill_requires_current_key() {
        let (store, _, plan) = setup(1);
        let registry = Arc::new(KeyRegistry::new());
        assert!(matches!(runner(&store, &registry).run(&plan), Err(Error::NoCurrentKey)));
    }

    #[test]
    fn test_summary_merge() {
        let mut total = Summary { total: 2, migrated: 2, ..Summary::default() };
        total.merge(Summary {
            total: 3,
            failed: 1,
            skipped: 2,
            cancelled: true,
            ..Summary::default()
        });
        assert_eq!(total.total, 5);
        assert_eq!(total.failed, 1);
        assert!(total.cancelled);
    }
}
