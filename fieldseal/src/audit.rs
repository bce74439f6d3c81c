//! Post-migration verification.
//!
//! The auditor reads stored values back through the same path live reads take
//! and reports, per row, whether the value is an opaque envelope under a known
//! key that decrypts to the legacy plaintext (while that column still exists).

use crate::config::{ColumnPlan, DEFAULT_BATCH_SIZE};
use crate::envelope::Envelope;
use crate::error::Error;
use crate::field::EncryptedField;
use crate::key_registry::KeyRegistry;
use crate::store::{RowStore, StoredRow};
use rand::Rng;
use std::sync::Arc;
use zeroize::Zeroize;

/// Plaintexts shorter than this are not searched for inside the stored value.
const MIN_OPACITY_CHECK_LEN: usize = 8;

/// Which rows to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// Every row with either column populated
    All,
    /// A uniform random sample of at most this many rows
    Count(usize),
}

/// Result of checking one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCheck {
    /// Table name
    pub table: String,
    /// Encrypted column name
    pub column: String,
    /// Primary key
    pub id: i64,
    /// Key version named by the envelope, if it parsed
    pub version: Option<String>,
    /// Failure reason; `None` when the row passed
    pub failure: Option<String>,
}

impl RowCheck {
    /// Whether the row passed every check.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Aggregate verification outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    /// Rows with either column populated
    pub candidates: u64,
    /// Rows checked
    pub checked: u64,
    /// Rows that passed
    pub passed: u64,
    /// Rows that failed
    pub failures: u64,
    /// Per-row results
    pub rows: Vec<RowCheck>,
}

impl VerificationReport {
    /// Fraction of checked rows that passed; 1.0 when nothing was checked.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn pass_rate(&self) -> f64 {
        if self.checked == 0 {
            1.0
        } else {
            self.passed as f64 / self.checked as f64
        }
    }

    /// Rows that failed.
    pub fn failed_rows(&self) -> impl Iterator<Item = &RowCheck> {
        self.rows.iter().filter(|row| !row.passed())
    }

    /// Folds another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.candidates += other.candidates;
        self.checked += other.checked;
        self.passed += other.passed;
        self.failures += other.failures;
        self.rows.extend(other.rows);
    }

    /// Gate for destructive follow-up steps.
    ///
    /// # Errors
    ///
    /// Returns `Error::GateRefused` if any row failed, or if nothing was
    /// checked although there were rows to check.
    pub fn ensure_clean(&self) -> Result<(), Error> {
        if self.failures > 0 {
            return Err(Error::GateRefused(format!(
                "verification failed for {} of {} row(s)",
                self.failures, self.checked
            )));
        }
        if self.checked == 0 && self.candidates > 0 {
            return Err(Error::GateRefused(format!(
                "no row checked out of {} candidate(s)",
                self.candidates
            )));
        }
        Ok(())
    }

    fn record(&mut self, check: RowCheck) {
        self.checked += 1;
        if check.passed() {
            self.passed += 1;
        } else {
            self.failures += 1;
        }
        self.rows.push(check);
    }
}

/// Samples stored rows and checks they are opaque, resolvable and decryptable.
pub struct VerificationAuditor<S: RowStore> {
    store: Arc<S>,
    registry: Arc<KeyRegistry>,
    batch_size: usize,
}

impl<S: RowStore> VerificationAuditor<S> {
    /// Creates an auditor reading with the default batch size.
    pub fn new(store: Arc<S>, registry: Arc<KeyRegistry>) -> Self {
        Self { store, registry, batch_size: DEFAULT_BATCH_SIZE }
    }

    /// Sets the number of rows read per scan.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Verifies one column.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for an empty sample and `Error::Store`
    /// if reading fails; row problems are reported in the returned
    /// [`VerificationReport`].
    pub fn verify(&self, plan: &ColumnPlan, sample: Sample) -> Result<VerificationReport, Error> {
        self.verify_with_rng(plan, sample, &mut rand::thread_rng())
    }

    /// Verifies every configured column, sampling each one independently.
    ///
    /// # Errors
    ///
    /// See [`verify`](Self::verify).
    pub fn verify_all(
        &self,
        plans: &[ColumnPlan],
        sample: Sample,
    ) -> Result<VerificationReport, Error> {
        let mut report = VerificationReport::default();
        for plan in plans {
            report.merge(self.verify(plan, sample)?);
        }
        Ok(report)
    }

    fn verify_with_rng<R: Rng + ?Sized>(
        &self,
        plan: &ColumnPlan,
        sample: Sample,
        rng: &mut R,
    ) -> Result<VerificationReport, Error> {
        plan.validate()?;
        if sample == Sample::Count(0) {
            return Err(Error::Configuration(
                "verification sample size must be at least 1".to_string(),
            ));
        }
        let field = EncryptedField::new(Arc::clone(&self.registry), plan);
        let mut report = VerificationReport::default();

        match sample {
            Sample::All => {
                self.for_each_row(plan, |row| {
                    report.candidates += 1;
                    report.record(check_row(&field, plan, &row));
                })?;
            }
            Sample::Count(size) => {
                let mut reservoir: Vec<StoredRow> = Vec::with_capacity(size.min(self.batch_size));
                let mut seen = 0usize;
                self.for_each_row(plan, |row| {
                    seen += 1;
                    if reservoir.len() < size {
                        reservoir.push(row);
                    } else {
                        let slot = rng.gen_range(0..seen);
                        if slot < size {
                            reservoir[slot] = row;
                        }
                    }
                })?;
                report.candidates = seen as u64;
                reservoir.sort_by_key(|row| row.id);
                for row in &reservoir {
                    report.record(check_row(&field, plan, row));
                }
            }
        }

        for failed in report.failed_rows() {
            tracing::warn!(
                table = %failed.table,
                column = %failed.column,
                row_id = failed.id,
                reason = failed.failure.as_deref().unwrap_or_default(),
                "verification failed"
            );
        }
        tracing::info!(
            table = %plan.table,
            column = %plan.encrypted_column,
            checked = report.checked,
            failures = report.failures,
            pass_rate = report.pass_rate(),
            "verification finished"
        );
        Ok(report)
    }

    fn for_each_row(
        &self,
        plan: &ColumnPlan,
        mut visit: impl FnMut(StoredRow),
    ) -> Result<(), Error> {
        let mut after = None;
        loop {
            let rows = self.store.scan(plan, after, self.batch_size)?;
            let Some(last) = rows.last() else { break };
            after = Some(last.id);
            let done = rows.len() < self.batch_size;
            rows.into_iter()
                .filter(|row| row.encrypted.is_some() || row.plaintext.is_some())
                .for_each(&mut visit);
            if done {
                break;
            }
        }
        Ok(())
    }
}

fn check_row(field: &EncryptedField, plan: &ColumnPlan, row: &StoredRow) -> RowCheck {
    let mut check = RowCheck {
        table: plan.table.clone(),
        column: plan.encrypted_column.clone(),
        id: row.id,
        version: None,
        failure: None,
    };

    let Some(stored) = &row.encrypted else {
        check.failure = Some("not migrated".to_string());
        return check;
    };

    match Envelope::parse(stored) {
        Ok(envelope) => check.version = Some(envelope.version_label().to_string()),
        Err(err) => {
            check.failure = Some(format!("not an envelope ({})", err.kind()));
            return check;
        }
    }

    let legacy = row.plaintext.as_deref();
    if let Some(legacy) = legacy.filter(|l| l.len() >= MIN_OPACITY_CHECK_LEN) {
        if stored.as_bytes().windows(legacy.len()).any(|w| w == legacy) {
            check.failure = Some("stored value contains the plaintext".to_string());
            return check;
        }
    }

    match field.decrypt_value(stored, Some(row.id)) {
        Ok(mut decrypted) => {
            if legacy.is_some_and(|l| l != decrypted.as_bytes()) {
                check.failure = Some("round-trip mismatch".to_string());
            }
            decrypted.zeroize();
        }
        Err(Error::UnknownKeyVersion(version)) => {
            check.failure = Some(format!("unknown key version {version}"));
        }
        Err(err) => check.failure = Some(format!("does not decrypt ({})", err.kind())),
    }
    check
}
