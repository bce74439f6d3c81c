//! Key rotation: `Stable -> Rotating -> Draining -> Retired`.
//!
//! A new version becomes current in one registry swap, so every write after
//! [`RotationCoordinator::rotate`] uses it while old rows keep decrypting. The
//! drain job reseals old rows in place, and a version can only be retired once
//! no stored value references it.

use crate::config::{ColumnPlan, DEFAULT_RATE_LIMIT_MS};
use crate::envelope::{peek_version, version_prefix};
use crate::error::Error;
use crate::field::EncryptedField;
use crate::key_registry::{KeyMaterial, KeyRegistry};
use crate::migration::{run_batches, BatchSettings, CancelFlag, RowOutcome, Summary};
use crate::store::{CellUpdate, RowStore};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where the coordinator is in the rotation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    /// One current key, nothing to drain
    Stable,
    /// New key is current, old rows not yet drained
    Rotating,
    /// Old rows are being resealed
    Draining,
    /// The old version has been removed
    Retired,
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stable => "stable",
            Self::Rotating => "rotating",
            Self::Draining => "draining",
            Self::Retired => "retired",
        };
        f.write_str(name)
    }
}

/// Identifies one rotation from an old version to a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationHandle {
    from: String,
    to: String,
}

impl RotationHandle {
    /// Rebuilds a handle, e.g. to resume draining after a restart.
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into() }
    }

    /// Version being drained.
    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Version that is current.
    #[must_use]
    pub fn to(&self) -> &str {
        &self.to
    }
}

/// Snapshot of the coordinator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationStatus {
    /// Lifecycle phase
    pub phase: RotationPhase,
    /// Current key version
    pub current: Option<String>,
    /// Version being drained, if any
    pub retiring: Option<String>,
}

#[derive(Debug)]
struct State {
    phase: RotationPhase,
    handle: Option<RotationHandle>,
}

/// Drives rotation across every configured encrypted column.
pub struct RotationCoordinator<S: RowStore> {
    registry: Arc<KeyRegistry>,
    store: Arc<S>,
    columns: Vec<ColumnPlan>,
    pause: Duration,
    cancel: CancelFlag,
    state: Mutex<State>,
}

impl<S: RowStore> RotationCoordinator<S> {
    /// Creates a coordinator in the `Stable` phase.
    pub fn new(registry: Arc<KeyRegistry>, store: Arc<S>, columns: Vec<ColumnPlan>) -> Self {
        Self {
            registry,
            store,
            columns,
            pause: Duration::from_millis(DEFAULT_RATE_LIMIT_MS),
            cancel: CancelFlag::new(),
            state: Mutex::new(State { phase: RotationPhase::Stable, handle: None }),
        }
    }

    /// Sets the pause between drain batches.
    #[must_use]
    pub const fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Uses an externally controlled cancel flag for drains.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Registers `key_bytes` as `version_label` and makes it current.
    ///
    /// The previous version stays resolvable until it is retired.
    ///
    /// # Errors
    ///
    /// - `Error::RotationInProgress` if an earlier rotation is not retired
    /// - `Error::NoCurrentKey` if there is nothing to rotate away from
    /// - `Error::Configuration` for invalid or conflicting key material
    pub fn rotate(&self, version_label: &str, key_bytes: Vec<u8>) -> Result<RotationHandle, Error> {
        let mut state = self.state.lock();
        if let (RotationPhase::Rotating | RotationPhase::Draining, Some(handle)) =
            (state.phase, &state.handle)
        {
            return Err(Error::RotationInProgress {
                from: handle.from.clone(),
                to: handle.to.clone(),
            });
        }

        let from = self.registry.current()?.label().to_string();
        if from == version_label {
            return Err(Error::Configuration(format!("{version_label} is already current")));
        }
        self.registry.rotate_to(KeyMaterial::new(version_label, key_bytes).current())?;

        let handle = RotationHandle::new(from, version_label);
        state.phase = RotationPhase::Rotating;
        state.handle = Some(handle.clone());
        drop(state);

        tracing::info!(from = %handle.from, to = %handle.to, "rotation started");
        Ok(handle)
    }

    /// Reseals every stored value that is not under the current key.
    ///
    /// Rows that fail keep their old value and are reported in the summary;
    /// draining again later picks them up.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `handle.to()` is not the current
    /// version, and `Error::Store` on persistence failures.
    pub fn drain(&self, handle: &RotationHandle, batch_size: usize) -> Result<Summary, Error> {
        let current = self.registry.current()?;
        if current.label() != handle.to {
            return Err(Error::Configuration(format!(
                "cannot drain into {}: current key version is {}",
                handle.to,
                current.label()
            )));
        }
        {
            let mut state = self.state.lock();
            state.phase = RotationPhase::Draining;
            state.handle = Some(handle.clone());
        }

        let settings =
            BatchSettings { batch_size, pause: self.pause, cancel: self.cancel.clone() };
        let mut summary = Summary::default();
        for plan in &self.columns {
            // Draining never reads the legacy column, which may already be gone.
            let plan = plan.encrypted_only();
            let field = EncryptedField::new(Arc::clone(&self.registry), &plan);
            let target = current.label();
            summary.merge(run_batches(self.store.as_ref(), &plan, &settings, "drain", |row| {
                let Some(stored) = &row.encrypted else {
                    return RowOutcome::Skip;
                };
                if peek_version(stored) == Some(target) {
                    return RowOutcome::Skip;
                }
                match field.reseal(stored, Some(row.id)) {
                    Ok(Some(value)) => RowOutcome::Write(CellUpdate {
                        id: row.id,
                        expected: Some(stored.clone()),
                        value,
                    }),
                    Ok(None) => RowOutcome::Skip,
                    Err(err) => RowOutcome::Fail(err),
                }
            })?);
            if summary.cancelled {
                break;
            }
        }

        tracing::info!(
            from = %handle.from,
            to = %handle.to,
            resealed = summary.migrated,
            failed = summary.failed,
            "drain finished"
        );
        Ok(summary)
    }

    /// Number of stored values under `version_label` across all columns.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if counting fails.
    pub fn references(&self, version_label: &str) -> Result<u64, Error> {
        let prefix = version_prefix(version_label);
        let mut total = 0;
        for plan in &self.columns {
            total += self.store.count_with_prefix(plan, &prefix)?;
        }
        Ok(total)
    }

    /// Removes a version from the registry once nothing references it.
    ///
    /// # Errors
    ///
    /// - `Error::Configuration` when asked to retire the current version
    /// - `Error::UnknownKeyVersion` if the version is not registered
    /// - `Error::VersionStillInUse` while stored values reference it
    pub fn retire(&self, version_label: &str) -> Result<(), Error> {
        if self.registry.current_label().as_deref() == Some(version_label) {
            return Err(Error::Configuration(format!(
                "cannot retire current key version {version_label}"
            )));
        }
        if !self.registry.contains(version_label) {
            return Err(Error::UnknownKeyVersion(version_label.to_string()));
        }

        let references = self.references(version_label)?;
        if references > 0 {
            tracing::warn!(version = version_label, references, "retirement refused");
            return Err(Error::VersionStillInUse { version: version_label.to_string(), references });
        }

        self.registry.remove(version_label)?;
        let mut state = self.state.lock();
        if state.handle.as_ref().is_some_and(|h| h.from == version_label) {
            state.phase = RotationPhase::Retired;
        }
        drop(state);

        tracing::info!(version = version_label, "key version retired");
        Ok(())
    }

    /// Current phase and versions.
    #[must_use]
    pub fn status(&self) -> RotationStatus {
        let state = self.state.lock();
        let retiring = match state.phase {
            RotationPhase::Rotating | RotationPhase::Draining => {
                state.handle.as_ref().map(|h| h.from.clone())
            }
            RotationPhase::Stable | RotationPhase::Retired => None,
        };
        RotationStatus { phase: state.phase, current: self.registry.current_label(), retiring }
    }
}
