//! Versioned key registry.
//!
//! The registry owns every key version the process knows about and a pointer
//! to the current one. Readers take an `Arc` of an immutable snapshot, so a
//! single encrypt or decrypt always sees one consistent key set; writers build
//! a new snapshot and swap it in under the write lock.

use crate::error::Error;
use crate::key_source::KeySource;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretVec};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Maximum length of a version label.
pub const MAX_LABEL_LEN: usize = 64;

/// Key material handed to the registry at provisioning or rotation time.
pub struct KeyMaterial {
    /// Unique version label, e.g. `v1`
    pub version_label: String,
    /// Raw key bytes (must be [`KEY_SIZE`] long)
    pub key_bytes: SecretVec<u8>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Optional advisory expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether this version should become current
    pub is_current: bool,
}

impl KeyMaterial {
    /// Creates non-current key material created now.
    #[must_use]
    pub fn new(version_label: impl Into<String>, key_bytes: Vec<u8>) -> Self {
        Self {
            version_label: version_label.into(),
            key_bytes: SecretVec::new(key_bytes),
            created_at: Utc::now(),
            expires_at: None,
            is_current: false,
        }
    }

    /// Marks the material as the current key.
    #[must_use]
    pub const fn current(mut self) -> Self {
        self.is_current = true;
        self
    }

    /// Sets the creation timestamp.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Sets an advisory expiry.
    #[must_use]
    pub const fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// An immutable, registered key version.
pub struct KeyVersion {
    version_label: String,
    key: SecretVec<u8>,
    fingerprint: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyVersion")
            .field("version_label", &self.version_label)
            .field("key", &"[REDACTED]")
            .field("fingerprint", &self.fingerprint)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl KeyVersion {
    fn from_material(material: KeyMaterial) -> Result<Self, Error> {
        validate_label(&material.version_label)?;

        let len = material.key_bytes.expose_secret().len();
        if len != KEY_SIZE {
            return Err(Error::Configuration(format!(
                "key {} must be {KEY_SIZE} bytes, got {len}",
                material.version_label
            )));
        }

        let fingerprint = fingerprint(material.key_bytes.expose_secret());
        Ok(Self {
            version_label: material.version_label,
            key: material.key_bytes,
            fingerprint,
            created_at: material.created_at,
            expires_at: material.expires_at,
        })
    }

    /// Returns the version label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.version_label
    }

    /// Non-secret identifier of the key material, safe for logs.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the advisory expiry, if any.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the key is past its advisory expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub(crate) fn key_bytes(&self) -> &[u8] {
        self.key.expose_secret()
    }

    fn same_material(&self, other: &Self) -> bool {
        self.key.expose_secret() == other.key.expose_secret()
    }
}

/// Validates a version label.
///
/// Labels appear verbatim in stored envelopes, so they are restricted to
/// `[A-Za-z0-9._-]` and at most [`MAX_LABEL_LEN`] bytes.
///
/// # Errors
///
/// Returns `Error::Configuration` for an empty, too long or non-conforming label.
pub fn validate_label(label: &str) -> Result<(), Error> {
    if label.is_empty() {
        return Err(Error::Configuration("key version label is empty".to_string()));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(Error::Configuration(format!(
            "key version label too long: {} bytes (max: {MAX_LABEL_LEN})",
            label.len()
        )));
    }
    if !label.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-')) {
        return Err(Error::Configuration(format!("invalid key version label: {label:?}")));
    }
    Ok(())
}

fn fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..8])
}

#[derive(Default)]
struct Snapshot {
    keys: HashMap<String, Arc<KeyVersion>>,
    current: Option<String>,
}

impl Snapshot {
    fn insert(&mut self, version: KeyVersion) -> Result<Arc<KeyVersion>, Error> {
        if let Some(existing) = self.keys.get(version.label()) {
            if existing.same_material(&version) {
                return Ok(Arc::clone(existing));
            }
            return Err(Error::Configuration(format!(
                "key version {} is already registered with different key material",
                version.label()
            )));
        }
        let version = Arc::new(version);
        self.keys.insert(version.label().to_string(), Arc::clone(&version));
        Ok(version)
    }
}

/// Registry of key versions with a single current version.
pub struct KeyRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl KeyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { snapshot: RwLock::new(Arc::new(Snapshot::default())) }
    }

    /// Builds a registry from a key source.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the source yields invalid material or
    /// does not mark exactly one key as current.
    pub fn from_source(source: &dyn KeySource) -> Result<Self, Error> {
        let materials = source.load()?;
        let current = materials.iter().filter(|m| m.is_current).count();
        if current != 1 {
            return Err(Error::Configuration(format!(
                "key source must mark exactly one key as current, found {current}"
            )));
        }

        let registry = Self::new();
        for material in materials {
            registry.register(material)?;
        }
        Ok(registry)
    }

    /// Registers a key version.
    ///
    /// Registering the same label with identical bytes is a no-op. If the
    /// material is marked current, the current pointer moves to it in the
    /// same swap.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the key is not 32 bytes, the label is
    /// invalid, or the label is already registered with different bytes.
    pub fn register(&self, material: KeyMaterial) -> Result<Arc<KeyVersion>, Error> {
        let make_current = material.is_current;
        let version = KeyVersion::from_material(material)?;

        let mut guard = self.snapshot.write();
        let mut next = Snapshot { keys: guard.keys.clone(), current: guard.current.clone() };
        let version = next.insert(version)?;
        if make_current {
            next.current = Some(version.label().to_string());
        }
        *guard = Arc::new(next);
        drop(guard);

        tracing::info!(
            version = version.label(),
            fingerprint = version.fingerprint(),
            current = make_current,
            "registered key version"
        );
        if make_current {
            warn_if_expired(&version);
        }
        Ok(version)
    }

    /// Returns the current key version.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoCurrentKey` if no current key is set.
    pub fn current(&self) -> Result<Arc<KeyVersion>, Error> {
        let snapshot = self.load();
        snapshot
            .current
            .as_ref()
            .and_then(|label| snapshot.keys.get(label))
            .cloned()
            .ok_or(Error::NoCurrentKey)
    }

    /// Returns the label of the current key, if any.
    #[must_use]
    pub fn current_label(&self) -> Option<String> {
        self.load().current.clone()
    }

    /// Resolves any registered version.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownKeyVersion` if the label is not registered.
    pub fn resolve(&self, version_label: &str) -> Result<Arc<KeyVersion>, Error> {
        self.load()
            .keys
            .get(version_label)
            .cloned()
            .ok_or_else(|| Error::UnknownKeyVersion(version_label.to_string()))
    }

    /// Moves the current pointer to an already registered version.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownKeyVersion` if the label is not registered.
    pub fn set_current(&self, version_label: &str) -> Result<Arc<KeyVersion>, Error> {
        let mut guard = self.snapshot.write();
        let version = guard
            .keys
            .get(version_label)
            .cloned()
            .ok_or_else(|| Error::UnknownKeyVersion(version_label.to_string()))?;
        let previous = guard.current.clone();
        let next = Snapshot { keys: guard.keys.clone(), current: Some(version_label.to_string()) };
        *guard = Arc::new(next);
        drop(guard);

        tracing::info!(
            previous = previous.as_deref().unwrap_or("none"),
            current = version_label,
            "current key version changed"
        );
        warn_if_expired(&version);
        Ok(version)
    }

    /// Registers new material and makes it current in one swap.
    ///
    /// Returns the label that was current before the swap.
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub fn rotate_to(&self, material: KeyMaterial) -> Result<Option<String>, Error> {
        let version = KeyVersion::from_material(material)?;

        let mut guard = self.snapshot.write();
        let previous = guard.current.clone();
        let mut next = Snapshot { keys: guard.keys.clone(), current: previous.clone() };
        let version = next.insert(version)?;
        next.current = Some(version.label().to_string());
        *guard = Arc::new(next);
        drop(guard);

        tracing::info!(
            previous = previous.as_deref().unwrap_or("none"),
            current = version.label(),
            fingerprint = version.fingerprint(),
            "rotated current key version"
        );
        Ok(previous)
    }

    /// Removes a non-current version.
    ///
    /// The key material is zeroized once the last in-flight holder drops it.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownKeyVersion` for an unknown label and
    /// `Error::Configuration` when asked to remove the current key.
    pub fn remove(&self, version_label: &str) -> Result<(), Error> {
        let mut guard = self.snapshot.write();
        if !guard.keys.contains_key(version_label) {
            return Err(Error::UnknownKeyVersion(version_label.to_string()));
        }
        if guard.current.as_deref() == Some(version_label) {
            return Err(Error::Configuration(format!(
                "cannot remove current key version {version_label}"
            )));
        }
        let mut next = Snapshot { keys: guard.keys.clone(), current: guard.current.clone() };
        next.keys.remove(version_label);
        *guard = Arc::new(next);
        drop(guard);

        tracing::info!(version = version_label, "removed key version");
        Ok(())
    }

    /// Whether a version is registered.
    #[must_use]
    pub fn contains(&self, version_label: &str) -> bool {
        self.load().keys.contains_key(version_label)
    }

    /// All registered labels, sorted.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.load().keys.keys().cloned().collect();
        labels.sort();
        labels
    }

    fn load(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn warn_if_expired(version: &KeyVersion) {
    if version.is_expired(Utc::now()) {
        tracing::warn!(
            version = version.label(),
            expires_at = ?version.expires_at(),
            "current key version is past its expiry; schedule a rotation"
        );
    }
}
