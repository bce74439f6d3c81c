//! File-based key source for `FieldSeal`.
//!
//! Keys live in a directory with the following structure:
//! ```text
//! keys/
//! ├── v1.key     (32 raw bytes, 0600 permissions)
//! ├── v2.key     (32 raw bytes, 0600 permissions)
//! └── CURRENT    (label of the current version, e.g. "v2")
//! ```
//!
//! Suitable for development, tests and single-host deployments; production
//! key custody belongs in a KMS or secrets manager behind the same
//! [`KeySource`] trait.

#![warn(clippy::pedantic, clippy::nursery)]

use chrono::{DateTime, Utc};
use fieldseal::error::Error;
use fieldseal::key_registry::{validate_label, KeyMaterial, KEY_SIZE};
use fieldseal::key_source::KeySource;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretVec;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, Zeroizing};

const CURRENT_FILE: &str = "CURRENT";
const KEY_EXTENSION: &str = "key";

/// Errors raised while managing a key directory.
#[derive(Debug, thiserror::Error)]
pub enum KeyFileError {
    /// Filesystem failure
    #[error("key directory I/O error: {0}")]
    Io(#[from] io::Error),

    /// Directory does not exist
    #[error("key directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    /// `init` on a directory that already has a current key
    #[error("key directory is already initialized: {0}")]
    AlreadyInitialized(PathBuf),

    /// Label is not a valid version label
    #[error("invalid key label {0:?}")]
    InvalidLabel(String),

    /// A key file with this label already exists
    #[error("key {0} already exists")]
    KeyExists(String),

    /// No key file with this label
    #[error("key {0} not found")]
    UnknownKey(String),

    /// Key file has the wrong length
    #[error("key {label} has {len} bytes (expected: {KEY_SIZE})")]
    InvalidKeyLength {
        /// Key label
        label: String,
        /// Actual length
        len: usize,
    },

    /// `CURRENT` is missing or empty
    #[error("no current key selected")]
    NoCurrentKey,

    /// Refused to destroy the current key
    #[error("key {0} is current and cannot be destroyed")]
    DestroyCurrent(String),
}

impl From<KeyFileError> for Error {
    fn from(err: KeyFileError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Key source backed by a directory of raw key files.
#[derive(Debug, Clone)]
pub struct FileKeySource {
    key_dir: PathBuf,
}

impl FileKeySource {
    /// Opens an existing key directory.
    ///
    /// # Arguments
    ///
    /// * `key_dir` - Directory containing key files
    ///
    /// # Errors
    ///
    /// Returns `KeyFileError::MissingDirectory` if the directory does not exist.
    pub fn open(key_dir: impl Into<PathBuf>) -> Result<Self, KeyFileError> {
        let key_dir = key_dir.into();
        if !key_dir.is_dir() {
            return Err(KeyFileError::MissingDirectory(key_dir));
        }
        Ok(Self { key_dir })
    }

    /// Creates a key directory holding a fresh key `label` marked current.
    ///
    /// # Errors
    ///
    /// Returns `KeyFileError::AlreadyInitialized` if the directory already has
    /// a `CURRENT` file, or an I/O error.
    pub fn init(key_dir: impl Into<PathBuf>, label: &str) -> Result<Self, KeyFileError> {
        let key_dir = key_dir.into();
        if key_dir.join(CURRENT_FILE).exists() {
            return Err(KeyFileError::AlreadyInitialized(key_dir));
        }
        fs::create_dir_all(&key_dir)?;
        restrict_permissions(&key_dir, 0o700)?;

        let source = Self { key_dir };
        source.generate(label)?;
        source.set_current(label)?;
        tracing::info!(
            dir = %source.key_dir.display(),
            version = label,
            "initialized key directory"
        );
        Ok(source)
    }

    /// Key directory path.
    #[must_use]
    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    /// Writes a new random key under `label` and returns its bytes.
    ///
    /// The key is not made current; see [`set_current`](Self::set_current).
    ///
    /// # Errors
    ///
    /// Returns `KeyFileError::KeyExists` if the label is taken, or an I/O error.
    pub fn generate(&self, label: &str) -> Result<SecretVec<u8>, KeyFileError> {
        check_label(label)?;
        let path = self.key_path(label);

        let mut key = Zeroizing::new(vec![0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut key);

        let mut file = match create_private(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(KeyFileError::KeyExists(label.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&key)?;
        file.sync_all()?;

        tracing::info!(version = label, "generated key file");
        Ok(SecretVec::new(key.to_vec()))
    }

    /// Reads the raw bytes of one key.
    ///
    /// # Errors
    ///
    /// Returns `KeyFileError::UnknownKey` if there is no such key file and
    /// `KeyFileError::InvalidKeyLength` if it is not [`KEY_SIZE`] bytes.
    pub fn read_key(&self, label: &str) -> Result<SecretVec<u8>, KeyFileError> {
        check_label(label)?;
        let mut bytes = match fs::read(self.key_path(label)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(KeyFileError::UnknownKey(label.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.len() != KEY_SIZE {
            let len = bytes.len();
            bytes.zeroize();
            return Err(KeyFileError::InvalidKeyLength { label: label.to_string(), len });
        }
        Ok(SecretVec::new(bytes))
    }

    /// Label stored in `CURRENT`.
    ///
    /// # Errors
    ///
    /// Returns `KeyFileError::NoCurrentKey` if `CURRENT` is missing or empty.
    pub fn current(&self) -> Result<String, KeyFileError> {
        let label = match fs::read_to_string(self.key_dir.join(CURRENT_FILE)) {
            Ok(text) => text.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(KeyFileError::NoCurrentKey),
            Err(e) => return Err(e.into()),
        };
        if label.is_empty() {
            return Err(KeyFileError::NoCurrentKey);
        }
        Ok(label)
    }

    /// Points `CURRENT` at an existing key.
    ///
    /// # Errors
    ///
    /// Returns `KeyFileError::UnknownKey` if there is no such key file.
    pub fn set_current(&self, label: &str) -> Result<(), KeyFileError> {
        check_label(label)?;
        if !self.key_path(label).is_file() {
            return Err(KeyFileError::UnknownKey(label.to_string()));
        }
        let staging = self.key_dir.join(format!("{CURRENT_FILE}.tmp"));
        fs::write(&staging, format!("{label}\n"))?;
        fs::rename(&staging, self.key_dir.join(CURRENT_FILE))?;
        tracing::info!(version = label, "current key file changed");
        Ok(())
    }

    /// All key labels in the directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be listed.
    pub fn labels(&self) -> Result<Vec<String>, KeyFileError> {
        let mut labels = Vec::new();
        for entry in fs::read_dir(&self.key_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_EXTENSION) {
                continue;
            }
            if let Some(label) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_label(label).is_ok() {
                    labels.push(label.to_string());
                }
            }
        }
        labels.sort();
        Ok(labels)
    }

    /// Overwrites a retired key with zeros and deletes it.
    ///
    /// # Errors
    ///
    /// Returns `KeyFileError::DestroyCurrent` for the current key and
    /// `KeyFileError::UnknownKey` if there is no such key file.
    pub fn destroy(&self, label: &str) -> Result<(), KeyFileError> {
        check_label(label)?;
        if self.current().ok().as_deref() == Some(label) {
            return Err(KeyFileError::DestroyCurrent(label.to_string()));
        }
        let path = self.key_path(label);
        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(KeyFileError::UnknownKey(label.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut file = fs::OpenOptions::new().write(true).open(&path)?;
        let zeros = vec![0u8; usize::try_from(len).unwrap_or(KEY_SIZE)];
        file.write_all(&zeros)?;
        file.sync_all()?;
        drop(file);
        fs::remove_file(&path)?;

        tracing::info!(version = label, "destroyed key file");
        Ok(())
    }

    fn key_path(&self, label: &str) -> PathBuf {
        self.key_dir.join(format!("{label}.{KEY_EXTENSION}"))
    }

    fn created_at(&self, label: &str) -> Result<DateTime<Utc>, KeyFileError> {
        let modified = fs::metadata(self.key_path(label))?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }
}

impl KeySource for FileKeySource {
    fn load(&self) -> Result<Vec<KeyMaterial>, Error> {
        let current = self.current()?;
        let labels = self.labels()?;
        if !labels.contains(&current) {
            return Err(KeyFileError::UnknownKey(current).into());
        }

        let mut materials = Vec::with_capacity(labels.len());
        for label in labels {
            let key = self.read_key(&label)?;
            let created_at = self.created_at(&label)?;
            let mut material =
                KeyMaterial { key_bytes: key, ..KeyMaterial::new(label.as_str(), Vec::new()) }
                    .with_created_at(created_at);
            if label == current {
                material = material.current();
            }
            materials.push(material);
        }
        Ok(materials)
    }
}

fn check_label(label: &str) -> Result<(), KeyFileError> {
    validate_label(label).map_err(|_| KeyFileError::InvalidLabel(label.to_string()))
}

/// Creates a new file readable only by the owner.
fn create_private(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> Result<(), KeyFileError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn restrict_permissions(_path: &Path, _mode: u32) -> Result<(), KeyFileError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldseal::key_registry::KeyRegistry;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_current_key() {
        let dir = TempDir::new().unwrap();
        let source = FileKeySource::init(dir.path().join("keys"), "v1").unwrap();

        assert_eq!(source.current().unwrap(), "v1");
        assert_eq!(source.labels().unwrap(), vec!["v1"]);
        assert_eq!(source.read_key("v1").unwrap().expose_secret().len(), KEY_SIZE);
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = TempDir::new().unwrap();
        FileKeySource::init(dir.path(), "v1").unwrap();
        assert!(matches!(
            FileKeySource::init(dir.path(), "v1"),
            Err(KeyFileError::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn test_open_missing_directory() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            FileKeySource::open(dir.path().join("absent")),
            Err(KeyFileError::MissingDirectory(_))
        ));
    }

    #[test]
    fn test_generate_refuses_existing_label() {
        let dir = TempDir::new().unwrap();
        let source = FileKeySource::init(dir.path(), "v1").unwrap();
        assert!(matches!(source.generate("v1"), Err(KeyFileError::KeyExists(_))));
        assert!(matches!(source.generate("../v2"), Err(KeyFileError::InvalidLabel(_))));
    }

    #[test]
    fn test_generated_keys_differ() {
        let dir = TempDir::new().unwrap();
        let source = FileKeySource::init(dir.path(), "v1").unwrap();
        let v2 = source.generate("v2").unwrap();
        let v1 = source.read_key("v1").unwrap();
        assert_ne!(v1.expose_secret(), v2.expose_secret());
        assert_eq!(source.read_key("v2").unwrap().expose_secret(), v2.expose_secret());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let source = FileKeySource::init(dir.path(), "v1").unwrap();
        let mode = fs::metadata(source.key_path("v1")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let mode = fs::metadata(dir.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_created_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scratch.key");
        drop(create_private(&path).unwrap());
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(create_private(&path).unwrap_err().kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_load_into_registry() {
        let dir = TempDir::new().unwrap();
        let source = FileKeySource::init(dir.path(), "v1").unwrap();
        source.generate("v2").unwrap();
        source.set_current("v2").unwrap();

        let registry = KeyRegistry::from_source(&source).unwrap();
        assert_eq!(registry.current_label().as_deref(), Some("v2"));
        assert_eq!(registry.labels(), vec!["v1", "v2"]);
    }

    #[test]
    fn test_load_rejects_truncated_key() {
        let dir = TempDir::new().unwrap();
        let source = FileKeySource::init(dir.path(), "v1").unwrap();
        fs::write(dir.path().join("v0.key"), [1u8; 16]).unwrap();
        assert!(matches!(source.load(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_load_rejects_dangling_current() {
        let dir = TempDir::new().unwrap();
        let source = FileKeySource::init(dir.path(), "v1").unwrap();
        fs::write(dir.path().join(CURRENT_FILE), "v9\n").unwrap();
        assert!(matches!(source.load(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_set_current_unknown() {
        let dir = TempDir::new().unwrap();
        let source = FileKeySource::init(dir.path(), "v1").unwrap();
        assert!(matches!(source.set_current("v5"), Err(KeyFileError::UnknownKey(_))));
        assert_eq!(source.current().unwrap(), "v1");
    }

    #[test]
    fn test_destroy() {
        let dir = TempDir::new().unwrap();
        let source = FileKeySource::init(dir.path(), "v1").unwrap();
        source.generate("v2").unwrap();

        assert!(matches!(source.destroy("v1"), Err(KeyFileError::DestroyCurrent(_))));
        source.destroy("v2").unwrap();
        assert!(!source.key_path("v2").exists());
        assert!(matches!(source.destroy("v2"), Err(KeyFileError::UnknownKey(_))));
    }
}
