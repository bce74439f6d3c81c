//! Key source abstraction for provisioning key material at startup.

use crate::error::Error;
use crate::key_registry::KeyMaterial;

/// Supplies raw key material and metadata to a [`KeyRegistry`].
///
/// Where the bytes come from (files, environment, a secrets manager) is the
/// implementation's concern. Implementations must be thread-safe so a source
/// can be reloaded from a background task.
///
/// [`KeyRegistry`]: crate::key_registry::KeyRegistry
///
/// # Example
///
/// ```rust,ignore
/// use fieldseal::key_source::KeySource;
///
/// struct EnvSource;
///
/// impl KeySource for EnvSource {
///     fn load(&self) -> Result<Vec<KeyMaterial>, Error> {
///         // Implementation
///     }
/// }
/// ```
pub trait KeySource: Send + Sync {
    /// Loads every key version the source holds.
    ///
    /// Exactly one returned entry is expected to be marked current.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the material cannot be read or is
    /// inconsistent.
    fn load(&self) -> Result<Vec<KeyMaterial>, Error>;
}

impl<F> KeySource for F
where
    F: Fn() -> Result<Vec<KeyMaterial>, Error> + Send + Sync,
{
    fn load(&self) -> Result<Vec<KeyMaterial>, Error> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_registry::{KeyRegistry, KEY_SIZE};

    #[test]
    fn test_registry_from_closure_source() {
        let source = || -> Result<Vec<KeyMaterial>, Error> {
            Ok(vec![
                KeyMaterial::new("v1", vec![1u8; KEY_SIZE]),
                KeyMaterial::new("v2", vec![2u8; KEY_SIZE]).current(),
            ])
        };

        let registry = KeyRegistry::from_source(&source).unwrap();
        assert_eq!(registry.current().unwrap().label(), "v2");
        assert_eq!(registry.labels(), vec!["v1".to_string(), "v2".to_string()]);
    }

    #[test]
    fn test_source_without_current_is_rejected() {
        let source = || -> Result<Vec<KeyMaterial>, Error> {
            Ok(vec![KeyMaterial::new("v1", vec![1u8; KEY_SIZE])])
        };
        assert!(matches!(KeyRegistry::from_source(&source), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_source_with_two_current_is_rejected() {
        let source = || -> Result<Vec<KeyMaterial>, Error> {
            Ok(vec![
                KeyMaterial::new("v1", vec![1u8; KEY_SIZE]).current(),
                KeyMaterial::new("v2", vec![2u8; KEY_SIZE]).current(),
            ])
        };
        assert!(matches!(KeyRegistry::from_source(&source), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_source_error_propagates() {
        let source = || -> Result<Vec<KeyMaterial>, Error> {
            Err(Error::Configuration("secret store unreachable".to_string()))
        };
        let err = KeyRegistry::from_source(&source).err().unwrap();
        assert!(err.to_string().contains("secret store unreachable"));
    }
}
