//! TOML settings for the `fieldseal` binary.

use anyhow::{Context, Result};
use fieldseal::config::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default settings file name.
pub const DEFAULT_SETTINGS_FILE: &str = "fieldseal.toml";

/// Database, key directory and engine configuration.
///
/// ```toml
/// database = "clinic.db"
/// key_dir = "keys"
/// batch_size = 100
/// rate_limit_ms = 50
///
/// [[columns]]
/// table = "clients"
/// plaintext_column = "date_of_birth"
/// encrypted_column = "date_of_birth_enc"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// `SQLite` database file
    pub database: PathBuf,
    /// Key directory
    pub key_dir: PathBuf,
    /// Batch sizes and protected columns
    #[serde(flatten)]
    pub engine: EngineConfig,
}

impl Settings {
    /// Parses settings; relative paths are resolved against `base`.
    pub fn parse(text: &str, base: &Path) -> Result<Self> {
        let mut settings: Self = toml::from_str(text).context("invalid settings")?;
        settings.engine.validate()?;
        settings.database = base.join(&settings.database);
        settings.key_dir = base.join(&settings.key_dir);
        Ok(settings)
    }

    /// Loads settings from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Self::parse(&text, base).with_context(|| format!("in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings() {
        let text = r#"
            database = "clinic.db"
            key_dir = "keys"
            batch_size = 25

            [[columns]]
            table = "clients"
            plaintext_column = "email"
            encrypted_column = "email_enc"

            [[columns]]
            table = "sessions"
            encrypted_column = "notes_enc"
            bind_row_id = false
        "#;
        let settings = Settings::parse(text, Path::new("/srv/app")).unwrap();
        assert_eq!(settings.database, Path::new("/srv/app/clinic.db"));
        assert_eq!(settings.engine.batch_size, 25);
        assert_eq!(settings.engine.rate_limit_ms, fieldseal::config::DEFAULT_RATE_LIMIT_MS);
        assert_eq!(settings.engine.columns.len(), 2);
        assert_eq!(settings.engine.columns[0].primary_key, "id");
        assert!(!settings.engine.columns[1].bind_row_id);
    }

    #[test]
    fn test_absolute_paths_kept() {
        let text = "database = \"/data/app.db\"\nkey_dir = \"/etc/keys\"\n";
        let settings = Settings::parse(text, Path::new("conf")).unwrap();
        assert_eq!(settings.database, Path::new("/data/app.db"));
        assert_eq!(settings.key_dir, Path::new("/etc/keys"));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let text = "database = \"a.db\"\nkey_dir = \"k\"\nbatch_size = 0\n";
        assert!(Settings::parse(text, Path::new("")).is_err());

        let text = "database = \"a.db\"\nkey_dir = \"k\"\nverify_sample = 0\n";
        assert!(Settings::parse(text, Path::new("")).is_err());

        let text = "database = \"a.db\"\n";
        assert!(Settings::parse(text, Path::new("")).is_err());
    }
}
