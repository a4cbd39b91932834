use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use olmdev_store::persistence::DEFAULT_PBKDF2_ITERATIONS;
use serde::Deserialize;

/// CLI configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct CliConfig {
    /// Encrypted store file holding the device state.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Key used to pickle the account and sessions inside the store.
    /// Falls back to the library default when unset.
    #[serde(default)]
    pub pickle_key: Option<String>,

    /// Number of unpublished one-time keys `init` tops the account up to.
    #[serde(default = "default_one_time_key_target")]
    pub one_time_key_target: usize,

    /// PBKDF2 rounds for the store passphrase.
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,

    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_store_path() -> String {
    "olmdev.store".into()
}

fn default_one_time_key_target() -> usize {
    50
}

fn default_pbkdf2_iterations() -> u32 {
    DEFAULT_PBKDF2_ITERATIONS
}

fn default_log_filter() -> String {
    "olmdev=info".into()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            pickle_key: None,
            one_time_key_target: default_one_time_key_target(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
            log_filter: default_log_filter(),
        }
    }
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = CliConfig::default();
        assert_eq!(config.store_path, "olmdev.store");
        assert_eq!(config.one_time_key_target, 50);
        assert_eq!(config.pbkdf2_iterations, 600_000);
        assert_eq!(config.log_filter, "olmdev=info");
        assert!(config.pickle_key.is_none());
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            store_path = "/var/lib/olmdev/device.store"
            pickle_key = "hunter2"
            one_time_key_target = 10
        "#;
        let config: CliConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.store_path, "/var/lib/olmdev/device.store");
        assert_eq!(config.pickle_key.as_deref(), Some("hunter2"));
        assert_eq!(config.one_time_key_target, 10);
        assert_eq!(config.pbkdf2_iterations, 600_000);
    }

    #[test]
    fn load_reports_missing_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CliConfig::load(&dir.path().join("missing.toml")).is_err());

        let path = dir.path().join("olmdev.toml");
        fs::write(&path, "one_time_key_target = \"many\"").unwrap();
        let err = CliConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("invalid config file"));

        fs::write(&path, "log_filter = \"debug\"").unwrap();
        assert_eq!(CliConfig::load(&path).unwrap().log_filter, "debug");
    }
}
