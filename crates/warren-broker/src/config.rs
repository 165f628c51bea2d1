use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Database directory, used by the sled store only.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            path: PathBuf::from("warren-data"),
        }
    }
}

/// Broker settings. Every field has a default, so an empty source is valid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Prefetch applied when a consumer does not ask for one. `0` is unlimited.
    pub default_prefetch: u16,
    /// Ready messages a queue holds before dropping new copies.
    pub max_queue_length: usize,
    pub store: StoreConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_prefetch: 1,
            max_queue_length: 100_000,
            store: StoreConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Loads settings from an optional file, then `WARREN__*` environment
    /// variables (`WARREN__STORE__KIND=sled`), later sources winning.
    pub fn load(path: Option<&Path>) -> Result<Self, BrokerError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("WARREN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn with_default_prefetch(mut self, prefetch: u16) -> Self {
        self.default_prefetch = prefetch;
        self
    }

    pub fn with_max_queue_length(mut self, max_queue_length: usize) -> Self {
        self.max_queue_length = max_queue_length;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.default_prefetch, 1);
        assert_eq!(cfg.store.kind, StoreKind::Memory);
    }

    #[test]
    fn load_config_from_file_overrides_defaults() {
        let tmp = TempDir::new().expect("create tempdir");
        let path = tmp.path().join("warren.toml");
        let toml = r#"
            default_prefetch = 5

            [store]
            kind = "sled"
            path = "/var/lib/warren"
        "#;
        fs::write(&path, toml).expect("write config file");

        let cfg = BrokerConfig::load(Some(&path)).expect("load failed");
        assert_eq!(cfg.default_prefetch, 5);
        assert_eq!(cfg.max_queue_length, 100_000);
        assert_eq!(cfg.store.kind, StoreKind::Sled);
        assert_eq!(cfg.store.path, PathBuf::from("/var/lib/warren"));
    }

    #[test]
    fn load_config_missing_file_fails() {
        let tmp = TempDir::new().expect("create tempdir");
        let result = BrokerConfig::load(Some(&tmp.path().join("absent.toml")));
        assert!(matches!(result, Err(BrokerError::Config(_))));
    }

    #[test]
    fn load_config_rejects_unknown_store_kind() {
        let tmp = TempDir::new().expect("create tempdir");
        let path = tmp.path().join("warren.toml");
        fs::write(&path, "[store]\nkind = \"postgres\"\n").expect("write config file");
        assert!(BrokerConfig::load(Some(&path)).is_err());
    }
}
