//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the database location.
pub const DATABASE_ENV: &str = "CHANNEL_HISTORY_DATABASE";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file holding the ledger and the directory tables.
    pub database_path: PathBuf,

    /// Background purge and reap settings.
    pub maintenance: MaintenanceConfig,
}

/// Background maintenance configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Seconds between maintenance passes.
    pub interval_secs: u64,

    /// Rows removed per retention batch.
    pub purge_batch_size: i64,

    /// Rows removed per orphan batch.
    pub orphan_batch_size: i64,

    /// Upper bound on batches per pass, per operation.
    pub max_batches: u32,

    /// Days of closed history kept for channels without a channel or team
    /// policy. `None` disables the global tier.
    pub global_retention_days: Option<u32>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            purge_batch_size: 1000,
            orphan_batch_size: 1000,
            max_batches: 100,
            global_retention_days: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: Self::default_instance_dir().join("history.db"),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Config {
    /// Directory holding the default config file and database.
    pub fn default_instance_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("channel-history"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    /// Load `config.toml` from the instance directory if present, otherwise
    /// defaults, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::default_instance_dir().join("config.toml");
        if path.exists() {
            return Self::load_from_path(&path);
        }

        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: std::sync::Arc::new(error),
        })?;

        let mut config = Self::from_toml(&raw).map_err(|error| match error {
            crate::Error::Config(ConfigError::Parse { message, .. }) => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            }
            .into(),
            other => other,
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without touching the environment.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).map_err(|error| ConfigError::Parse {
            path: "<inline>".into(),
            message: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var(DATABASE_ENV)
            && !path.trim().is_empty()
        {
            self.database_path = PathBuf::from(path);
        }
    }

    fn validate(&self) -> Result<()> {
        let maintenance = &self.maintenance;
        let problem = if maintenance.interval_secs == 0 {
            Some("maintenance.interval_secs must be positive")
        } else if maintenance.purge_batch_size <= 0 {
            Some("maintenance.purge_batch_size must be positive")
        } else if maintenance.orphan_batch_size <= 0 {
            Some("maintenance.orphan_batch_size must be positive")
        } else if maintenance.max_batches == 0 {
            Some("maintenance.max_batches must be positive")
        } else {
            None
        };

        match problem {
            Some(message) => Err(ConfigError::Invalid(message.into()).into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml("").expect("empty config should parse");
        assert_eq!(config.maintenance.purge_batch_size, 1000);
        assert_eq!(config.maintenance.global_retention_days, None);
        assert!(config.database_path.ends_with("history.db"));
    }

    #[test]
    fn parses_maintenance_section() {
        let config = Config::from_toml(
            r#"
            database_path = "/var/lib/history/history.db"

            [maintenance]
            interval_secs = 60
            purge_batch_size = 50
            global_retention_days = 365
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.database_path, PathBuf::from("/var/lib/history/history.db"));
        assert_eq!(config.maintenance.interval_secs, 60);
        assert_eq!(config.maintenance.purge_batch_size, 50);
        assert_eq!(config.maintenance.orphan_batch_size, 1000);
        assert_eq!(config.maintenance.global_retention_days, Some(365));
    }

    #[test]
    fn rejects_non_positive_batch_size() {
        let error = Config::from_toml("[maintenance]\npurge_batch_size = 0\n")
            .expect_err("zero batch size must be rejected");
        assert!(error.to_string().contains("purge_batch_size"));
    }

    #[test]
    fn reports_file_path_on_parse_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "maintenance = 3").expect("write config");

        let error = Config::load_from_path(&path).expect_err("malformed config must fail");
        assert!(error.to_string().contains("config.toml"), "{error}");
    }
}
