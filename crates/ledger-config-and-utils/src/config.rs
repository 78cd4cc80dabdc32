//! Configuration management for the ledger.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable overriding `log_level`.
pub const ENV_LOG_LEVEL: &str = "FINANCE_APP_LOG_LEVEL";

/// Environment variable overriding `database_path`.
pub const ENV_DATABASE_PATH: &str = "FINANCE_APP_DATABASE_PATH";

/// Main ledger configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Database file. Defaults to `data/transactions.db` under the base directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Master key fallback when `FINANCE_APP_ENCRYPTION_KEY` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
    /// Minimum idle pooled connections.
    #[serde(default = "default_pool_min_idle")]
    pub pool_min_idle: u32,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_pool_max_size() -> u32 {
    10
}

fn default_pool_min_idle() -> u32 {
    2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database_path: None,
            encryption_key: None,
            pool_max_size: default_pool_max_size(),
            pool_min_idle: default_pool_min_idle(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("log_level", &self.log_level)
            .field("database_path", &self.database_path)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .field("pool_max_size", &self.pool_max_size)
            .field("pool_min_idle", &self.pool_min_idle)
            .finish()
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from a file, falling back to defaults.
    /// Environment overrides are applied last.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let config_path = paths.config_file();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Database file to open: the configured path, or the default under `paths`.
    pub fn database_file(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }

    fn validate(&self) -> CoreResult<()> {
        if self.pool_max_size == 0 {
            return Err(CoreError::Config("pool_max_size must be at least 1".to_string()));
        }
        if self.pool_min_idle > self.pool_max_size {
            return Err(CoreError::Config(format!(
                "pool_min_idle ({}) exceeds pool_max_size ({})",
                self.pool_min_idle, self.pool_max_size
            )));
        }
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var(ENV_LOG_LEVEL) {
            if !log_level.trim().is_empty() {
                self.log_level = log_level;
            }
        }
        if let Ok(path) = std::env::var(ENV_DATABASE_PATH) {
            if !path.trim().is_empty() {
                self.database_path = Some(PathBuf::from(path));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert!(config.database_path.is_none());
        assert!(config.encryption_key.is_none());
        assert_eq!(config.pool_max_size, 10);
        assert_eq!(config.pool_min_idle, 2);
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "encryption_key": "c2VjcmV0",
            "pool_max_size": 4
        }"#;

        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.encryption_key.as_deref(), Some("c2VjcmV0"));
        assert_eq!(config.pool_max_size, 4);
        assert_eq!(config.pool_min_idle, 2);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config {
            log_level: "trace".to_string(),
            pool_max_size: 3,
            pool_min_idle: 1,
            ..Default::default()
        };
        config.save(&paths).unwrap();

        let loaded = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded.log_level, "trace");
        assert_eq!(loaded.pool_max_size, 3);
        assert_eq!(loaded.pool_min_idle, 1);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert!(config.encryption_key.is_none());
        assert_eq!(config.pool_max_size, 10);
    }

    #[test]
    fn test_database_file_prefers_configured_path() {
        let paths = Paths::with_base_dir(PathBuf::from("/tmp/ledger"));
        let config = Config {
            database_path: Some(PathBuf::from("/srv/ledger.db")),
            ..Default::default()
        };
        assert_eq!(config.database_file(&paths), PathBuf::from("/srv/ledger.db"));
    }

    #[test]
    fn test_validate_rejects_bad_pool_sizes() {
        let config = Config {
            pool_max_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let config = Config {
            pool_max_size: 2,
            pool_min_idle: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_encryption_key() {
        let config = Config {
            encryption_key: Some("super-secret-key".to_string()),
            ..Default::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("super-secret-key"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_empty_file_uses_field_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, "{}").unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.pool_max_size, 10);
    }
}
