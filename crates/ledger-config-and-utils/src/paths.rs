//! File system paths for the ledger.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Directory name under the home directory.
const BASE_DIR_NAME: &str = ".finance-ledger";
/// Database filename under the data directory.
const DATABASE_FILE_NAME: &str = "transactions.db";
/// Structured log filename under the logs directory.
const LOG_FILE_NAME: &str = "ledger.jsonl";

/// Manages file system paths for the ledger.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory (~/.finance-ledger)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.finance-ledger`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(BASE_DIR_NAME),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.finance-ledger).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.finance-ledger/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the data directory (~/.finance-ledger/data).
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    /// Get the database file path (~/.finance-ledger/data/transactions.db).
    pub fn database_file(&self) -> PathBuf {
        self.data_dir().join(DATABASE_FILE_NAME)
    }

    /// Get the logs directory (~/.finance-ledger/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Get the structured log file path (~/.finance-ledger/logs/ledger.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join(LOG_FILE_NAME)
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_with_base_dir() {
        let base = PathBuf::from("/tmp/test-ledger");
        let paths = Paths::with_base_dir(base.clone());

        assert_eq!(paths.base_dir(), &base);
        assert_eq!(paths.config_file(), base.join("config.json"));
        assert_eq!(paths.data_dir(), base.join("data"));
        assert_eq!(paths.database_file(), base.join("data/transactions.db"));
        assert_eq!(paths.logs_dir(), base.join("logs"));
        assert_eq!(paths.log_file(), base.join("logs/ledger.jsonl"));
    }

    #[test]
    fn test_paths_default() {
        let paths = Paths::new().unwrap();
        let home = dirs::home_dir().unwrap();

        assert_eq!(paths.base_dir(), &home.join(".finance-ledger"));
    }

    #[test]
    fn test_ensure_dirs_creates_directories() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("ledger");
        let paths = Paths::with_base_dir(base.clone());

        assert!(!base.exists());

        paths.ensure_dirs().unwrap();
        paths.ensure_dirs().unwrap();

        assert!(base.is_dir());
        assert!(paths.data_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
    }

    #[test]
    fn test_files_live_under_their_dirs() {
        let paths = Paths::with_base_dir(PathBuf::from("/test/nested"));

        assert!(paths.database_file().starts_with(paths.data_dir()));
        assert!(paths.log_file().starts_with(paths.logs_dir()));
    }
}
