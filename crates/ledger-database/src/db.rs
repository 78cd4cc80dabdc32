//! Database connection and query operations.

use crate::backfill::{self, BackfillOptions, BackfillReport, EncryptionStatus};
use crate::sql_functions::register_sql_functions;
use crate::{
    queries, Account, Budget, DatabaseResult, NewAccount, NewBudget, NewTransaction, Transaction,
};
use chrono::{DateTime, Utc};
use ledger_crypto::EncryptionManager;
use rusqlite::Connection;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Pragmas applied to every file-backed connection.
pub(crate) const FILE_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA cache_size = -64000;
    PRAGMA temp_store = MEMORY;
    PRAGMA mmap_size = 268435456;
    PRAGMA busy_timeout = 5000;
";

/// Pragmas for in-memory connections (WAL does not apply).
const MEMORY_PRAGMAS: &str = "
    PRAGMA foreign_keys = ON;
    PRAGMA cache_size = -64000;
    PRAGMA temp_store = MEMORY;
";

/// Apply pragmas and register the encryption SQL functions.
///
/// Every connection-opening path goes through here.
pub(crate) fn configure_connection(
    conn: &Connection,
    pragmas: &str,
    manager: Arc<EncryptionManager>,
) -> rusqlite::Result<()> {
    conn.execute_batch(pragmas)?;
    register_sql_functions(conn, manager)
}

/// Database wrapper with query methods.
pub struct Database {
    conn: Connection,
    manager: Arc<EncryptionManager>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.conn.path())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open a database at the given path, running migrations and the
    /// encryption backfill if needed.
    pub fn open(path: &Path, manager: Arc<EncryptionManager>) -> DatabaseResult<Self> {
        let db = Self::open_for_maintenance(path, manager)?;
        let report = db.prepare(BackfillOptions::default())?;
        if !report.is_noop() {
            info!(
                path = %path.display(),
                tokens_backfilled = report.tokens_backfilled,
                values_encrypted = report.values_encrypted(),
                timestamps_normalized = report.timestamps_normalized,
                skipped = report.skipped.len(),
                "Database encryption upgraded"
            );
        }
        Ok(db)
    }

    /// Open a database without migrating it.
    ///
    /// Used by maintenance commands that inspect or dry-run the upgrade.
    pub fn open_for_maintenance(path: &Path, manager: Arc<EncryptionManager>) -> DatabaseResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        configure_connection(&conn, FILE_PRAGMAS, Arc::clone(&manager))?;
        debug!(path = %path.display(), "Database connection opened");

        Ok(Self { conn, manager })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory(manager: Arc<EncryptionManager>) -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn, MEMORY_PRAGMAS, Arc::clone(&manager))?;
        let db = Self { conn, manager };
        db.prepare(BackfillOptions::default())?;
        Ok(db)
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get the shared encryption manager.
    pub fn manager(&self) -> &Arc<EncryptionManager> {
        &self.manager
    }

    /// Run schema migrations and the encryption backfill.
    pub fn prepare(&self, options: BackfillOptions) -> DatabaseResult<BackfillReport> {
        backfill::prepare_database(&self.conn, &self.manager, options)
    }

    /// Report encryption progress without changing anything.
    pub fn encryption_status(&self) -> DatabaseResult<EncryptionStatus> {
        backfill::encryption_status(&self.conn)
    }

    // ==========================================
    // Accounts
    // ==========================================

    pub fn insert_account(&self, account: &NewAccount) -> DatabaseResult<Account> {
        queries::insert_account(&self.conn, &self.manager, account)
    }

    pub fn get_account(&self, id: i64) -> DatabaseResult<Option<Account>> {
        queries::get_account(&self.conn, &self.manager, id)
    }

    pub fn get_account_by_name(&self, name: &str) -> DatabaseResult<Option<Account>> {
        queries::get_account_by_name(&self.conn, &self.manager, name)
    }

    pub fn list_accounts(&self) -> DatabaseResult<Vec<Account>> {
        queries::list_accounts(&self.conn, &self.manager)
    }

    pub fn rename_account(&self, id: i64, new_name: &str) -> DatabaseResult<bool> {
        queries::rename_account(&self.conn, &self.manager, id, new_name)
    }

    pub fn update_account_balance(
        &self,
        id: i64,
        balance: f64,
        notes: Option<&str>,
    ) -> DatabaseResult<bool> {
        queries::update_account_balance(&self.conn, &self.manager, id, balance, notes)
    }

    pub fn delete_account(&self, id: i64) -> DatabaseResult<bool> {
        queries::delete_account(&self.conn, id)
    }

    // ==========================================
    // Transactions
    // ==========================================

    pub fn insert_transaction(&self, tx: &NewTransaction) -> DatabaseResult<Transaction> {
        queries::insert_transaction(&self.conn, &self.manager, tx)
    }

    pub fn get_transaction(&self, id: i64) -> DatabaseResult<Option<Transaction>> {
        queries::get_transaction(&self.conn, &self.manager, id)
    }

    pub fn list_transactions(&self, limit: i64) -> DatabaseResult<Vec<Transaction>> {
        queries::list_transactions(&self.conn, &self.manager, limit)
    }

    pub fn search_transactions(&self, term: &str) -> DatabaseResult<Vec<Transaction>> {
        queries::search_transactions(&self.conn, &self.manager, term)
    }

    pub fn list_transactions_by_amount(
        &self,
        descending: bool,
        limit: i64,
    ) -> DatabaseResult<Vec<Transaction>> {
        queries::list_transactions_by_amount(&self.conn, &self.manager, descending, limit)
    }

    // ==========================================
    // Budgets
    // ==========================================

    pub fn insert_budget(&self, budget: &NewBudget) -> DatabaseResult<Budget> {
        queries::insert_budget(&self.conn, &self.manager, budget)
    }

    pub fn list_active_budgets(&self, at: DateTime<Utc>) -> DatabaseResult<Vec<Budget>> {
        queries::list_active_budgets(&self.conn, &self.manager, at)
    }
}
