//! Async SQLite executor using a dedicated background thread.
//!
//! This module provides an async-friendly interface to SQLite that:
//! - Uses a single dedicated thread for all SQLite operations
//! - Sends queries through a channel (non-blocking from caller's perspective)
//! - Keeps the Tokio runtime free for other async work
//!
//! The connection has the encryption SQL functions registered before any
//! caller sees it, so `decrypt_text(...)` and `decrypt_numeric(...)` work in
//! every query sent through [`AsyncDatabase::call`].
//!
//! # Example
//!
//! ```ignore
//! let db = AsyncDatabase::open(path, manager).await?;
//!
//! let manager = Arc::clone(db.manager());
//! let accounts = db.call(move |conn| queries::list_accounts(conn, &manager)).await?;
//! ```
//!
//! Row decryption happens during row mapping, on the DB thread. Keep the
//! closures to queries and mapping; anything else belongs outside `call()`.

use crate::backfill::{self, BackfillOptions};
use crate::db::{configure_connection, FILE_PRAGMAS};
use crate::{DatabaseError, DatabaseResult};
use ledger_crypto::EncryptionManager;
use std::path::Path;
use std::sync::Arc;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

/// Convert a tokio_rusqlite::Error to DatabaseError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::from(e),
        tokio_rusqlite::Error::Close(_) => DatabaseError::Connection("Connection closed".to_string()),
        other => DatabaseError::Connection(other.to_string()),
    }
}

/// Async SQLite database with a dedicated executor thread.
///
/// All operations are sent to a single background thread via channel.
/// This avoids blocking the Tokio runtime and provides predictable
/// query ordering (FIFO).
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    manager: Arc<EncryptionManager>,
    path: String,
}

impl AsyncDatabase {
    /// Open a database at the given path.
    ///
    /// This will:
    /// - Create the database file if it doesn't exist
    /// - Enable WAL mode and register the encryption SQL functions
    /// - Run pending migrations and the encryption backfill
    /// - Start the dedicated executor thread
    pub async fn open(path: &Path, manager: Arc<EncryptionManager>) -> DatabaseResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();

        info!(path = %path_str, "Opening async database");

        // Open connection - this spawns the dedicated background thread
        let conn = Connection::open(&path_str)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let init_manager = Arc::clone(&manager);
        conn.call(move |conn| {
            configure_connection(conn, FILE_PRAGMAS, init_manager)?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        let db = Self {
            conn,
            manager,
            path: path_str,
        };

        let prepare_manager = Arc::clone(&db.manager);
        let report = db
            .call(move |conn| {
                backfill::prepare_database(conn, &prepare_manager, BackfillOptions::default())
            })
            .await?;

        info!(
            path = %db.path,
            phase = report.phase_after.as_str(),
            "Async database initialized with WAL mode"
        );

        Ok(db)
    }

    /// Execute a closure on the database connection.
    ///
    /// The closure runs on the dedicated SQLite thread. The caller's async
    /// task is parked (not blocked) until the result is ready.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // The closure's own DatabaseResult rides inside tokio_rusqlite's Ok
        let outer_result = self.conn.call(move |conn| Ok(f(conn))).await;

        match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Execute a closure that returns a rusqlite::Result.
    ///
    /// Convenience method for simple queries that only produce rusqlite errors.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    /// The encryption manager registered on the connection.
    pub fn manager(&self) -> &Arc<EncryptionManager> {
        &self.manager
    }

    /// Get the database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if the database is healthy by executing a simple query.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call_sqlite(|conn| conn.execute_batch("SELECT 1")).await?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Close the database connection.
    ///
    /// This will wait for any pending operations to complete,
    /// then shut down the executor thread.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to close database: {:?}", e)))?;
        info!(path = %self.path, "Database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{queries, AccountType, NewAccount};
    use ledger_crypto::MasterKey;
    use tempfile::tempdir;

    fn manager() -> Arc<EncryptionManager> {
        Arc::new(EncryptionManager::new(&MasterKey::generate()).unwrap())
    }

    #[tokio::test]
    async fn test_async_database_open() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        let db = AsyncDatabase::open(&db_path, manager()).await.unwrap();
        assert!(db.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_async_account_round_trip() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test_query.db");

        let db = AsyncDatabase::open(&db_path, manager()).await.unwrap();

        let manager = Arc::clone(db.manager());
        db.call(move |conn| {
            queries::insert_account(
                conn,
                &manager,
                &NewAccount {
                    name: "Ally Savings".to_string(),
                    account_type: AccountType::Savings,
                    balance: 2500.75,
                },
            )
        })
        .await
        .unwrap();

        let manager = Arc::clone(db.manager());
        let account = db
            .call(move |conn| queries::get_account_by_name(conn, &manager, "ally savings"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.name, "Ally Savings");
        assert_eq!(account.balance, 2500.75);

        // Raw SQL through the bridge sees the same value
        let raw_balance: f64 = db
            .call_sqlite(move |conn| {
                conn.query_row(
                    "SELECT decrypt_numeric(balance) FROM accounts WHERE id = ?1",
                    [account.id],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(raw_balance, 2500.75);
    }

    #[tokio::test]
    async fn test_concurrent_inserts() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test_concurrent.db");

        let db = AsyncDatabase::open(&db_path, manager()).await.unwrap();

        let mut handles = vec![];
        for i in 0..10 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let manager = Arc::clone(db.manager());
                db.call(move |conn| {
                    queries::insert_account(
                        conn,
                        &manager,
                        &NewAccount {
                            name: format!("Card {}", i),
                            account_type: AccountType::Credit,
                            balance: -(i as f64),
                        },
                    )
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let manager = Arc::clone(db.manager());
        let accounts = db
            .call(move |conn| queries::list_accounts(conn, &manager))
            .await
            .unwrap();
        assert_eq!(accounts.len(), 10);
    }

    #[tokio::test]
    async fn test_reopen_is_noop() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test_reopen.db");
        let manager = manager();

        let db = AsyncDatabase::open(&db_path, Arc::clone(&manager)).await.unwrap();
        db.close().await.unwrap();

        let db = AsyncDatabase::open(&db_path, manager).await.unwrap();
        let status = db
            .call(|conn| backfill::encryption_status(conn))
            .await
            .unwrap();
        assert!(status.is_fully_encrypted());
    }
}
