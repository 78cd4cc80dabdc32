//! SQLite storage layer for the finance ledger.
//!
//! This crate provides:
//! - Async SQLite executor with dedicated thread
//! - Connection pool with WAL mode
//! - Database migrations and the encryption backfill
//! - Model types for all tables
//! - Column adapters that encrypt sensitive fields on write and decrypt on read
//! - SQL functions (`decrypt_text`, `decrypt_numeric`) registered on every connection
//! - Query helpers for CRUD operations
//!
//! # Architecture
//!
//! Every way of opening a connection ([`Database`], [`DatabasePool`],
//! [`AsyncDatabase`]) takes a shared [`ledger_crypto::EncryptionManager`],
//! registers the SQL functions on the connection, and brings the schema and
//! stored data up to date before returning.
//!
//! ```ignore
//! let manager = Arc::new(EncryptionManager::from_env_or_config(config.encryption_key.as_deref())?);
//! let db = AsyncDatabase::open(&path, Arc::clone(&manager)).await?;
//! let accounts = db.call(move |conn| queries::list_accounts(conn, &manager)).await?;
//! ```

pub mod adapters;
pub mod backfill;
mod db;
mod error;
mod executor;
mod migrations;
mod models;
mod payload;
mod pool;
pub mod queries;
pub mod sql_functions;

#[cfg(test)]
mod tests;

pub use adapters::{EncryptedColumn, EncryptedNumeric, EncryptedString};
pub use backfill::{
    encryption_status, prepare_database, run_encryption_backfill, BackfillOptions, BackfillReport,
    EncryptionPhase, EncryptionStatus,
};
pub use db::Database;
pub use error::{DatabaseError, DatabaseResult, UNREADABLE_RECORD_MESSAGE};
pub use executor::AsyncDatabase;
pub use migrations::{current_version, run_migrations, CURRENT_VERSION};
pub use models::*;
pub use payload::{
    decrypt_transaction_row, encrypt_transaction_payload, TransactionPayload,
    SENSITIVE_TRANSACTION_FIELDS,
};
pub use pool::{DatabasePool, PoolConfig, PoolState};
pub use sql_functions::{register_sql_functions, require_decrypted};
