//! Database migrations.
//!
//! Schema migrations are run in order and tracked in the `migrations` table.
//! Databases created by earlier releases already contain the finance tables
//! but no `migrations` table; v1 uses `IF NOT EXISTS` throughout so it is a
//! no-op for them. Encrypting existing rows is the job of the backfill
//! routine, which runs after these migrations.

use crate::adapters::EncryptedColumn;
use crate::models::{
    ACCOUNT_BALANCE, ACCOUNT_NAME, BALANCE_HISTORY_BALANCE, BALANCE_OVERRIDE_BALANCE,
    BUDGET_ALLOCATED_AMOUNT, BUDGET_CATEGORY, INCOME_OVERRIDE_AMOUNT, TRANSACTION_ACCOUNT,
    TRANSACTION_AMOUNT, TRANSACTION_CATEGORY, TRANSACTION_DESCRIPTION, TRANSACTION_SOURCE_FILE,
};
use crate::DatabaseResult;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    // Create migrations tracking table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version = current_version(conn)?;

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_finance_schema(conn)?;
    }
    if current_version < 2 {
        migrate_v2_encryption_state(conn)?;
    }
    if current_version < 3 {
        migrate_v3_encryption_skipped_rows(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

/// Highest applied migration version, 0 for a fresh or legacy database.
pub fn current_version(conn: &Connection) -> DatabaseResult<i32> {
    let version: Option<i32> = conn
        .query_row(
            "SELECT MAX(version) FROM migrations",
            [],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: Finance tables - accounts, transactions, budgets, balances, income overrides.
///
/// Encrypted columns are declared with their envelope width.
fn migrate_v1_finance_schema(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: finance schema");

    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name VARCHAR({name}) NOT NULL,
            type VARCHAR(10) NOT NULL,
            balance VARCHAR({balance}) NOT NULL,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        );

        CREATE INDEX IF NOT EXISTS ix_accounts_type ON accounts(type);
        ",
        name = ACCOUNT_NAME.storage_length(),
        balance = ACCOUNT_BALANCE.storage_length(),
    ))?;

    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date DATETIME NOT NULL,
            description VARCHAR({description}) NOT NULL,
            amount VARCHAR({amount}) NOT NULL,
            category VARCHAR({category}),
            account VARCHAR({account}),
            account_id INTEGER REFERENCES accounts(id),
            source_file VARCHAR({source_file}) NOT NULL,
            import_timestamp DATETIME NOT NULL,
            duplicate_hash VARCHAR(32) NOT NULL UNIQUE,
            is_transfer INTEGER NOT NULL DEFAULT 0,
            transfer_to_account_id INTEGER REFERENCES accounts(id)
        );

        CREATE INDEX IF NOT EXISTS ix_transactions_date ON transactions(date);
        CREATE INDEX IF NOT EXISTS ix_transactions_account_id ON transactions(account_id);
        ",
        description = TRANSACTION_DESCRIPTION.storage_length(),
        amount = TRANSACTION_AMOUNT.storage_length(),
        category = TRANSACTION_CATEGORY.storage_length(),
        account = TRANSACTION_ACCOUNT.storage_length(),
        source_file = TRANSACTION_SOURCE_FILE.storage_length(),
    ))?;

    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS budgets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category VARCHAR({category}) NOT NULL,
            allocated_amount VARCHAR({amount}) NOT NULL,
            period_start DATETIME NOT NULL,
            period_end DATETIME NOT NULL,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        );
        ",
        category = BUDGET_CATEGORY.storage_length(),
        amount = BUDGET_ALLOCATED_AMOUNT.storage_length(),
    ))?;

    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS balance_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            balance VARCHAR({history}) NOT NULL,
            timestamp DATETIME NOT NULL,
            notes VARCHAR(255)
        );

        CREATE INDEX IF NOT EXISTS ix_balance_history_account_id ON balance_history(account_id);
        CREATE INDEX IF NOT EXISTS ix_balance_history_timestamp ON balance_history(timestamp);

        CREATE TABLE IF NOT EXISTS balance_overrides (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            override_date DATE NOT NULL,
            override_balance VARCHAR({override_balance}) NOT NULL,
            created_at DATETIME NOT NULL,
            notes VARCHAR(255)
        );

        CREATE INDEX IF NOT EXISTS ix_balance_overrides_account_id ON balance_overrides(account_id);
        CREATE INDEX IF NOT EXISTS ix_balance_overrides_override_date ON balance_overrides(override_date);

        CREATE TABLE IF NOT EXISTS income_overrides (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            month DATE NOT NULL UNIQUE,
            override_amount VARCHAR({income}) NOT NULL,
            created_at DATETIME NOT NULL
        );
        ",
        history = BALANCE_HISTORY_BALANCE.storage_length(),
        override_balance = BALANCE_OVERRIDE_BALANCE.storage_length(),
        income = INCOME_OVERRIDE_AMOUNT.storage_length(),
    ))?;

    record_migration(conn, 1, "finance_schema")?;
    Ok(())
}

/// V2: Encryption rollout state.
///
/// A single row tracks how far the encryption backfill has progressed.
fn migrate_v2_encryption_state(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: encryption state");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS encryption_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            phase TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        INSERT OR IGNORE INTO encryption_state (id, phase) VALUES (1, 'not_migrated');
        ",
    )?;

    record_migration(conn, 2, "encryption_state")?;
    Ok(())
}

/// V3: Rows the encryption backfill could not process.
///
/// Lets a later open tell "only known-bad rows remain" apart from new work.
fn migrate_v3_encryption_skipped_rows(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v3: encryption skipped rows");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS encryption_skipped_rows (
            table_name TEXT NOT NULL,
            column_name TEXT NOT NULL,
            row_id INTEGER NOT NULL,
            reason TEXT NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (table_name, column_name, row_id)
        );
        ",
    )?;

    record_migration(conn, 3, "encryption_skipped_rows")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_migrations_run_successfully() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = table_names(&conn);
        for expected in [
            "accounts",
            "balance_history",
            "balance_overrides",
            "budgets",
            "encryption_skipped_rows",
            "encryption_state",
            "income_overrides",
            "migrations",
            "transactions",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {}", expected);
        }
        assert_eq!(current_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, CURRENT_VERSION);
    }

    #[test]
    fn test_encryption_state_starts_not_migrated() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let phase: String = conn
            .query_row("SELECT phase FROM encryption_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(phase, "not_migrated");
    }

    #[test]
    fn test_legacy_tables_are_kept() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name VARCHAR(100) NOT NULL UNIQUE,
                type VARCHAR(10) NOT NULL,
                balance FLOAT NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );
            INSERT INTO accounts (name, type, balance, created_at, updated_at)
                VALUES ('Legacy Checking', 'BANK', 10.5, '2024-01-01 00:00:00', '2024-01-01 00:00:00');
            ",
        )
        .unwrap();

        run_migrations(&conn).unwrap();

        let name: String = conn
            .query_row("SELECT name FROM accounts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "Legacy Checking");
        assert_eq!(current_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_encrypted_columns_declared_with_envelope_width() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let sql: String = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type='table' AND name='accounts'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(sql.contains(&format!("VARCHAR({})", ACCOUNT_NAME.storage_length())));
    }
}
