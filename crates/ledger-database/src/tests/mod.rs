//! End-to-end tests across the storage layer: open paths, legacy upgrades,
//! and agreement between typed reads and the SQL functions.

use crate::backfill::NAME_INDEX;
use crate::{
    migrations, queries, AccountType, BackfillOptions, Database, DatabaseError, DatabasePool,
    EncryptionPhase, NewAccount, NewTransaction, PoolConfig,
};
use chrono::{TimeZone, Utc};
use ledger_crypto::{is_ciphertext, EncryptionManager, MasterKey};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn manager() -> Arc<EncryptionManager> {
    Arc::new(EncryptionManager::new(&MasterKey::generate()).unwrap())
}

fn account(name: &str, balance: f64) -> NewAccount {
    NewAccount {
        name: name.to_string(),
        account_type: AccountType::Bank,
        balance,
    }
}

fn transaction(description: &str, amount: f64, hash: &str) -> NewTransaction {
    NewTransaction {
        date: Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap(),
        description: description.to_string(),
        amount,
        category: Some("Groceries".to_string()),
        account: Some("Chase Checking".to_string()),
        account_id: None,
        source_file: "march.csv".to_string(),
        duplicate_hash: hash.to_string(),
        is_transfer: false,
        transfer_to_account_id: None,
    }
}

/// Build a database the way older releases left it: schema present, every
/// sensitive value stored in plaintext, no name tokens.
fn create_legacy_db(path: &Path) {
    let conn = Connection::open(path).unwrap();
    migrations::run_migrations(&conn).unwrap();

    let now = "2023-11-02 09:30:00";
    for (name, balance) in [("Chase Checking", "1500.00"), ("Amex Gold", "-320.5")] {
        conn.execute(
            "INSERT INTO accounts (name, type, balance, created_at, updated_at)
             VALUES (?1, 'bank', ?2, ?3, ?3)",
            params![name, balance, now],
        )
        .unwrap();
    }
    conn.execute(
        "INSERT INTO transactions (date, description, amount, category, account, account_id,
                                   source_file, import_timestamp, duplicate_hash, is_transfer)
         VALUES (?1, 'Whole Foods Market', -82.17, 'Groceries', 'Chase Checking', 1,
                 'nov.csv', ?1, 'hash-legacy-1', 0)",
        params![now],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO budgets (category, allocated_amount, period_start, period_end, created_at, updated_at)
         VALUES ('Groceries', 600, ?1, ?1, ?1, ?1)",
        params![now],
    )
    .unwrap();
}

fn raw_text(conn: &Connection, sql: &str) -> String {
    conn.query_row(sql, [], |row| row.get(0)).unwrap()
}

#[test]
fn test_account_stored_encrypted_and_readable_by_name() {
    let db = Database::open_in_memory(manager()).unwrap();
    let created = db.insert_account(&account("Chase Checking", 1500.00)).unwrap();

    let conn = db.connection();
    let stored_name = raw_text(conn, "SELECT name FROM accounts");
    let stored_balance = raw_text(conn, "SELECT balance FROM accounts");
    assert!(is_ciphertext(&stored_name));
    assert!(is_ciphertext(&stored_balance));
    assert!(!stored_name.contains("Chase"));

    let found = db.get_account_by_name("chase checking").unwrap().unwrap();
    assert_eq!(found.id, created.id);
    assert_eq!(found.name, "Chase Checking");
    assert_eq!(found.balance, 1500.00);

    let token = db
        .manager()
        .derive_search_token("  CHASE checking ")
        .unwrap()
        .into_string();
    let via_sql: String = conn
        .query_row(
            "SELECT decrypt_text(name) FROM accounts WHERE name_index = ?1",
            params![token],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(via_sql, "Chase Checking");
}

#[test]
fn test_typed_and_sql_reads_agree() {
    let db = Database::open_in_memory(manager()).unwrap();
    let amounts = [-82.17, 2500.0, -0.01, 19.99];
    for (i, amount) in amounts.iter().enumerate() {
        db.insert_transaction(&transaction(&format!("Purchase {}", i), *amount, &format!("h{}", i)))
            .unwrap();
    }

    let typed = db.list_transactions(100).unwrap();
    let conn = db.connection();
    let mut stmt = conn
        .prepare("SELECT id, decrypt_text(description), decrypt_numeric(amount) FROM transactions")
        .unwrap();
    let via_sql: Vec<(i64, String, f64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(typed.len(), via_sql.len());
    for (id, description, amount) in via_sql {
        let tx = typed.iter().find(|t| t.id == id).unwrap();
        assert_eq!(tx.description, description);
        assert_eq!(tx.amount, amount);
    }

    let ascending = db.list_transactions_by_amount(false, 10).unwrap();
    let sorted: Vec<f64> = ascending.iter().map(|t| t.amount).collect();
    assert_eq!(sorted, vec![-82.17, -0.01, 19.99, 2500.0]);
}

#[test]
fn test_legacy_database_upgraded_on_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("legacy.db");
    create_legacy_db(&path);

    let db = Database::open(&path, manager()).unwrap();
    let status = db.encryption_status().unwrap();
    assert_eq!(status.phase, EncryptionPhase::Migrated);
    assert!(status.is_fully_encrypted(), "status: {:?}", status);

    let conn = db.connection();
    assert!(is_ciphertext(&raw_text(conn, "SELECT description FROM transactions")));
    assert!(is_ciphertext(&raw_text(conn, "SELECT allocated_amount FROM budgets")));
    let index_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            params![NAME_INDEX],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(index_count, 1);

    let amex = db.get_account_by_name("AMEX GOLD").unwrap().unwrap();
    assert_eq!(amex.balance, -320.5);
    let txs = db.search_transactions("whole foods").unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].amount, -82.17);
    assert_eq!(txs[0].account.as_deref(), Some("Chase Checking"));
}

#[test]
fn test_upgrade_is_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idempotent.db");
    create_legacy_db(&path);
    let manager = manager();

    let snapshot = |db: &Database| -> Vec<(i64, String, String, String)> {
        let mut stmt = db
            .connection()
            .prepare("SELECT id, name, balance, name_index FROM accounts ORDER BY id")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        rows
    };

    let first = {
        let db = Database::open(&path, Arc::clone(&manager)).unwrap();
        snapshot(&db)
    };

    let db = Database::open(&path, manager).unwrap();
    let report = db.prepare(BackfillOptions::default()).unwrap();
    assert!(report.is_noop());
    assert_eq!(snapshot(&db), first);
}

#[test]
fn test_dry_run_leaves_legacy_database_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dry_run.db");
    create_legacy_db(&path);

    let db = Database::open_for_maintenance(&path, manager()).unwrap();
    let report = db.prepare(BackfillOptions { dry_run: true }).unwrap();
    assert!(report.dry_run);
    assert!(report.added_name_index);
    assert_eq!(report.tokens_backfilled, 2);
    assert!(report.values_encrypted() > 0);

    let status = db.encryption_status().unwrap();
    assert_eq!(status.phase, EncryptionPhase::NotMigrated);
    assert!(!status.name_index_present);
    assert_eq!(
        raw_text(db.connection(), "SELECT name FROM accounts WHERE id = 1"),
        "Chase Checking"
    );
}

#[test]
fn test_duplicate_legacy_names_abort_backfill() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("duplicates.db");
    create_legacy_db(&path);
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO accounts (name, type, balance, created_at, updated_at)
             VALUES ('chase checking ', 'bank', '0', '2023-11-02 09:30:00', '2023-11-02 09:30:00')",
            [],
        )
        .unwrap();
    }

    let manager = manager();
    let err = Database::open(&path, Arc::clone(&manager)).unwrap_err();
    match err {
        DatabaseError::DuplicateAccountNames { groups } => assert_eq!(groups, vec![vec![1, 3]]),
        other => panic!("unexpected error: {:?}", other),
    }

    // Row changes rolled back; the phase records where the run stopped
    let db = Database::open_for_maintenance(&path, manager).unwrap();
    let status = db.encryption_status().unwrap();
    assert_eq!(status.phase, EncryptionPhase::RowBackfillInProgress);
    assert_eq!(status.accounts_missing_tokens, 3);
    assert_eq!(
        raw_text(db.connection(), "SELECT name FROM accounts WHERE id = 2"),
        "Amex Gold"
    );
}

#[test]
fn test_corrupted_name_is_skipped_and_rest_upgraded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupted.db");
    create_legacy_db(&path);
    let manager = manager();

    let mut corrupted = manager.encrypt_text("Old Brokerage").unwrap();
    let mid = corrupted.len() / 2;
    let replacement = if &corrupted[mid..mid + 1] == "A" { "B" } else { "A" };
    corrupted.replace_range(mid..mid + 1, replacement);
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO accounts (name, type, balance, created_at, updated_at)
             VALUES (?1, 'investment', '10', '2023-11-02 09:30:00', '2023-11-02 09:30:00')",
            params![corrupted],
        )
        .unwrap();
    }

    let db = Database::open_for_maintenance(&path, Arc::clone(&manager)).unwrap();
    let report = db.prepare(BackfillOptions::default()).unwrap();
    assert_eq!(report.phase_after, EncryptionPhase::Migrated);
    assert_eq!(report.tokens_backfilled, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].row_id, 3);

    assert!(db.get_account_by_name("chase checking").unwrap().is_some());
    let err = db.get_account(3).unwrap_err();
    assert!(err.is_decryption());

    // Raw SQL keeps going and yields NULL for the unreadable row
    let names: Vec<Option<String>> = {
        let mut stmt = db
            .connection()
            .prepare("SELECT decrypt_text(name) FROM accounts ORDER BY id")
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        rows
    };
    assert_eq!(
        names,
        vec![Some("Chase Checking".to_string()), Some("Amex Gold".to_string()), None]
    );

    assert_eq!(db.encryption_status().unwrap().accounts_missing_tokens, 1);
}

#[test]
fn test_pool_and_single_connection_share_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let manager = manager();

    let pool = DatabasePool::open(&path, PoolConfig::default(), Arc::clone(&manager)).unwrap();
    {
        let conn = pool.get().unwrap();
        let created = queries::insert_account(&conn, &manager, &account("Chase Checking", 1500.0))
            .unwrap();
        queries::insert_transaction(
            &conn,
            &manager,
            &NewTransaction {
                account_id: Some(created.id),
                ..transaction("Payroll", 3200.0, "h-payroll")
            },
        )
        .unwrap();
        queries::insert_transaction(
            &conn,
            &manager,
            &NewTransaction {
                account_id: Some(created.id),
                ..transaction("Rent", -1800.0, "h-rent")
            },
        )
        .unwrap();
        assert_eq!(queries::sum_transaction_amounts(&conn, created.id).unwrap(), 1400.0);
    }

    let db = Database::open(&path, manager).unwrap();
    let found = db.get_account_by_name("Chase Checking").unwrap().unwrap();
    assert_eq!(found.balance, 1500.0);
    assert_eq!(db.list_transactions(10).unwrap().len(), 2);
}

#[test]
fn test_wrong_key_cannot_read_but_sql_does_not_fail() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wrong_key.db");
    {
        let db = Database::open(&path, manager()).unwrap();
        db.insert_account(&account("Chase Checking", 1500.0)).unwrap();
    }

    let db = Database::open(&path, manager()).unwrap();
    let err = db.list_accounts().unwrap_err();
    assert!(err.is_decryption());
    assert_eq!(err.user_message(), crate::UNREADABLE_RECORD_MESSAGE);

    let name: Option<String> = db
        .connection()
        .query_row("SELECT decrypt_text(name) FROM accounts", [], |row| row.get(0))
        .unwrap();
    assert!(name.is_none());
}

#[test]
fn test_plaintext_written_after_migration_is_encrypted_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("late_plaintext.db");
    let manager = manager();
    {
        let db = Database::open(&path, Arc::clone(&manager)).unwrap();
        db.insert_account(&account("Chase Checking", 1500.0)).unwrap();
        // An older writer that bypasses the adapters
        db.connection()
            .execute(
                "INSERT INTO transactions (date, description, amount, source_file, import_timestamp,
                                           duplicate_hash, is_transfer)
                 VALUES ('2024-03-15T00:00:00+00:00', 'Trader Joes', '-45.10', 'late.csv',
                         '2024-03-15T00:00:00+00:00', 'hash-late', 0)",
                [],
            )
            .unwrap();
    }

    let db = Database::open(&path, manager).unwrap();
    let conn = db.connection();
    assert!(is_ciphertext(&raw_text(conn, "SELECT description FROM transactions")));
    assert!(is_ciphertext(&raw_text(conn, "SELECT amount FROM transactions")));
    assert!(db.encryption_status().unwrap().is_fully_encrypted());

    let found = db.search_transactions("trader").unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].amount, -45.10);
}

#[test]
fn test_known_skips_do_not_rerun_backfill() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("known_skips.db");
    create_legacy_db(&path);
    let manager = manager();
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO accounts (name, type, balance, created_at, updated_at)
             VALUES (X'00FF', 'other', '0', '2023-11-02 09:30:00', '2023-11-02 09:30:00')",
            [],
        )
        .unwrap();
    }

    let db = Database::open_for_maintenance(&path, Arc::clone(&manager)).unwrap();
    let first = db.prepare(BackfillOptions::default()).unwrap();
    assert!(!first.skipped.is_empty());
    assert!(first.skipped.iter().all(|s| s.row_id == 3));
    assert_eq!(db.encryption_status().unwrap().skipped_rows, first.skipped.len());

    let second = db.prepare(BackfillOptions::default()).unwrap();
    assert!(second.is_noop());
    assert!(second.skipped.is_empty());
    assert_eq!(second.previously_skipped, first.skipped.len());

    // New plaintext is not covered by the recorded skips
    db.connection()
        .execute("UPDATE accounts SET balance = '99' WHERE id = 1", [])
        .unwrap();
    let third = db.prepare(BackfillOptions::default()).unwrap();
    assert_eq!(third.values_encrypted(), 1);
    assert_eq!(third.skipped.len(), first.skipped.len());
    assert_eq!(db.get_account(1).unwrap().unwrap().balance, 99.0);
}

#[test]
fn test_legacy_timestamps_normalized_to_utc() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("timestamps.db");
    create_legacy_db(&path);
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO transactions (date, description, amount, source_file, import_timestamp,
                                       duplicate_hash, is_transfer)
             VALUES ('last tuesday', 'Mystery', -1, 'bad.csv', '2023-11-05', 'hash-bad-date', 0)",
            [],
        )
        .unwrap();
    }

    let db = Database::open_for_maintenance(&path, manager()).unwrap();
    let report = db.prepare(BackfillOptions::default()).unwrap();
    assert_eq!(report.timestamps_normalized, 3);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].table, "transactions");
    assert_eq!(report.skipped[0].column, "date");
    assert_eq!(report.skipped[0].row_id, 2);

    let conn = db.connection();
    assert_eq!(
        raw_text(conn, "SELECT date FROM transactions WHERE id = 1"),
        "2023-11-02T09:30:00+00:00"
    );
    assert_eq!(
        raw_text(conn, "SELECT import_timestamp FROM transactions WHERE id = 2"),
        "2023-11-05T00:00:00+00:00"
    );

    let tx = db.get_transaction(1).unwrap().unwrap();
    assert_eq!(tx.date, Utc.with_ymd_and_hms(2023, 11, 2, 9, 30, 0).unwrap());
    let err = db.get_transaction(2).unwrap_err();
    assert!(matches!(err, DatabaseError::Sqlite(_)));

    assert!(db.prepare(BackfillOptions::default()).unwrap().is_noop());
}

#[test]
fn test_truncated_name_fails_typed_read_and_nulls_in_sql() {
    let db = Database::open_in_memory(manager()).unwrap();
    let created = db.insert_account(&account("Chase Checking", 1500.0)).unwrap();
    let conn = db.connection();

    let stored = raw_text(conn, "SELECT name FROM accounts");
    conn.execute(
        "UPDATE accounts SET name = ?1 WHERE id = ?2",
        params![&stored[..stored.len() - 8], created.id],
    )
    .unwrap();

    let err = db.get_account(created.id).unwrap_err();
    assert!(err.is_decryption());

    let name: Option<String> = conn
        .query_row("SELECT decrypt_text(name) FROM accounts", [], |row| row.get(0))
        .unwrap();
    assert!(name.is_none());
}

fn add_name_index(conn: &Connection) {
    conn.execute_batch(&format!(
        "ALTER TABLE accounts ADD COLUMN name_index TEXT;
         CREATE UNIQUE INDEX {} ON accounts(name_index);",
        NAME_INDEX
    ))
    .unwrap();
}

fn set_phase(conn: &Connection, phase: EncryptionPhase) {
    conn.execute(
        "UPDATE encryption_state SET phase = ?1 WHERE id = 1",
        params![phase.as_str()],
    )
    .unwrap();
}

#[test]
fn test_resume_after_structural_step() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("resume_structural.db");
    create_legacy_db(&path);
    {
        let conn = Connection::open(&path).unwrap();
        add_name_index(&conn);
        set_phase(&conn, EncryptionPhase::StructuralUpgradeDone);
    }

    let db = Database::open_for_maintenance(&path, manager()).unwrap();
    let report = db.prepare(BackfillOptions::default()).unwrap();
    assert_eq!(report.phase_before, EncryptionPhase::StructuralUpgradeDone);
    assert!(!report.added_name_index);
    assert!(!report.created_unique_index);
    assert_eq!(report.tokens_backfilled, 2);
    assert!(db.encryption_status().unwrap().is_fully_encrypted());
    assert!(db.get_account_by_name("amex gold").unwrap().is_some());
}

#[test]
fn test_resume_mid_row_backfill() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("resume_rows.db");
    create_legacy_db(&path);
    let manager = manager();

    let done_name = manager.encrypt_text("Chase Checking").unwrap();
    {
        let conn = Connection::open(&path).unwrap();
        add_name_index(&conn);
        let token = manager
            .derive_search_token("Chase Checking")
            .unwrap()
            .into_string();
        conn.execute(
            "UPDATE accounts SET name = ?1, name_index = ?2 WHERE id = 1",
            params![done_name, token],
        )
        .unwrap();
        set_phase(&conn, EncryptionPhase::RowBackfillInProgress);
    }

    let db = Database::open_for_maintenance(&path, Arc::clone(&manager)).unwrap();
    let report = db.prepare(BackfillOptions::default()).unwrap();
    assert_eq!(report.phase_before, EncryptionPhase::RowBackfillInProgress);
    assert_eq!(report.phase_after, EncryptionPhase::Migrated);
    assert_eq!(report.tokens_backfilled, 1);
    assert!(report.skipped.is_empty());

    let conn = db.connection();
    assert_eq!(raw_text(conn, "SELECT name FROM accounts WHERE id = 1"), done_name);
    assert!(db.encryption_status().unwrap().is_fully_encrypted());
    assert_eq!(db.get_account_by_name("CHASE CHECKING").unwrap().unwrap().id, 1);
    assert_eq!(db.get_account_by_name("amex gold").unwrap().unwrap().id, 2);
}

#[tokio::test]
async fn test_async_open_upgrades_legacy_database() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("async_legacy.db");
    create_legacy_db(&path);
    let manager = manager();

    let db = crate::AsyncDatabase::open(&path, Arc::clone(&manager)).await.unwrap();
    let status = db.call(|conn| crate::encryption_status(conn)).await.unwrap();
    assert_eq!(status.phase, EncryptionPhase::Migrated);
    assert!(status.is_fully_encrypted());

    let found = db
        .call(move |conn| queries::get_account_by_name(conn, &manager, "chase checking"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.balance, 1500.0);
    db.close().await.unwrap();
}

#[test]
fn test_concurrent_same_name_inserts_yield_one_account() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("race.db");
    let manager = manager();
    let pool = DatabasePool::open(&path, PoolConfig::default(), Arc::clone(&manager)).unwrap();

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    let conn = pool.get().unwrap();
                    queries::insert_account(&conn, &manager, &account("Joint Savings", 0.0))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.into_iter().filter_map(Result::err) {
        assert!(matches!(err, DatabaseError::InvalidData(_)), "unexpected error: {:?}", err);
    }
}
