//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` and the shared `EncryptionManager`.
//! Sensitive columns are encrypted through the column adapters in
//! [`crate::models`] on write and decrypted on read. Filtering and sorting on
//! encrypted values goes through the SQL functions registered on every
//! connection (`decrypt_text`, `decrypt_numeric`) or, for equality on account
//! names, through the `name_index` search token.

use crate::adapters::{column, optional_column, EncryptedColumn};
use crate::models::{
    parse_timestamp, ACCOUNT_BALANCE, ACCOUNT_NAME, BALANCE_HISTORY_BALANCE, BALANCE_OVERRIDE_BALANCE,
    BUDGET_ALLOCATED_AMOUNT, BUDGET_CATEGORY, INCOME_OVERRIDE_AMOUNT, TRANSACTION_ACCOUNT,
    TRANSACTION_AMOUNT, TRANSACTION_CATEGORY, TRANSACTION_DESCRIPTION, TRANSACTION_SOURCE_FILE,
};
use crate::{
    Account, AccountType, BalanceHistory, BalanceOverride, Budget, DatabaseError, DatabaseResult,
    IncomeOverride, NewAccount, NewBudget, NewTransaction, Transaction,
};
use chrono::{DateTime, NaiveDate, Utc};
use ledger_crypto::{normalize_search_input, DecryptionError, EncryptionManager};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use tracing::{debug, warn};

// ==========================================
// Accounts
// ==========================================

const ACCOUNT_COLUMNS: &str = "id, name, type, balance, created_at, updated_at";

fn account_from_row(row: &Row<'_>, manager: &EncryptionManager) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: column(row, 1, &ACCOUNT_NAME, manager)?,
        account_type: AccountType::from_str(&row.get::<_, String>(2)?),
        balance: column(row, 3, &ACCOUNT_BALANCE, manager)?,
        created_at: parse_datetime(row, 4)?,
        updated_at: parse_datetime(row, 5)?,
    })
}

/// Insert a new account.
///
/// The name is trimmed, encrypted, and indexed by its search token. A name
/// that normalizes to an existing account's name is rejected.
pub fn insert_account(
    conn: &Connection,
    manager: &EncryptionManager,
    account: &NewAccount,
) -> DatabaseResult<Account> {
    let name = account.name.trim().to_string();
    if name.is_empty() {
        return Err(DatabaseError::InvalidData(
            "Account name cannot be empty".to_string(),
        ));
    }
    if get_account_by_name(conn, manager, &name)?.is_some() {
        return Err(DatabaseError::InvalidData(
            "An account with this name already exists".to_string(),
        ));
    }

    let token = manager.derive_search_token(&name)?;
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO accounts (name, name_index, type, balance, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![
            ACCOUNT_NAME.bind(manager, &name)?,
            token.as_str(),
            account.account_type.as_str(),
            ACCOUNT_BALANCE.bind(manager, &account.balance)?,
            now,
        ],
    )
    .map_err(name_conflict)?;
    let id = conn.last_insert_rowid();
    debug!(account_id = id, "Account inserted");

    get_account(conn, manager, id)?
        .ok_or_else(|| DatabaseError::NotFound("Account not found after insert".to_string()))
}

/// Get an account by ID.
pub fn get_account(
    conn: &Connection,
    manager: &EncryptionManager,
    id: i64,
) -> DatabaseResult<Option<Account>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM accounts WHERE id = ?1",
        ACCOUNT_COLUMNS
    ))?;

    let result = stmt.query_row(params![id], |row| account_from_row(row, manager));

    match result {
        Ok(account) => Ok(Some(account)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Get an account by name (case and surrounding whitespace ignored).
///
/// Looks up the search token, then confirms the decrypted name so a token
/// collision can never return the wrong account.
pub fn get_account_by_name(
    conn: &Connection,
    manager: &EncryptionManager,
    name: &str,
) -> DatabaseResult<Option<Account>> {
    let token = match manager.derive_search_token(name) {
        Ok(token) => token,
        Err(ledger_crypto::EncryptionError::EmptySearchInput) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM accounts WHERE name_index = ?1",
        ACCOUNT_COLUMNS
    ))?;
    let candidates = stmt
        .query_map(params![token.as_str()], |row| account_from_row(row, manager))?
        .collect::<Result<Vec<_>, _>>()?;

    let wanted = normalize_search_input(name);
    Ok(candidates
        .into_iter()
        .find(|account| normalize_search_input(&account.name) == wanted))
}

/// List all accounts ordered by decrypted name.
pub fn list_accounts(conn: &Connection, manager: &EncryptionManager) -> DatabaseResult<Vec<Account>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM accounts ORDER BY LOWER({}), id",
        ACCOUNT_COLUMNS,
        ACCOUNT_NAME.select_expr("name")
    ))?;

    let accounts = stmt
        .query_map([], |row| account_from_row(row, manager))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(accounts)
}

/// Rename an account, keeping its search token in step.
pub fn rename_account(
    conn: &Connection,
    manager: &EncryptionManager,
    id: i64,
    new_name: &str,
) -> DatabaseResult<bool> {
    let name = new_name.trim().to_string();
    if name.is_empty() {
        return Err(DatabaseError::InvalidData(
            "Account name cannot be empty".to_string(),
        ));
    }
    if let Some(existing) = get_account_by_name(conn, manager, &name)? {
        if existing.id != id {
            return Err(DatabaseError::InvalidData(
                "An account with this name already exists".to_string(),
            ));
        }
    }

    let token = manager.derive_search_token(&name)?;
    let count = conn.execute(
        "UPDATE accounts SET name = ?1, name_index = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            ACCOUNT_NAME.bind(manager, &name)?,
            token.as_str(),
            Utc::now().to_rfc3339(),
            id
        ],
    )
    .map_err(name_conflict)?;
    Ok(count > 0)
}

/// Map a unique violation on the account name token to `InvalidData`.
///
/// The lookup before a write can race with another connection writing the
/// same name; the unique index decides and the loser sees this error.
fn name_conflict(err: rusqlite::Error) -> DatabaseError {
    let duplicate_name = matches!(
        &err,
        rusqlite::Error::SqliteFailure(failure, Some(message))
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                && message.contains("name_index")
    );
    if duplicate_name {
        DatabaseError::InvalidData("An account with this name already exists".to_string())
    } else {
        err.into()
    }
}

/// Update an account balance and record it in the balance history.
pub fn update_account_balance(
    conn: &Connection,
    manager: &EncryptionManager,
    id: i64,
    balance: f64,
    notes: Option<&str>,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE accounts SET balance = ?1, updated_at = ?2 WHERE id = ?3",
        params![
            ACCOUNT_BALANCE.bind(manager, &balance)?,
            Utc::now().to_rfc3339(),
            id
        ],
    )?;
    if count > 0 {
        record_balance(conn, manager, id, balance, notes)?;
    }
    Ok(count > 0)
}

/// Delete an account by ID.
pub fn delete_account(conn: &Connection, id: i64) -> DatabaseResult<bool> {
    let count = conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
    Ok(count > 0)
}

// ==========================================
// Transactions
// ==========================================

const TRANSACTION_COLUMNS: &str = "id, date, description, amount, category, account, account_id, source_file, import_timestamp, duplicate_hash, is_transfer, transfer_to_account_id";

fn transaction_from_row(
    row: &Row<'_>,
    manager: &EncryptionManager,
) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        date: parse_datetime(row, 1)?,
        description: column(row, 2, &TRANSACTION_DESCRIPTION, manager)?,
        amount: column(row, 3, &TRANSACTION_AMOUNT, manager)?,
        category: optional_column(row, 4, &TRANSACTION_CATEGORY, manager)?,
        account: optional_column(row, 5, &TRANSACTION_ACCOUNT, manager)?,
        account_id: row.get(6)?,
        source_file: column(row, 7, &TRANSACTION_SOURCE_FILE, manager)?,
        import_timestamp: parse_datetime(row, 8)?,
        duplicate_hash: row.get(9)?,
        is_transfer: row.get(10)?,
        transfer_to_account_id: row.get(11)?,
    })
}

/// Insert a new transaction.
pub fn insert_transaction(
    conn: &Connection,
    manager: &EncryptionManager,
    tx: &NewTransaction,
) -> DatabaseResult<Transaction> {
    conn.execute(
        "INSERT INTO transactions (date, description, amount, category, account, account_id, source_file, import_timestamp, duplicate_hash, is_transfer, transfer_to_account_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            tx.date.to_rfc3339(),
            TRANSACTION_DESCRIPTION.bind(manager, &tx.description)?,
            TRANSACTION_AMOUNT.bind(manager, &tx.amount)?,
            TRANSACTION_CATEGORY.bind_optional(manager, tx.category.as_ref())?,
            TRANSACTION_ACCOUNT.bind_optional(manager, tx.account.as_ref())?,
            tx.account_id,
            TRANSACTION_SOURCE_FILE.bind(manager, &tx.source_file)?,
            Utc::now().to_rfc3339(),
            tx.duplicate_hash,
            tx.is_transfer,
            tx.transfer_to_account_id,
        ],
    )?;
    let id = conn.last_insert_rowid();
    get_transaction(conn, manager, id)?
        .ok_or_else(|| DatabaseError::NotFound("Transaction not found after insert".to_string()))
}

/// Get a transaction by ID.
pub fn get_transaction(
    conn: &Connection,
    manager: &EncryptionManager,
    id: i64,
) -> DatabaseResult<Option<Transaction>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM transactions WHERE id = ?1",
        TRANSACTION_COLUMNS
    ))?;

    let result = stmt.query_row(params![id], |row| transaction_from_row(row, manager));

    match result {
        Ok(tx) => Ok(Some(tx)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List transactions, newest first.
pub fn list_transactions(
    conn: &Connection,
    manager: &EncryptionManager,
    limit: i64,
) -> DatabaseResult<Vec<Transaction>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM transactions ORDER BY date DESC, id DESC LIMIT ?1",
        TRANSACTION_COLUMNS
    ))?;

    let transactions = stmt
        .query_map(params![limit], |row| transaction_from_row(row, manager))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(transactions)
}

/// Case-insensitive substring search over decrypted descriptions.
pub fn search_transactions(
    conn: &Connection,
    manager: &EncryptionManager,
    term: &str,
) -> DatabaseResult<Vec<Transaction>> {
    let pattern = format!("%{}%", escape_like(&term.to_lowercase()));
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM transactions WHERE LOWER({}) LIKE ?1 ESCAPE '\\' ORDER BY date DESC, id DESC",
        TRANSACTION_COLUMNS,
        TRANSACTION_DESCRIPTION.select_expr("description")
    ))?;

    let transactions = stmt
        .query_map(params![pattern], |row| transaction_from_row(row, manager))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(transactions)
}

/// Transactions ordered by decrypted amount.
pub fn list_transactions_by_amount(
    conn: &Connection,
    manager: &EncryptionManager,
    descending: bool,
    limit: i64,
) -> DatabaseResult<Vec<Transaction>> {
    let direction = if descending { "DESC" } else { "ASC" };
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM transactions ORDER BY {} {}, id LIMIT ?1",
        TRANSACTION_COLUMNS,
        TRANSACTION_AMOUNT.select_expr("amount"),
        direction
    ))?;

    let transactions = stmt
        .query_map(params![limit], |row| transaction_from_row(row, manager))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(transactions)
}

/// Sum of decrypted amounts for an account, computed in SQL.
///
/// Fails if any stored amount does not decrypt; `SUM` alone would skip the
/// NULL the SQL function returns for it.
pub fn sum_transaction_amounts(conn: &Connection, account_id: i64) -> DatabaseResult<f64> {
    let (total, undecrypted): (Option<f64>, Option<i64>) = conn.query_row(
        &format!(
            "SELECT SUM(v), SUM(raw IS NOT NULL AND v IS NULL)
             FROM (SELECT amount AS raw, {} AS v FROM transactions WHERE account_id = ?1)",
            TRANSACTION_AMOUNT.select_expr("amount")
        ),
        params![account_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let undecrypted = undecrypted.unwrap_or(0);
    if undecrypted > 0 {
        warn!(account_id, undecrypted, "Transaction amounts could not be decrypted");
        return Err(DecryptionError::Authentication.into());
    }
    Ok(total.unwrap_or(0.0))
}

/// Check whether a transaction with this duplicate hash was already imported.
pub fn transaction_exists(conn: &Connection, duplicate_hash: &str) -> DatabaseResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transactions WHERE duplicate_hash = ?1",
        params![duplicate_hash],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Delete a transaction by ID.
pub fn delete_transaction(conn: &Connection, id: i64) -> DatabaseResult<bool> {
    let count = conn.execute("DELETE FROM transactions WHERE id = ?1", params![id])?;
    Ok(count > 0)
}

// ==========================================
// Budgets
// ==========================================

fn budget_from_row(row: &Row<'_>, manager: &EncryptionManager) -> rusqlite::Result<Budget> {
    Ok(Budget {
        id: row.get(0)?,
        category: column(row, 1, &BUDGET_CATEGORY, manager)?,
        allocated_amount: column(row, 2, &BUDGET_ALLOCATED_AMOUNT, manager)?,
        period_start: parse_datetime(row, 3)?,
        period_end: parse_datetime(row, 4)?,
        created_at: parse_datetime(row, 5)?,
        updated_at: parse_datetime(row, 6)?,
    })
}

/// Insert a new budget.
pub fn insert_budget(
    conn: &Connection,
    manager: &EncryptionManager,
    budget: &NewBudget,
) -> DatabaseResult<Budget> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO budgets (category, allocated_amount, period_start, period_end, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![
            BUDGET_CATEGORY.bind(manager, &budget.category)?,
            BUDGET_ALLOCATED_AMOUNT.bind(manager, &budget.allocated_amount)?,
            budget.period_start.to_rfc3339(),
            budget.period_end.to_rfc3339(),
            now,
        ],
    )?;
    let id = conn.last_insert_rowid();

    let mut stmt = conn.prepare_cached(
        "SELECT id, category, allocated_amount, period_start, period_end, created_at, updated_at
         FROM budgets WHERE id = ?1",
    )?;
    let budget = stmt.query_row(params![id], |row| budget_from_row(row, manager))?;
    Ok(budget)
}

/// Budgets whose period contains `at`, ordered by decrypted category.
pub fn list_active_budgets(
    conn: &Connection,
    manager: &EncryptionManager,
    at: DateTime<Utc>,
) -> DatabaseResult<Vec<Budget>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT id, category, allocated_amount, period_start, period_end, created_at, updated_at
         FROM budgets WHERE period_start <= ?1 AND period_end >= ?1
         ORDER BY LOWER({}), id",
        BUDGET_CATEGORY.select_expr("category")
    ))?;

    let budgets = stmt
        .query_map(params![at.to_rfc3339()], |row| budget_from_row(row, manager))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(budgets)
}

// ==========================================
// Balance history and overrides
// ==========================================

/// Record a point-in-time balance for an account.
pub fn record_balance(
    conn: &Connection,
    manager: &EncryptionManager,
    account_id: i64,
    balance: f64,
    notes: Option<&str>,
) -> DatabaseResult<BalanceHistory> {
    let timestamp = Utc::now();
    conn.execute(
        "INSERT INTO balance_history (account_id, balance, timestamp, notes) VALUES (?1, ?2, ?3, ?4)",
        params![
            account_id,
            BALANCE_HISTORY_BALANCE.bind(manager, &balance)?,
            timestamp.to_rfc3339(),
            notes
        ],
    )?;
    Ok(BalanceHistory {
        id: conn.last_insert_rowid(),
        account_id,
        balance,
        timestamp,
        notes: notes.map(str::to_string),
    })
}

/// Balance history for an account, oldest first.
pub fn list_balance_history(
    conn: &Connection,
    manager: &EncryptionManager,
    account_id: i64,
) -> DatabaseResult<Vec<BalanceHistory>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, account_id, balance, timestamp, notes FROM balance_history
         WHERE account_id = ?1 ORDER BY timestamp, id",
    )?;

    let history = stmt
        .query_map(params![account_id], |row| {
            Ok(BalanceHistory {
                id: row.get(0)?,
                account_id: row.get(1)?,
                balance: column(row, 2, &BALANCE_HISTORY_BALANCE, manager)?,
                timestamp: parse_datetime(row, 3)?,
                notes: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(history)
}

/// Set the manual balance for an account on a date.
pub fn set_balance_override(
    conn: &Connection,
    manager: &EncryptionManager,
    account_id: i64,
    date: NaiveDate,
    balance: f64,
    notes: Option<&str>,
) -> DatabaseResult<BalanceOverride> {
    let created_at = Utc::now();
    conn.execute(
        "DELETE FROM balance_overrides WHERE account_id = ?1 AND override_date = ?2",
        params![account_id, date.to_string()],
    )?;
    conn.execute(
        "INSERT INTO balance_overrides (account_id, override_date, override_balance, created_at, notes)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            account_id,
            date.to_string(),
            BALANCE_OVERRIDE_BALANCE.bind(manager, &balance)?,
            created_at.to_rfc3339(),
            notes
        ],
    )?;
    Ok(BalanceOverride {
        id: conn.last_insert_rowid(),
        account_id,
        override_date: date,
        override_balance: balance,
        created_at,
        notes: notes.map(str::to_string),
    })
}

/// Balance overrides for an account, by date.
pub fn list_balance_overrides(
    conn: &Connection,
    manager: &EncryptionManager,
    account_id: i64,
) -> DatabaseResult<Vec<BalanceOverride>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, account_id, override_date, override_balance, created_at, notes
         FROM balance_overrides WHERE account_id = ?1 ORDER BY override_date",
    )?;

    let overrides = stmt
        .query_map(params![account_id], |row| {
            Ok(BalanceOverride {
                id: row.get(0)?,
                account_id: row.get(1)?,
                override_date: parse_date(row, 2)?,
                override_balance: column(row, 3, &BALANCE_OVERRIDE_BALANCE, manager)?,
                created_at: parse_datetime(row, 4)?,
                notes: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(overrides)
}

/// Set the income override for a month (any day in the month).
pub fn set_income_override(
    conn: &Connection,
    manager: &EncryptionManager,
    month: NaiveDate,
    amount: f64,
) -> DatabaseResult<IncomeOverride> {
    let month = first_of_month(month)?;
    let created_at = Utc::now();
    conn.execute(
        "INSERT INTO income_overrides (month, override_amount, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(month) DO UPDATE SET override_amount = excluded.override_amount",
        params![
            month.to_string(),
            INCOME_OVERRIDE_AMOUNT.bind(manager, &amount)?,
            created_at.to_rfc3339()
        ],
    )?;
    get_income_override(conn, manager, month)?
        .ok_or_else(|| DatabaseError::NotFound("Income override not found after upsert".to_string()))
}

/// Income override for the month containing `month`.
pub fn get_income_override(
    conn: &Connection,
    manager: &EncryptionManager,
    month: NaiveDate,
) -> DatabaseResult<Option<IncomeOverride>> {
    let month = first_of_month(month)?;
    let mut stmt = conn.prepare_cached(
        "SELECT id, month, override_amount, created_at FROM income_overrides WHERE month = ?1",
    )?;

    let result = stmt.query_row(params![month.to_string()], |row| {
        Ok(IncomeOverride {
            id: row.get(0)?,
            month: parse_date(row, 1)?,
            override_amount: column(row, 2, &INCOME_OVERRIDE_AMOUNT, manager)?,
            created_at: parse_datetime(row, 3)?,
        })
    });

    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ==========================================
// Helpers
// ==========================================

fn first_of_month(date: NaiveDate) -> DatabaseResult<NaiveDate> {
    use chrono::Datelike;
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
        .ok_or_else(|| DatabaseError::InvalidData(format!("Invalid month: {}", date)))
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Read a stored timestamp. Unparseable values are a conversion error.
fn parse_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_timestamp(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unrecognized timestamp: {}", s).into(),
        )
    })
}

fn parse_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    // Legacy rows may carry a time part after the date.
    NaiveDate::parse_from_str(s.get(..10).unwrap_or(&s), "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
