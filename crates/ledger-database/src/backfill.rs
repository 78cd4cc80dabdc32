//! Encryption backfill for databases that still hold plaintext.
//!
//! Runs after the schema migrations on every open. The first run on a legacy
//! database moves it through:
//!
//! ```text
//! not_migrated -> structural_upgrade_done -> row_backfill_in_progress -> migrated
//! ```
//!
//! - Structural step: add `accounts.name_index` and its unique index.
//! - Row step: derive missing account name tokens, encrypt every plaintext
//!   value in the registered sensitive columns, and rewrite legacy
//!   transaction timestamps as UTC RFC 3339.
//!
//! Each step runs inside a savepoint. Valid ciphertext is never re-encrypted,
//! so an interrupted run is simply repeated. Rows that cannot be processed
//! are recorded in `encryption_skipped_rows`; a `migrated` database whose only
//! remaining work is those rows is a no-op.

use crate::migrations;
use crate::models::{format_timestamp, parse_timestamp};
use crate::{DatabaseError, DatabaseResult};
use ledger_crypto::{
    has_envelope_prefix, is_ciphertext, parse_canonical_numeric, EncryptionError,
    EncryptionManager, FieldKind, FieldValue,
};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// Unique index backing account name uniqueness.
pub const NAME_INDEX: &str = "idx_accounts_name_index";

/// Progress of the encryption rollout, persisted in `encryption_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPhase {
    NotMigrated,
    StructuralUpgradeDone,
    RowBackfillInProgress,
    Migrated,
}

impl Default for EncryptionPhase {
    fn default() -> Self {
        Self::NotMigrated
    }
}

impl EncryptionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotMigrated => "not_migrated",
            Self::StructuralUpgradeDone => "structural_upgrade_done",
            Self::RowBackfillInProgress => "row_backfill_in_progress",
            Self::Migrated => "migrated",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "structural_upgrade_done" => Self::StructuralUpgradeDone,
            "row_backfill_in_progress" => Self::RowBackfillInProgress,
            "migrated" => Self::Migrated,
            _ => Self::NotMigrated,
        }
    }
}

/// One sensitive column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensitiveColumn {
    pub table: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
}

const fn text(table: &'static str, column: &'static str) -> SensitiveColumn {
    SensitiveColumn {
        table,
        column,
        kind: FieldKind::Text,
    }
}

const fn numeric(table: &'static str, column: &'static str) -> SensitiveColumn {
    SensitiveColumn {
        table,
        column,
        kind: FieldKind::Numeric,
    }
}

/// Every encrypted column in the schema.
pub const ENCRYPTED_COLUMNS: &[SensitiveColumn] = &[
    text("accounts", "name"),
    numeric("accounts", "balance"),
    text("transactions", "description"),
    numeric("transactions", "amount"),
    text("transactions", "category"),
    text("transactions", "account"),
    text("transactions", "source_file"),
    text("budgets", "category"),
    numeric("budgets", "allocated_amount"),
    numeric("balance_history", "balance"),
    numeric("balance_overrides", "override_balance"),
    numeric("income_overrides", "override_amount"),
];

/// Transaction timestamps rewritten as UTC RFC 3339.
pub const TIMESTAMP_COLUMNS: &[(&str, &str)] =
    &[("transactions", "date"), ("transactions", "import_timestamp")];

/// Shape of a timestamp already in canonical form.
const CANONICAL_TIMESTAMP_GLOB: &str =
    "[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]T[0-9][0-9]:[0-9][0-9]:[0-9][0-9]*+00:00";

/// Column label for skipped name token derivations.
const NAME_TOKEN_COLUMN: &str = "name_index";

/// Backfill options.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackfillOptions {
    /// Run everything, report, then roll back.
    pub dry_run: bool,
}

/// Values encrypted in one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnChange {
    pub table: &'static str,
    pub column: &'static str,
    pub encrypted: usize,
}

/// A row the backfill left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    pub table: &'static str,
    pub column: &'static str,
    pub row_id: i64,
    pub reason: String,
}

/// What a backfill run did (or would do, for a dry run).
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub dry_run: bool,
    pub phase_before: EncryptionPhase,
    pub phase_after: EncryptionPhase,
    pub added_name_index: bool,
    pub created_unique_index: bool,
    pub tokens_backfilled: usize,
    pub columns: Vec<ColumnChange>,
    pub timestamps_normalized: usize,
    pub skipped: Vec<SkippedRow>,
    /// Rows skipped by an earlier run and left alone this time.
    pub previously_skipped: usize,
}

impl BackfillReport {
    /// Total values encrypted across all columns.
    pub fn values_encrypted(&self) -> usize {
        self.columns.iter().map(|c| c.encrypted).sum()
    }

    /// True when the run changed nothing.
    pub fn is_noop(&self) -> bool {
        !self.added_name_index
            && !self.created_unique_index
            && self.tokens_backfilled == 0
            && self.values_encrypted() == 0
            && self.timestamps_normalized == 0
            && self.phase_before == self.phase_after
    }

    fn record_skip(&mut self, table: &'static str, column: &'static str, row_id: i64, reason: String) {
        warn!(table, column, row_id, reason = %reason, "Skipping row during encryption backfill");
        self.skipped.push(SkippedRow {
            table,
            column,
            row_id,
            reason,
        });
    }
}

/// Classification of a stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Null,
    /// Already an envelope; never touched again.
    Ciphertext,
    /// Legacy plaintext, ready to encrypt.
    Plaintext(FieldValue),
    /// Cannot be interpreted as the column's kind.
    Unusable(&'static str),
}

/// Classify a raw column value as ciphertext or plaintext.
pub fn classify(kind: FieldKind, raw: ValueRef<'_>) -> StoredValue {
    match raw {
        ValueRef::Null => StoredValue::Null,
        ValueRef::Blob(_) => StoredValue::Unusable("BLOB value"),
        ValueRef::Text(bytes) => {
            let Ok(text) = std::str::from_utf8(bytes) else {
                return StoredValue::Unusable("invalid UTF-8");
            };
            if has_envelope_prefix(text) {
                return if is_ciphertext(text) {
                    StoredValue::Ciphertext
                } else {
                    StoredValue::Unusable("malformed envelope")
                };
            }
            match kind {
                FieldKind::Text => StoredValue::Plaintext(FieldValue::Text(text.to_string())),
                FieldKind::Numeric => match parse_canonical_numeric(text) {
                    Ok(value) => StoredValue::Plaintext(FieldValue::Numeric(value)),
                    Err(_) => StoredValue::Unusable("not a number"),
                },
            }
        }
        ValueRef::Integer(i) => match kind {
            FieldKind::Text => StoredValue::Plaintext(FieldValue::Text(i.to_string())),
            FieldKind::Numeric => StoredValue::Plaintext(FieldValue::Numeric(i as f64)),
        },
        ValueRef::Real(f) => match kind {
            FieldKind::Text => StoredValue::Plaintext(FieldValue::Text(f.to_string())),
            FieldKind::Numeric => StoredValue::Plaintext(FieldValue::Numeric(f)),
        },
    }
}

/// Read the persisted phase. Databases without the state table are
/// `NotMigrated`.
pub fn read_phase(conn: &Connection) -> DatabaseResult<EncryptionPhase> {
    if !table_exists(conn, "encryption_state")? {
        return Ok(EncryptionPhase::NotMigrated);
    }
    let phase: Option<String> = conn
        .query_row(
            "SELECT phase FROM encryption_state WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(phase
        .as_deref()
        .map(EncryptionPhase::from_str)
        .unwrap_or_default())
}

fn write_phase(conn: &Connection, phase: EncryptionPhase) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO encryption_state (id, phase, updated_at) VALUES (1, ?1, datetime('now'))
         ON CONFLICT(id) DO UPDATE SET phase = excluded.phase, updated_at = excluded.updated_at",
        params![phase.as_str()],
    )?;
    debug!(phase = phase.as_str(), "Encryption phase recorded");
    Ok(())
}

/// Run schema migrations and the encryption backfill.
///
/// Every connection-opening path calls this before handing the connection
/// out. With `dry_run` both steps are rolled back.
pub fn prepare_database(
    conn: &Connection,
    manager: &EncryptionManager,
    options: BackfillOptions,
) -> DatabaseResult<BackfillReport> {
    if options.dry_run {
        return with_rollback(conn, "ledger_prepare_dry_run", || {
            migrations::run_migrations(conn)?;
            backfill(conn, manager, true)
        });
    }
    migrations::run_migrations(conn)?;
    backfill(conn, manager, false)
}

/// Run the encryption backfill on an already-migrated database.
pub fn run_encryption_backfill(
    conn: &Connection,
    manager: &EncryptionManager,
    options: BackfillOptions,
) -> DatabaseResult<BackfillReport> {
    if options.dry_run {
        return with_rollback(conn, "ledger_backfill_dry_run", || backfill(conn, manager, true));
    }
    backfill(conn, manager, false)
}

fn backfill(
    conn: &Connection,
    manager: &EncryptionManager,
    dry_run: bool,
) -> DatabaseResult<BackfillReport> {
    let phase_before = read_phase(conn)?;
    let mut report = BackfillReport {
        dry_run,
        phase_before,
        phase_after: phase_before,
        ..Default::default()
    };

    if phase_before == EncryptionPhase::Migrated
        && column_exists(conn, "accounts", "name_index")?
        && index_exists(conn, NAME_INDEX)?
    {
        let pending = pending_rows(conn)?;
        let known = recorded_skips(conn)?;
        if pending.is_subset(&known) {
            report.previously_skipped = pending.len();
            debug!(previously_skipped = pending.len(), "Encryption backfill already complete");
            return Ok(report);
        }
        debug!(
            pending = pending.difference(&known).count(),
            "Rows need encryption after migration"
        );
    }

    info!(phase = phase_before.as_str(), dry_run, "Starting encryption backfill");

    in_savepoint(conn, "ledger_structural", || structural_upgrade(conn, &mut report))?;

    write_phase(conn, EncryptionPhase::RowBackfillInProgress)?;

    in_savepoint(conn, "ledger_rows", || {
        backfill_account_tokens(conn, manager, &mut report)?;
        for sensitive in ENCRYPTED_COLUMNS {
            encrypt_column(conn, manager, sensitive, &mut report)?;
        }
        for &(table, column) in TIMESTAMP_COLUMNS {
            normalize_timestamps(conn, table, column, &mut report)?;
        }
        record_skips(conn, &report.skipped)?;
        write_phase(conn, EncryptionPhase::Migrated)
    })?;
    report.phase_after = EncryptionPhase::Migrated;

    info!(
        dry_run,
        tokens_backfilled = report.tokens_backfilled,
        values_encrypted = report.values_encrypted(),
        timestamps_normalized = report.timestamps_normalized,
        skipped = report.skipped.len(),
        "Encryption backfill complete"
    );
    Ok(report)
}

fn structural_upgrade(conn: &Connection, report: &mut BackfillReport) -> DatabaseResult<()> {
    if !column_exists(conn, "accounts", "name_index")? {
        conn.execute_batch("ALTER TABLE accounts ADD COLUMN name_index TEXT")?;
        report.added_name_index = true;
        info!("Added accounts.name_index");
    }

    let existing = existing_tokens(conn)?;
    let groups = duplicate_groups(existing);
    if !groups.is_empty() {
        error!(groups = groups.len(), "Existing account name tokens collide");
        return Err(DatabaseError::DuplicateAccountNames { groups });
    }

    if !index_exists(conn, NAME_INDEX)? {
        conn.execute_batch(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON accounts(name_index)",
            NAME_INDEX
        ))?;
        report.created_unique_index = true;
        info!(index = NAME_INDEX, "Created unique account name index");
    }

    if read_phase(conn)? == EncryptionPhase::NotMigrated {
        write_phase(conn, EncryptionPhase::StructuralUpgradeDone)?;
    }
    Ok(())
}

struct PendingToken {
    id: i64,
    token: String,
    encrypted_name: Option<String>,
}

fn backfill_account_tokens(
    conn: &Connection,
    manager: &EncryptionManager,
    report: &mut BackfillReport,
) -> DatabaseResult<()> {
    let rows: Vec<(i64, Value)> = {
        let mut stmt =
            conn.prepare("SELECT id, name FROM accounts WHERE name_index IS NULL ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut pending = Vec::with_capacity(rows.len());
    for (id, raw) in rows {
        let (plaintext, encrypted_name) = match classify(FieldKind::Text, ValueRef::from(&raw)) {
            StoredValue::Ciphertext => {
                let Value::Text(envelope) = &raw else {
                    continue;
                };
                match manager.decrypt_text(envelope) {
                    Ok(plaintext) => (plaintext, None),
                    Err(e) => {
                        report.record_skip("accounts", NAME_TOKEN_COLUMN, id, e.to_string());
                        continue;
                    }
                }
            }
            StoredValue::Plaintext(FieldValue::Text(plaintext)) => {
                let encrypted = manager.encrypt_text(&plaintext)?;
                (plaintext, Some(encrypted))
            }
            StoredValue::Plaintext(FieldValue::Numeric(_)) | StoredValue::Null => {
                report.record_skip("accounts", NAME_TOKEN_COLUMN, id, "missing name".to_string());
                continue;
            }
            StoredValue::Unusable(reason) => {
                report.record_skip("accounts", NAME_TOKEN_COLUMN, id, reason.to_string());
                continue;
            }
        };

        let token = match manager.derive_search_token(&plaintext) {
            Ok(token) => token.into_string(),
            Err(EncryptionError::EmptySearchInput) => {
                report.record_skip("accounts", NAME_TOKEN_COLUMN, id, "empty name".to_string());
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        pending.push(PendingToken {
            id,
            token,
            encrypted_name,
        });
    }

    let mut all_tokens = existing_tokens(conn)?;
    all_tokens.extend(pending.iter().map(|p| (p.token.clone(), p.id)));
    let groups = duplicate_groups(all_tokens);
    if !groups.is_empty() {
        error!(groups = groups.len(), "Account names collide after normalization");
        return Err(DatabaseError::DuplicateAccountNames { groups });
    }

    let mut stmt = conn.prepare(
        "UPDATE accounts SET name = COALESCE(?1, name), name_index = ?2 WHERE id = ?3",
    )?;
    for p in &pending {
        stmt.execute(params![p.encrypted_name, p.token, p.id])?;
    }
    report.tokens_backfilled += pending.len();
    report.columns.push(ColumnChange {
        table: "accounts",
        column: "name",
        encrypted: pending.iter().filter(|p| p.encrypted_name.is_some()).count(),
    });
    Ok(())
}

fn encrypt_column(
    conn: &Connection,
    manager: &EncryptionManager,
    sensitive: &SensitiveColumn,
    report: &mut BackfillReport,
) -> DatabaseResult<()> {
    if !table_exists(conn, sensitive.table)? || !column_exists(conn, sensitive.table, sensitive.column)? {
        info!(table = sensitive.table, column = sensitive.column, "Skipping missing column");
        return Ok(());
    }

    let rows: Vec<(i64, Value)> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, {col} FROM {table} WHERE {col} IS NOT NULL ORDER BY id",
            col = sensitive.column,
            table = sensitive.table,
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut update = conn.prepare(&format!(
        "UPDATE {table} SET {col} = ?1 WHERE id = ?2",
        col = sensitive.column,
        table = sensitive.table,
    ))?;

    let mut encrypted = 0;
    for (id, raw) in rows {
        let value = match classify(sensitive.kind, ValueRef::from(&raw)) {
            StoredValue::Null | StoredValue::Ciphertext => continue,
            StoredValue::Plaintext(value) => value,
            StoredValue::Unusable(reason) => {
                report.record_skip(sensitive.table, sensitive.column, id, reason.to_string());
                continue;
            }
        };
        let envelope = match manager.encrypt_value(&value) {
            Ok(envelope) => envelope,
            Err(EncryptionError::InvalidValue(reason)) => {
                report.record_skip(sensitive.table, sensitive.column, id, reason);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        update.execute(params![envelope, id])?;
        encrypted += 1;
    }

    if encrypted > 0 {
        debug!(table = sensitive.table, column = sensitive.column, encrypted, "Encrypted legacy values");
    }

    match report
        .columns
        .iter_mut()
        .find(|c| c.table == sensitive.table && c.column == sensitive.column)
    {
        Some(change) => change.encrypted += encrypted,
        None => report.columns.push(ColumnChange {
            table: sensitive.table,
            column: sensitive.column,
            encrypted,
        }),
    }
    Ok(())
}

fn normalize_timestamps(
    conn: &Connection,
    table: &'static str,
    column: &'static str,
    report: &mut BackfillReport,
) -> DatabaseResult<()> {
    if !table_exists(conn, table)? || !column_exists(conn, table, column)? {
        return Ok(());
    }

    let rows: Vec<(i64, Value)> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, {col} FROM {table} WHERE {col} IS NOT NULL ORDER BY id",
            col = column,
            table = table,
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut update = conn.prepare(&format!(
        "UPDATE {table} SET {col} = ?1 WHERE id = ?2",
        col = column,
        table = table,
    ))?;

    let mut normalized = 0;
    for (id, raw) in rows {
        let Value::Text(stored) = raw else {
            report.record_skip(table, column, id, "timestamp is not text".to_string());
            continue;
        };
        let Some(parsed) = parse_timestamp(&stored) else {
            report.record_skip(table, column, id, "unrecognized timestamp".to_string());
            continue;
        };
        let canonical = format_timestamp(&parsed);
        if canonical != stored {
            update.execute(params![canonical, id])?;
            normalized += 1;
        }
    }

    if normalized > 0 {
        debug!(table, column, normalized, "Normalized legacy timestamps");
    }
    report.timestamps_normalized += normalized;
    Ok(())
}

type RowKey = (String, String, i64);

/// Rows a full backfill run would act on: accounts without a token, values
/// that are not ciphertext, and timestamps not yet in canonical form.
fn pending_rows(conn: &Connection) -> DatabaseResult<BTreeSet<RowKey>> {
    let mut queries: Vec<(&str, &str, String)> = Vec::new();

    if column_exists(conn, "accounts", "name_index")? {
        queries.push((
            "accounts",
            NAME_TOKEN_COLUMN,
            "SELECT id FROM accounts WHERE name_index IS NULL".to_string(),
        ));
    }
    for sensitive in ENCRYPTED_COLUMNS {
        if table_exists(conn, sensitive.table)? && column_exists(conn, sensitive.table, sensitive.column)? {
            queries.push((
                sensitive.table,
                sensitive.column,
                format!(
                    "SELECT id FROM {table} WHERE {col} IS NOT NULL AND NOT is_ciphertext({col})",
                    col = sensitive.column,
                    table = sensitive.table,
                ),
            ));
        }
    }
    for &(table, column) in TIMESTAMP_COLUMNS {
        if table_exists(conn, table)? && column_exists(conn, table, column)? {
            queries.push((
                table,
                column,
                format!(
                    "SELECT id FROM {table} WHERE {col} IS NOT NULL AND NOT ({col} GLOB '{glob}')",
                    col = column,
                    table = table,
                    glob = CANONICAL_TIMESTAMP_GLOB,
                ),
            ));
        }
    }

    let mut pending = BTreeSet::new();
    for (table, column, sql) in queries {
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        pending.extend(ids.into_iter().map(|id| (table.to_string(), column.to_string(), id)));
    }
    Ok(pending)
}

fn recorded_skips(conn: &Connection) -> DatabaseResult<BTreeSet<RowKey>> {
    if !table_exists(conn, "encryption_skipped_rows")? {
        return Ok(BTreeSet::new());
    }
    let mut stmt =
        conn.prepare("SELECT table_name, column_name, row_id FROM encryption_skipped_rows")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(rows)
}

/// Replace the skipped-row ledger with this run's skips.
fn record_skips(conn: &Connection, skipped: &[SkippedRow]) -> DatabaseResult<()> {
    if !table_exists(conn, "encryption_skipped_rows")? {
        return Ok(());
    }
    conn.execute("DELETE FROM encryption_skipped_rows", [])?;
    let mut insert = conn.prepare(
        "INSERT OR REPLACE INTO encryption_skipped_rows (table_name, column_name, row_id, reason)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for row in skipped {
        insert.execute(params![row.table, row.column, row.row_id, row.reason])?;
    }
    Ok(())
}

/// Plaintext values remaining in one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaintextCount {
    pub table: &'static str,
    pub column: &'static str,
    pub plaintext: usize,
}

/// Encryption health of one database.
#[derive(Debug, Clone, Serialize)]
pub struct EncryptionStatus {
    pub phase: EncryptionPhase,
    pub name_index_present: bool,
    pub accounts_missing_tokens: usize,
    /// Non-NULL values that are not ciphertext, per column.
    pub plaintext_values: Vec<PlaintextCount>,
    /// Rows the last backfill run could not process.
    pub skipped_rows: usize,
}

impl EncryptionStatus {
    pub fn is_fully_encrypted(&self) -> bool {
        self.phase == EncryptionPhase::Migrated
            && self.name_index_present
            && self.accounts_missing_tokens == 0
            && self.plaintext_values.iter().all(|c| c.plaintext == 0)
    }
}

/// Inspect the database without changing it. Never reads plaintext out.
pub fn encryption_status(conn: &Connection) -> DatabaseResult<EncryptionStatus> {
    let phase = read_phase(conn)?;
    let name_index_present = column_exists(conn, "accounts", "name_index")?;
    let accounts_missing_tokens = if name_index_present {
        accounts_missing_tokens(conn)?
    } else if table_exists(conn, "accounts")? {
        conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get::<_, i64>(0))? as usize
    } else {
        0
    };

    let mut plaintext_values = Vec::new();
    for sensitive in ENCRYPTED_COLUMNS {
        if !table_exists(conn, sensitive.table)? || !column_exists(conn, sensitive.table, sensitive.column)? {
            continue;
        }
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {table} WHERE {col} IS NOT NULL AND NOT is_ciphertext({col})",
                col = sensitive.column,
                table = sensitive.table,
            ),
            [],
            |row| row.get(0),
        )?;
        plaintext_values.push(PlaintextCount {
            table: sensitive.table,
            column: sensitive.column,
            plaintext: count as usize,
        });
    }

    let skipped_rows = if table_exists(conn, "encryption_skipped_rows")? {
        conn.query_row("SELECT COUNT(*) FROM encryption_skipped_rows", [], |row| {
            row.get::<_, i64>(0)
        })? as usize
    } else {
        0
    };

    Ok(EncryptionStatus {
        phase,
        name_index_present,
        accounts_missing_tokens,
        plaintext_values,
        skipped_rows,
    })
}

fn accounts_missing_tokens(conn: &Connection) -> DatabaseResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM accounts WHERE name_index IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn existing_tokens(conn: &Connection) -> DatabaseResult<Vec<(String, i64)>> {
    let mut stmt =
        conn.prepare("SELECT name_index, id FROM accounts WHERE name_index IS NOT NULL")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Group row ids sharing a token; only groups with two or more ids.
fn duplicate_groups(tokens: Vec<(String, i64)>) -> Vec<Vec<i64>> {
    let mut by_token: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for (token, id) in tokens {
        by_token.entry(token).or_default().push(id);
    }
    by_token
        .into_values()
        .filter(|ids| ids.len() > 1)
        .map(|mut ids| {
            ids.sort_unstable();
            ids
        })
        .collect()
}

fn table_exists(conn: &Connection, table: &str) -> DatabaseResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> DatabaseResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn index_exists(conn: &Connection, index: &str) -> DatabaseResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
        params![index],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Run `f` inside a savepoint; release on success, roll back on error.
fn in_savepoint<T>(
    conn: &Connection,
    name: &str,
    f: impl FnOnce() -> DatabaseResult<T>,
) -> DatabaseResult<T> {
    conn.execute_batch(&format!("SAVEPOINT {}", name))?;
    match f() {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {}", name))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = rollback_savepoint(conn, name) {
                warn!(savepoint = name, error = %rollback, "Savepoint rollback failed");
            }
            Err(e)
        }
    }
}

/// Run `f` inside a savepoint that is always rolled back.
fn with_rollback<T>(
    conn: &Connection,
    name: &str,
    f: impl FnOnce() -> DatabaseResult<T>,
) -> DatabaseResult<T> {
    conn.execute_batch(&format!("SAVEPOINT {}", name))?;
    let result = f();
    rollback_savepoint(conn, name)?;
    result
}

fn rollback_savepoint(conn: &Connection, name: &str) -> DatabaseResult<()> {
    conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}", name = name))?;
    Ok(())
}
