//! Command handlers.

use std::path::Path;
use std::sync::Arc;

use ledger_crypto::{EncryptionManager, MasterKey, ENV_KEY_NAME};
use ledger_database::{
    BackfillOptions, BackfillReport, Database, DatabaseError, EncryptionStatus,
};
use tracing::{error, info};

type CommandResult = Result<(), Box<dyn std::error::Error>>;

pub fn generate_key() {
    let key = MasterKey::generate();
    println!("{}", key.to_encoded());
    eprintln!(
        "Store this value in {} or as \"encryption_key\" in config.json. Losing it makes the data unreadable.",
        ENV_KEY_NAME
    );
}

pub fn migrate(
    database: &Path,
    manager: Arc<EncryptionManager>,
    dry_run: bool,
    json: bool,
) -> CommandResult {
    info!(path = %database.display(), dry_run, "Running migration");
    let db = Database::open_for_maintenance(database, manager)?;

    let report = match db.prepare(BackfillOptions { dry_run }) {
        Ok(report) => report,
        Err(DatabaseError::DuplicateAccountNames { groups }) => {
            error!(groups = groups.len(), "Migration stopped on duplicate account names");
            eprintln!("Accounts with the same name (after trimming and lowercasing) must be merged or renamed first:");
            for group in &groups {
                let ids: Vec<String> = group.iter().map(|id| id.to_string()).collect();
                eprintln!("  account ids {}", ids.join(", "));
            }
            return Err(DatabaseError::DuplicateAccountNames { groups }.into());
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

pub fn status(database: &Path, manager: Arc<EncryptionManager>, json: bool) -> CommandResult {
    if !database.exists() {
        return Err(format!("database not found: {}", database.display()).into());
    }
    let db = Database::open_for_maintenance(database, manager)?;
    let status = db.encryption_status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_report(report: &BackfillReport) {
    let heading = if report.dry_run {
        "Dry run (no changes written)"
    } else {
        "Migration complete"
    };
    println!("{}", heading);
    println!(
        "  phase: {} -> {}",
        report.phase_before.as_str(),
        report.phase_after.as_str()
    );
    println!("  name_index column added: {}", report.added_name_index);
    println!("  unique name index created: {}", report.created_unique_index);
    println!("  account tokens derived: {}", report.tokens_backfilled);
    for change in report.columns.iter().filter(|c| c.encrypted > 0) {
        println!(
            "  {}.{}: {} value(s) encrypted",
            change.table, change.column, change.encrypted
        );
    }
    println!("  timestamps normalized: {}", report.timestamps_normalized);
    if report.previously_skipped > 0 {
        println!("  rows skipped by an earlier run: {}", report.previously_skipped);
    }
    if !report.skipped.is_empty() {
        println!("  skipped rows: {}", report.skipped.len());
        for skipped in &report.skipped {
            println!(
                "    {}.{} id={}: {}",
                skipped.table, skipped.column, skipped.row_id, skipped.reason
            );
        }
    }
}

fn print_status(status: &EncryptionStatus) {
    println!("phase: {}", status.phase.as_str());
    println!("name_index column: {}", status.name_index_present);
    println!("accounts missing tokens: {}", status.accounts_missing_tokens);
    for count in &status.plaintext_values {
        println!(
            "{}.{}: {} plaintext value(s)",
            count.table, count.column, count.plaintext
        );
    }
    println!("skipped rows: {}", status.skipped_rows);
    if status.is_fully_encrypted() {
        println!("fully encrypted: yes");
    } else {
        println!("fully encrypted: no");
    }
}
