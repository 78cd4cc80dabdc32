//! Finance ledger maintenance CLI - key generation, encryption migration and status.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ledger_config_and_utils::{init_logging, Config, Paths};
use ledger_crypto::EncryptionManager;

/// Finance ledger command-line interface.
#[derive(Parser)]
#[command(name = "finance-ledger")]
#[command(about = "Maintenance commands for the encrypted finance ledger")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, data and logs. Defaults to ~/.finance-ledger
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Database file. Defaults to the configured path or data/transactions.db
    #[arg(long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh base64 master key for FINANCE_APP_ENCRYPTION_KEY
    GenerateKey,
    /// Run schema migrations and the encryption backfill
    Migrate {
        /// Report what would change, then roll everything back
        #[arg(long)]
        dry_run: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show encryption progress without changing the database
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::GenerateKey = cli.command {
        commands::generate_key();
        return Ok(());
    }

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;
    paths.ensure_dirs()?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(&paths, "finance-ledger", level, true);

    let database = cli.database.unwrap_or_else(|| config.database_file(&paths));
    let manager = Arc::new(EncryptionManager::from_env_or_config(
        config.encryption_key.as_deref(),
    )?);

    match cli.command {
        Commands::GenerateKey => {}
        Commands::Migrate { dry_run, json } => {
            commands::migrate(&database, manager, dry_run, json)?;
        }
        Commands::Status { json } => {
            commands::status(&database, manager, json)?;
        }
    }

    Ok(())
}
