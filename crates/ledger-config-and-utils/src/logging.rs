//! Logging initialization for the ledger.
//!
//! Thin wrapper over the observability crate. Every ledger process writes
//! structured JSONL to `~/.finance-ledger/logs/ledger.jsonl`.

use crate::Paths;
use observability::LogConfig;

/// Initialize the logging system.
///
/// This sets up tracing with:
/// - Structured JSONL output to the ledger log file
/// - Log level from RUST_LOG env var or the provided default
/// - Compact stderr output when `also_stderr` is set
///
/// ```ignore
/// init_logging(&paths, "finance-ledger", "info", true);
/// tracing::info!("Ledger started");
/// ```
pub fn init_logging(paths: &Paths, service_name: &str, level: &str, also_stderr: bool) {
    observability::init_with_config(LogConfig {
        service_name: service_name.into(),
        default_level: parse_level(level).to_string().to_lowercase(),
        log_path: Some(paths.log_file()),
        also_stderr,
    });
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
