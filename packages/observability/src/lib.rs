//! # Observability
//!
//! Structured logging for the finance ledger.
//!
//! Processes call [`init_with_config`] once at startup and use the standard
//! `tracing` macros everywhere else. Log lines go to an append-only JSONL file
//! (one object per line) and, optionally, to stderr in compact form.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "finance-ledger".into(),
//!     default_level: "debug".into(),
//!     log_path: Some(paths.log_file()),
//!     also_stderr: true,
//! });
//! tracing::info!("ready");
//! ```
//!
//! Field values whose names look like secrets (`key`, `plaintext`,
//! `ciphertext`, `token`, ...) are replaced with `"[REDACTED]"` before they
//! reach the file.

mod json_layer;
mod writer;

use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use json_layer::{is_sensitive_field, JsonLayer, LogEntry, REDACTED};
pub use writer::{CentralLogWriter, WriterFactory};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every log line.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// JSONL log file. `None` disables file output.
    pub log_path: Option<PathBuf>,

    /// Also emit logs to stderr for immediate feedback.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize the observability layer.
///
/// A log file that cannot be opened disables file output and is reported on
/// stderr. Calling this more than once keeps the first subscriber.
pub fn init_with_config(config: LogConfig) {
    let mut open_error = None;
    let json_layer = config.log_path.as_ref().and_then(|path| {
        match CentralLogWriter::new(path) {
            Ok(writer) => Some(
                JsonLayer::new(config.service_name.clone(), WriterFactory::new(writer))
                    .with_filter(env_filter(&config.default_level)),
            ),
            Err(e) => {
                open_error = Some(format!("{}: {}", path.display(), e));
                None
            }
        }
    });

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(&config.default_level))
    });

    let installed = tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if let Some(error) = open_error {
        eprintln!("failed to open log file {}", error);
    }
    if installed {
        tracing::debug!(
            service = %config.service_name,
            log_path = ?config.log_path,
            "observability initialized"
        );
    }
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, trace, warn};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "unknown");
        assert_eq!(config.default_level, "info");
        assert!(config.log_path.is_none());
        assert!(!config.also_stderr);
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            service_name: "test".into(),
            log_path: Some(dir.path().join("logs").join("test.jsonl")),
            ..Default::default()
        };
        init_with_config(config.clone());
        init_with_config(config);
    }
}
