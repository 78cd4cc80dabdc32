//! Database error types.

use ledger_crypto::{DecryptionError, EncryptionError, EncryptionKeyError};
use thiserror::Error;

/// Message shown to end users when an encrypted record cannot be read.
pub const UNREADABLE_RECORD_MESSAGE: &str = "Could not read this record.";

/// Database error type.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    /// Connection pool error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// A value could not be encrypted or a search token derived
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    /// A stored value could not be decrypted
    #[error("Decryption error: {0}")]
    Decryption(#[from] DecryptionError),

    /// Account names whose search tokens collide; backfill refused to continue
    #[error("Duplicate account names: {} group(s) of accounts share a normalized name", groups.len())]
    DuplicateAccountNames { groups: Vec<Vec<i64>> },

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl DatabaseError {
    /// Text safe to show to an end user.
    ///
    /// Encryption failures collapse to a generic message so key material,
    /// ciphertext and internal detail never reach the UI.
    pub fn user_message(&self) -> String {
        match self {
            Self::Decryption(_) | Self::Encryption(_) => UNREADABLE_RECORD_MESSAGE.to_string(),
            Self::DuplicateAccountNames { .. } => {
                "Two or more accounts share the same name.".to_string()
            }
            Self::NotFound(what) => format!("Not found: {}", what),
            Self::InvalidData(reason) => format!("Invalid data: {}", reason),
            _ => "A database error occurred.".to_string(),
        }
    }

    /// True for failures caused by encrypted data rather than SQLite itself.
    pub fn is_decryption(&self) -> bool {
        matches!(self, Self::Decryption(_))
    }
}

/// SQLite errors that carry a decryption failure from row mapping are
/// surfaced as `Decryption`, everything else stays `Sqlite`.
impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::FromSqlConversionFailure(idx, ty, source) => {
                match source.downcast::<DecryptionError>() {
                    Ok(decryption) => Self::Decryption(*decryption),
                    Err(source) => {
                        Self::Sqlite(rusqlite::Error::FromSqlConversionFailure(idx, ty, source))
                    }
                }
            }
            other => Self::Sqlite(other),
        }
    }
}

impl From<EncryptionKeyError> for DatabaseError {
    fn from(err: EncryptionKeyError) -> Self {
        Self::Encryption(EncryptionError::Key(err))
    }
}

/// Result type alias using DatabaseError.
pub type DatabaseResult<T> = Result<T, DatabaseError>;
