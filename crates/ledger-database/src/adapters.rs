//! Column type adapters for encrypted fields.
//!
//! An adapter knows how one logical column is stored: it encrypts on bind
//! and decrypts when a row is read. Both adapters accept legacy plaintext on
//! read so a database that has not finished its backfill stays readable.
//! Anything carrying the envelope prefix is decrypted, so a damaged envelope
//! is an error rather than plaintext.
//!
//! ```ignore
//! let stored = ACCOUNT_NAME.bind(&manager, &"Chase Checking".to_string())?;
//! let name = ACCOUNT_NAME.result(&manager, row.get_ref(1)?)?;
//! ```

use crate::sql_functions::{DECRYPT_NUMERIC, DECRYPT_TEXT};
use crate::DatabaseResult;
use ledger_crypto::{
    encoded_len, has_envelope_prefix, DecryptionError, EncryptionError, EncryptionManager, FieldKind,
};
use rusqlite::types::ValueRef;
use rusqlite::Row;

/// Encode/decode hooks for one encrypted column.
pub trait EncryptedColumn {
    /// Plaintext value type seen by callers.
    type Value;

    /// Logical kind of the stored plaintext.
    const KIND: FieldKind;

    /// Encrypt a value for storage.
    fn bind(&self, manager: &EncryptionManager, value: &Self::Value) -> DatabaseResult<String>;

    /// Decrypt a stored value, accepting legacy plaintext.
    fn result(
        &self,
        manager: &EncryptionManager,
        raw: ValueRef<'_>,
    ) -> Result<Self::Value, DecryptionError>;

    /// Width of the stored envelope for the largest allowed plaintext.
    fn storage_length(&self) -> usize;

    /// Encrypt an optional value. `None` is stored as NULL.
    fn bind_optional(
        &self,
        manager: &EncryptionManager,
        value: Option<&Self::Value>,
    ) -> DatabaseResult<Option<String>> {
        value.map(|v| self.bind(manager, v)).transpose()
    }

    /// Decrypt a nullable column. NULL reads as `None`.
    fn result_optional(
        &self,
        manager: &EncryptionManager,
        raw: ValueRef<'_>,
    ) -> Result<Option<Self::Value>, DecryptionError> {
        match raw {
            ValueRef::Null => Ok(None),
            other => self.result(manager, other).map(Some),
        }
    }

    /// Name of the SQL function that decrypts this column.
    fn decrypt_function(&self) -> &'static str {
        match Self::KIND {
            FieldKind::Text => DECRYPT_TEXT,
            FieldKind::Numeric => DECRYPT_NUMERIC,
        }
    }

    /// SQL expression yielding the decrypted value of `column`.
    fn select_expr(&self, column: &str) -> String {
        format!("{}({})", self.decrypt_function(), column)
    }
}

/// Encrypted text column with a plaintext length limit in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptedString {
    max_length: usize,
}

impl EncryptedString {
    pub const fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl EncryptedColumn for EncryptedString {
    type Value = String;
    const KIND: FieldKind = FieldKind::Text;

    fn bind(&self, manager: &EncryptionManager, value: &String) -> DatabaseResult<String> {
        let chars = value.chars().count();
        if chars > self.max_length {
            return Err(EncryptionError::InvalidValue(format!(
                "value is {} characters, limit is {}",
                chars, self.max_length
            ))
            .into());
        }
        Ok(manager.encrypt_text(value)?)
    }

    fn result(
        &self,
        manager: &EncryptionManager,
        raw: ValueRef<'_>,
    ) -> Result<String, DecryptionError> {
        match raw {
            ValueRef::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    DecryptionError::InvalidPlaintext("stored text is not valid UTF-8".to_string())
                })?;
                if has_envelope_prefix(text) {
                    manager.decrypt_text(text)
                } else {
                    Ok(text.to_string())
                }
            }
            ValueRef::Integer(i) => Ok(i.to_string()),
            ValueRef::Real(f) => Ok(f.to_string()),
            ValueRef::Null => Err(DecryptionError::Malformed(
                "NULL in a non-nullable encrypted column".to_string(),
            )),
            ValueRef::Blob(_) => Err(DecryptionError::Malformed(
                "BLOB in an encrypted text column".to_string(),
            )),
        }
    }

    fn storage_length(&self) -> usize {
        // Worst case four UTF-8 bytes per character.
        encoded_len(self.max_length * 4)
    }
}

/// Encrypted numeric column. Stored as an envelope around the canonical
/// decimal string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncryptedNumeric;

impl EncryptedNumeric {
    pub const fn new() -> Self {
        Self
    }
}

/// Longest canonical decimal an f64 can produce.
const MAX_NUMERIC_CHARS: usize = 330;

impl EncryptedColumn for EncryptedNumeric {
    type Value = f64;
    const KIND: FieldKind = FieldKind::Numeric;

    fn bind(&self, manager: &EncryptionManager, value: &f64) -> DatabaseResult<String> {
        Ok(manager.encrypt_numeric(*value)?)
    }

    fn result(&self, manager: &EncryptionManager, raw: ValueRef<'_>) -> Result<f64, DecryptionError> {
        match raw {
            ValueRef::Real(f) => Ok(f),
            ValueRef::Integer(i) => Ok(i as f64),
            ValueRef::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    DecryptionError::InvalidPlaintext("stored text is not valid UTF-8".to_string())
                })?;
                if has_envelope_prefix(text) {
                    manager.decrypt_numeric(text)
                } else {
                    ledger_crypto::parse_canonical_numeric(text)
                }
            }
            ValueRef::Null => Err(DecryptionError::Malformed(
                "NULL in a non-nullable encrypted column".to_string(),
            )),
            ValueRef::Blob(_) => Err(DecryptionError::Malformed(
                "BLOB in an encrypted numeric column".to_string(),
            )),
        }
    }

    fn storage_length(&self) -> usize {
        encoded_len(MAX_NUMERIC_CHARS)
    }
}

/// Read and decrypt column `idx` of `row`.
///
/// Decryption failures are carried as `FromSqlConversionFailure` so they can
/// cross rusqlite's row-mapping closures; `DatabaseError::from` unwraps them
/// back into `DatabaseError::Decryption`.
pub fn column<C: EncryptedColumn>(
    row: &Row<'_>,
    idx: usize,
    adapter: &C,
    manager: &EncryptionManager,
) -> rusqlite::Result<C::Value> {
    let raw = row.get_ref(idx)?;
    let ty = raw.data_type();
    adapter
        .result(manager, raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e)))
}

/// Nullable variant of [`column`].
pub fn optional_column<C: EncryptedColumn>(
    row: &Row<'_>,
    idx: usize,
    adapter: &C,
    manager: &EncryptionManager,
) -> rusqlite::Result<Option<C::Value>> {
    let raw = row.get_ref(idx)?;
    let ty = raw.data_type();
    adapter
        .result_optional(manager, raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e)))
}
