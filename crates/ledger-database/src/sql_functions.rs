//! SQL functions exposing the encryption layer to raw queries.
//!
//! Every connection-opening path calls [`register_sql_functions`], so ad-hoc
//! SQL can filter and sort on decrypted values:
//!
//! ```sql
//! SELECT decrypt_text(name) FROM accounts WHERE name_index = search_token(?1);
//! SELECT * FROM transactions ORDER BY decrypt_numeric(amount) DESC;
//! ```
//!
//! A value that fails to decrypt inside a query yields NULL and a warning;
//! the query keeps going. Typed callers that must not silently lose a row
//! use [`require_decrypted`].

use ledger_crypto::{
    has_envelope_prefix, is_ciphertext, parse_canonical_numeric, DecryptionError, EncryptionManager,
};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DECRYPT_TEXT: &str = "decrypt_text";
pub const DECRYPT_NUMERIC: &str = "decrypt_numeric";
pub const IS_CIPHERTEXT: &str = "is_ciphertext";
pub const SEARCH_TOKEN: &str = "search_token";
pub const ENCRYPT_TEXT: &str = "encrypt_text";
pub const ENCRYPT_NUMERIC: &str = "encrypt_numeric";

/// Register the encryption functions on one connection.
pub fn register_sql_functions(
    conn: &Connection,
    manager: Arc<EncryptionManager>,
) -> rusqlite::Result<()> {
    let deterministic = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    let volatile = FunctionFlags::SQLITE_UTF8;

    let m = Arc::clone(&manager);
    conn.create_scalar_function(DECRYPT_TEXT, 1, deterministic, move |ctx| {
        Ok(decrypt_text_value(&m, ctx.get_raw(0)))
    })?;

    let m = Arc::clone(&manager);
    conn.create_scalar_function(DECRYPT_NUMERIC, 1, deterministic, move |ctx| {
        Ok(decrypt_numeric_value(&m, ctx.get_raw(0)))
    })?;

    conn.create_scalar_function(IS_CIPHERTEXT, 1, deterministic, |ctx| {
        Ok(match ctx.get_raw(0) {
            ValueRef::Text(bytes) => std::str::from_utf8(bytes).map_or(false, is_ciphertext),
            _ => false,
        })
    })?;

    let m = Arc::clone(&manager);
    conn.create_scalar_function(SEARCH_TOKEN, 1, deterministic, move |ctx| {
        let token = match ctx.get_raw(0) {
            ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|text| m.derive_search_token(text).ok())
                .map(|token| token.into_string()),
            _ => None,
        };
        Ok(token)
    })?;

    let m = Arc::clone(&manager);
    conn.create_scalar_function(ENCRYPT_TEXT, 1, volatile, move |ctx| {
        let plaintext = match ctx.get_raw(0) {
            ValueRef::Null => return Ok(None),
            ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            ValueRef::Integer(i) => i.to_string(),
            ValueRef::Real(f) => f.to_string(),
            ValueRef::Blob(_) => {
                return Err(rusqlite::Error::UserFunctionError(
                    "encrypt_text does not accept BLOB values".into(),
                ))
            }
        };
        m.encrypt_text(&plaintext)
            .map(Some)
            .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
    })?;

    conn.create_scalar_function(ENCRYPT_NUMERIC, 1, volatile, move |ctx| {
        let value = match ctx.get_raw(0) {
            ValueRef::Null => return Ok(None),
            ValueRef::Integer(i) => i as f64,
            ValueRef::Real(f) => f,
            ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
                .and_then(|text| {
                    parse_canonical_numeric(text)
                        .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
                })?,
            ValueRef::Blob(_) => {
                return Err(rusqlite::Error::UserFunctionError(
                    "encrypt_numeric does not accept BLOB values".into(),
                ))
            }
        };
        manager
            .encrypt_numeric(value)
            .map(Some)
            .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
    })?;

    debug!("Encryption SQL functions registered");
    Ok(())
}

/// `decrypt_text(x)`: envelope → plaintext, legacy values pass through.
fn decrypt_text_value(manager: &EncryptionManager, raw: ValueRef<'_>) -> Value {
    match raw {
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) if has_envelope_prefix(text) => match manager.decrypt_text(text) {
                Ok(plaintext) => Value::Text(plaintext),
                Err(e) => {
                    warn!(function = DECRYPT_TEXT, error = %e, "Value could not be decrypted");
                    Value::Null
                }
            },
            Ok(text) => Value::Text(text.to_string()),
            Err(_) => {
                warn!(function = DECRYPT_TEXT, "Stored text is not valid UTF-8");
                Value::Null
            }
        },
        other => Value::from(other),
    }
}

/// `decrypt_numeric(x)`: envelope → REAL, legacy numbers pass through.
fn decrypt_numeric_value(manager: &EncryptionManager, raw: ValueRef<'_>) -> Value {
    match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Real(i as f64),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(bytes) => {
            let Ok(text) = std::str::from_utf8(bytes) else {
                warn!(function = DECRYPT_NUMERIC, "Stored text is not valid UTF-8");
                return Value::Null;
            };
            let result = if has_envelope_prefix(text) {
                manager.decrypt_numeric(text)
            } else {
                parse_canonical_numeric(text)
            };
            match result {
                Ok(value) => Value::Real(value),
                Err(e) => {
                    warn!(function = DECRYPT_NUMERIC, error = %e, "Value could not be decrypted");
                    Value::Null
                }
            }
        }
        ValueRef::Blob(_) => {
            warn!(function = DECRYPT_NUMERIC, "BLOB in an encrypted numeric column");
            Value::Null
        }
    }
}

/// Map the UDF's NULL sentinel back to an error.
///
/// `raw_present` says whether the underlying column held a value. A NULL
/// result for a non-NULL column means decryption failed.
pub fn require_decrypted<T>(raw_present: bool, decrypted: Option<T>) -> Result<Option<T>, DecryptionError> {
    match (raw_present, decrypted) {
        (true, None) => Err(DecryptionError::Authentication),
        (_, decrypted) => Ok(decrypted),
    }
}
