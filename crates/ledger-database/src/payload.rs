//! Helpers for transaction rows handled as loose column maps.
//!
//! Import pipelines and ad-hoc scripts build rows as `column -> value` maps
//! rather than [`NewTransaction`](crate::NewTransaction). These helpers apply
//! the same encryption the typed query layer does, limited to the sensitive
//! transaction columns.

use crate::adapters::EncryptedColumn;
use crate::models::{
    TRANSACTION_ACCOUNT, TRANSACTION_AMOUNT, TRANSACTION_CATEGORY, TRANSACTION_DESCRIPTION,
    TRANSACTION_SOURCE_FILE,
};
use crate::DatabaseResult;
use ledger_crypto::{has_envelope_prefix, Envelope, EncryptionManager, FieldKind, FieldValue};
use rusqlite::types::{Value, ValueRef};
use std::collections::BTreeMap;

/// Transaction columns that are stored encrypted.
pub const SENSITIVE_TRANSACTION_FIELDS: &[&str] =
    &["description", "amount", "category", "account", "source_file"];

/// A transaction row keyed by column name.
pub type TransactionPayload = BTreeMap<String, Value>;

fn field_kind(field: &str) -> FieldKind {
    match field {
        "amount" => FieldKind::Numeric,
        _ => FieldKind::Text,
    }
}

/// Encrypt the sensitive fields of `payload` in place.
///
/// With `skip_if_encrypted`, values that already carry an envelope are left
/// alone and a malformed envelope is a decryption error. Returns the number of fields encrypted.
pub fn encrypt_transaction_payload(
    manager: &EncryptionManager,
    payload: &mut TransactionPayload,
    skip_if_encrypted: bool,
) -> DatabaseResult<usize> {
    let mut encrypted = 0;
    for field in SENSITIVE_TRANSACTION_FIELDS {
        let Some(value) = payload.get_mut(*field) else {
            continue;
        };
        if let Value::Text(text) = value {
            if skip_if_encrypted && has_envelope_prefix(text) {
                // Damaged envelopes are refused, not wrapped a second time.
                Envelope::decode(text)?;
                continue;
            }
        }

        let plain = match (field_kind(field), &*value) {
            (_, Value::Null) => continue,
            (FieldKind::Text, Value::Text(text)) => FieldValue::Text(text.clone()),
            (FieldKind::Text, Value::Integer(i)) => FieldValue::Text(i.to_string()),
            (FieldKind::Text, Value::Real(f)) => FieldValue::Text(f.to_string()),
            (FieldKind::Numeric, Value::Integer(i)) => FieldValue::Numeric(*i as f64),
            (FieldKind::Numeric, Value::Real(f)) => FieldValue::Numeric(*f),
            (FieldKind::Numeric, Value::Text(text)) => {
                FieldValue::Numeric(ledger_crypto::parse_canonical_numeric(text)?)
            }
            (_, Value::Blob(_)) => {
                return Err(crate::DatabaseError::InvalidData(format!(
                    "field {} holds a BLOB",
                    field
                )))
            }
        };

        *value = Value::Text(manager.encrypt_value(&plain)?);
        encrypted += 1;
    }
    Ok(encrypted)
}

/// Decrypt the sensitive fields of a row read with raw SQL.
///
/// Text fields become `Value::Text`, `amount` becomes `Value::Real`. Legacy
/// plaintext is accepted; a value that fails to decrypt is an error.
pub fn decrypt_transaction_row(
    manager: &EncryptionManager,
    row: &mut TransactionPayload,
) -> DatabaseResult<()> {
    for field in SENSITIVE_TRANSACTION_FIELDS {
        let Some(value) = row.get_mut(*field) else {
            continue;
        };
        let raw = ValueRef::from(&*value);
        let decrypted = match *field {
            "amount" => TRANSACTION_AMOUNT
                .result_optional(manager, raw)?
                .map(Value::Real),
            "description" => TRANSACTION_DESCRIPTION
                .result_optional(manager, raw)?
                .map(Value::Text),
            "category" => TRANSACTION_CATEGORY
                .result_optional(manager, raw)?
                .map(Value::Text),
            "account" => TRANSACTION_ACCOUNT
                .result_optional(manager, raw)?
                .map(Value::Text),
            _ => TRANSACTION_SOURCE_FILE
                .result_optional(manager, raw)?
                .map(Value::Text),
        };
        *value = decrypted.unwrap_or(Value::Null);
    }
    Ok(())
}
