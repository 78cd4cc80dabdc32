//! Database model types.
//!
//! Sensitive fields hold plaintext here; the query layer encrypts them on
//! write and decrypts them on read. The column constants at the bottom are
//! the adapters used for each encrypted column.

use crate::adapters::{EncryptedNumeric, EncryptedString};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Bank,
    Credit,
    Investment,
    Savings,
    Cash,
    Other,
}

impl Default for AccountType {
    fn default() -> Self {
        Self::Bank
    }
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bank => "bank",
            Self::Credit => "credit",
            Self::Investment => "investment",
            Self::Savings => "savings",
            Self::Cash => "cash",
            Self::Other => "other",
        }
    }

    /// Legacy rows store the enum name in upper case (`BANK`).
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "bank" => Self::Bank,
            "credit" => Self::Credit,
            "investment" => Self::Investment,
            "savings" => Self::Savings,
            "cash" => Self::Cash,
            _ => Self::Other,
        }
    }
}

/// Account record. `name` is unique by its normalized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub account_type: AccountType,
    pub balance: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating an account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub account_type: AccountType,
    pub balance: f64,
}

/// Imported transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub description: String,
    pub amount: f64,
    pub category: Option<String>,
    /// Legacy free-text account label from CSV imports.
    pub account: Option<String>,
    pub account_id: Option<i64>,
    pub source_file: String,
    pub import_timestamp: DateTime<Utc>,
    pub duplicate_hash: String,
    pub is_transfer: bool,
    pub transfer_to_account_id: Option<i64>,
}

/// Parameters for inserting a transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub date: DateTime<Utc>,
    pub description: String,
    pub amount: f64,
    pub category: Option<String>,
    pub account: Option<String>,
    pub account_id: Option<i64>,
    pub source_file: String,
    pub duplicate_hash: String,
    pub is_transfer: bool,
    pub transfer_to_account_id: Option<i64>,
}

/// Budget allocation for a category over a period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub id: i64,
    pub category: String,
    pub allocated_amount: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a budget.
#[derive(Debug, Clone)]
pub struct NewBudget {
    pub category: String,
    pub allocated_amount: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Point-in-time account balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceHistory {
    pub id: i64,
    pub account_id: i64,
    pub balance: f64,
    pub timestamp: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Manual balance for an account on a given date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceOverride {
    pub id: i64,
    pub account_id: i64,
    pub override_date: NaiveDate,
    pub override_balance: f64,
    pub created_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Manual income figure for a month.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomeOverride {
    pub id: i64,
    /// First day of the month the override applies to.
    pub month: NaiveDate,
    pub override_amount: f64,
    pub created_at: DateTime<Utc>,
}

// Encrypted column adapters. Limits are plaintext characters.
pub const ACCOUNT_NAME: EncryptedString = EncryptedString::new(100);
pub const ACCOUNT_BALANCE: EncryptedNumeric = EncryptedNumeric::new();
pub const TRANSACTION_DESCRIPTION: EncryptedString = EncryptedString::new(500);
pub const TRANSACTION_AMOUNT: EncryptedNumeric = EncryptedNumeric::new();
pub const TRANSACTION_CATEGORY: EncryptedString = EncryptedString::new(100);
pub const TRANSACTION_ACCOUNT: EncryptedString = EncryptedString::new(100);
pub const TRANSACTION_SOURCE_FILE: EncryptedString = EncryptedString::new(255);
pub const BUDGET_CATEGORY: EncryptedString = EncryptedString::new(100);
pub const BUDGET_ALLOCATED_AMOUNT: EncryptedNumeric = EncryptedNumeric::new();
pub const BALANCE_HISTORY_BALANCE: EncryptedNumeric = EncryptedNumeric::new();
pub const BALANCE_OVERRIDE_BALANCE: EncryptedNumeric = EncryptedNumeric::new();
pub const INCOME_OVERRIDE_AMOUNT: EncryptedNumeric = EncryptedNumeric::new();

/// Parse a stored timestamp into UTC.
///
/// Accepts RFC 3339, the `YYYY-MM-DD HH:MM:SS[.f][+HH:MM]` form written by
/// earlier releases, and bare dates. Values without an offset are UTC.
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Canonical stored form of a timestamp.
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}
