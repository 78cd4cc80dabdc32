//! Fixed-point canonical form for encrypted numeric values.
//!
//! Numbers are encrypted as decimal strings, never as binary floats, so a
//! value read back is bit-for-bit the value written. Rust's `Display` for
//! `f64` prints the shortest digit string that parses back to the same
//! value and never switches to exponent notation.

use crate::{DecryptionError, EncryptionError};

/// Canonical decimal string for `value`.
pub fn canonicalize(value: f64) -> Result<String, EncryptionError> {
    if !value.is_finite() {
        return Err(EncryptionError::InvalidValue(
            "numeric value must be finite".to_string(),
        ));
    }
    // -0.0 and 0.0 share one canonical form.
    let value = if value == 0.0 { 0.0 } else { value };
    Ok(format!("{}", value))
}

/// Parse a canonical decimal string back to a number.
pub fn parse_canonical(text: &str) -> Result<f64, DecryptionError> {
    let trimmed = text.trim();
    let value: f64 = trimmed
        .parse()
        .map_err(|_| DecryptionError::InvalidPlaintext("expected a decimal number".to_string()))?;
    if !value.is_finite() {
        return Err(DecryptionError::InvalidPlaintext(
            "decrypted number is not finite".to_string(),
        ));
    }
    Ok(value)
}
