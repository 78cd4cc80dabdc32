//! Master key loading and subkey derivation.
//!
//! Resolution order:
//! 1. `FINANCE_APP_ENCRYPTION_KEY` environment variable
//! 2. `encryption_key` from the config file
//!
//! A missing or malformed key is fatal. Two independent subkeys are derived
//! from the master key with HKDF-SHA256:
//! - field encryption key (info `finance-ledger-field-encryption-v1`)
//! - search token key (info `finance-ledger-search-token-v1`)

use crate::EncryptionKeyError;
use base64::{engine::general_purpose::STANDARD, engine::general_purpose::STANDARD_NO_PAD, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

/// Environment variable holding the base64 master key.
pub const ENV_KEY_NAME: &str = "FINANCE_APP_ENCRYPTION_KEY";

/// Master key size (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

const HKDF_SALT: &[u8] = b"finance-ledger";
const FIELD_KEY_INFO: &[u8] = b"finance-ledger-field-encryption-v1";
const TOKEN_KEY_INFO: &[u8] = b"finance-ledger-search-token-v1";

/// 32-byte master key. Zeroized on drop; never printed.
#[derive(Clone)]
pub struct MasterKey {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
}

impl MasterKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Generate a random master key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Decode a base64 key. Standard and URL-safe alphabets are accepted,
    /// with or without padding.
    pub fn from_encoded(encoded: &str, source_name: &str) -> Result<Self, EncryptionKeyError> {
        let normalized: String = encoded
            .trim()
            .trim_end_matches('=')
            .chars()
            .map(|c| match c {
                '-' => '+',
                '_' => '/',
                other => other,
            })
            .collect();

        let decoded = Zeroizing::new(STANDARD_NO_PAD.decode(normalized.as_bytes()).map_err(
            |source| EncryptionKeyError::InvalidEncoding {
                source_name: source_name.to_string(),
                source,
            },
        )?);

        if decoded.len() != KEY_SIZE {
            return Err(EncryptionKeyError::InvalidLength {
                expected: KEY_SIZE,
                actual: decoded.len(),
            });
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded[..]);
        Ok(Self::from_bytes(bytes))
    }

    /// Load from `FINANCE_APP_ENCRYPTION_KEY`.
    pub fn from_env() -> Result<Self, EncryptionKeyError> {
        Self::from_env_var(ENV_KEY_NAME)
    }

    /// Load from the named environment variable.
    pub fn from_env_var(env_var: &str) -> Result<Self, EncryptionKeyError> {
        Self::resolve(env_var, None)
    }

    /// Load from the environment, falling back to a config-file value.
    ///
    /// A present-but-invalid environment value is an error; it does not fall
    /// through to the config file.
    pub fn resolve(env_var: &str, config_value: Option<&str>) -> Result<Self, EncryptionKeyError> {
        if let Some(raw) = std::env::var(env_var).ok().filter(|v| !v.trim().is_empty()) {
            return Self::from_encoded(&raw, "environment");
        }

        match config_value.filter(|v| !v.trim().is_empty()) {
            Some(raw) => Self::from_encoded(raw, "config file"),
            None => Err(EncryptionKeyError::Missing {
                env_var: env_var.to_string(),
            }),
        }
    }

    /// Standard base64 form, suitable for `FINANCE_APP_ENCRYPTION_KEY`.
    pub fn to_encoded(&self) -> String {
        STANDARD.encode(&self.bytes[..])
    }

    pub(crate) fn field_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>, EncryptionKeyError> {
        self.derive(FIELD_KEY_INFO, "field encryption")
    }

    pub(crate) fn token_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>, EncryptionKeyError> {
        self.derive(TOKEN_KEY_INFO, "search token")
    }

    fn derive(
        &self,
        info: &[u8],
        purpose: &'static str,
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>, EncryptionKeyError> {
        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), &self.bytes[..]);
        let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf.expand(info, &mut okm[..])
            .map_err(|_| EncryptionKeyError::Derivation { purpose })?;
        Ok(okm)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([redacted])")
    }
}
