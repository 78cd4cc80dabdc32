//! Key & cipher manager: the only code that touches the AEAD.
//!
//! Construct one `EncryptionManager` at startup and share it as
//! `Arc<EncryptionManager>`. Encryption and decryption take `&self`; nonces
//! come from the thread-local CSPRNG on every call, so concurrent use from
//! many threads needs no locking.

use crate::envelope::{self, Envelope, NONCE_SIZE, SUPPORTED_VERSIONS, VERSION_CHACHA20_POLY1305};
use crate::numeric;
use crate::{
    DecryptionError, EncryptionError, EncryptionResult, MasterKey, SearchToken,
    SearchTokenDeriver,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use std::fmt;
use tracing::debug;

/// Logical type of an encrypted column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Numeric,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Numeric => "numeric",
        }
    }
}

/// A plaintext value on its way into or out of an encrypted column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Numeric(f64),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Text(_) => FieldKind::Text,
            Self::Numeric(_) => FieldKind::Numeric,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::Numeric(_) => None,
        }
    }

    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Self::Numeric(value) => Some(*value),
            Self::Text(_) => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Numeric(value)
    }
}

/// Owner of the field cipher and the search-token deriver.
pub struct EncryptionManager {
    cipher: ChaCha20Poly1305,
    tokens: SearchTokenDeriver,
}

impl EncryptionManager {
    /// Build a manager from a loaded master key.
    pub fn new(master: &MasterKey) -> EncryptionResult<Self> {
        let field_key = master.field_key()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&field_key[..]));
        let tokens = SearchTokenDeriver::new(master)?;
        debug!(version = VERSION_CHACHA20_POLY1305, "Field encryption initialized");
        Ok(Self { cipher, tokens })
    }

    /// Build a manager from `FINANCE_APP_ENCRYPTION_KEY`, falling back to a
    /// config-file key.
    pub fn from_env_or_config(config_key: Option<&str>) -> EncryptionResult<Self> {
        let master = MasterKey::resolve(crate::ENV_KEY_NAME, config_key)?;
        Self::new(&master)
    }

    /// Encrypt a value and return the packed envelope string.
    pub fn encrypt_value(&self, value: &FieldValue) -> EncryptionResult<String> {
        match value {
            FieldValue::Text(text) => self.seal(text.as_bytes()),
            FieldValue::Numeric(number) => {
                let canonical = numeric::canonicalize(*number)?;
                self.seal(canonical.as_bytes())
            }
        }
    }

    /// Decrypt an envelope into a value of the requested kind.
    pub fn decrypt_value(
        &self,
        envelope: &str,
        kind: FieldKind,
    ) -> Result<FieldValue, DecryptionError> {
        match kind {
            FieldKind::Text => self.decrypt_text(envelope).map(FieldValue::Text),
            FieldKind::Numeric => self.decrypt_numeric(envelope).map(FieldValue::Numeric),
        }
    }

    pub fn encrypt_text(&self, text: &str) -> EncryptionResult<String> {
        self.seal(text.as_bytes())
    }

    pub fn encrypt_numeric(&self, value: f64) -> EncryptionResult<String> {
        self.encrypt_value(&FieldValue::Numeric(value))
    }

    pub fn decrypt_text(&self, envelope: &str) -> Result<String, DecryptionError> {
        let bytes = self.open(envelope)?;
        String::from_utf8(bytes)
            .map_err(|_| DecryptionError::InvalidPlaintext("not valid UTF-8".to_string()))
    }

    pub fn decrypt_numeric(&self, envelope: &str) -> Result<f64, DecryptionError> {
        let text = self.decrypt_text(envelope)?;
        numeric::parse_canonical(&text)
    }

    /// Structural envelope check; see [`envelope::is_ciphertext`].
    pub fn is_ciphertext(&self, value: &str) -> bool {
        envelope::is_ciphertext(value)
    }

    /// Derive the equality-search token for `plaintext`.
    pub fn derive_search_token(&self, plaintext: &str) -> EncryptionResult<SearchToken> {
        self.tokens.derive_search_token(plaintext)
    }

    /// The token deriver, for callers that only need tokens.
    pub fn token_deriver(&self) -> &SearchTokenDeriver {
        &self.tokens
    }

    fn seal(&self, plaintext: &[u8]) -> EncryptionResult<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let aad = [VERSION_CHACHA20_POLY1305];
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| EncryptionError::Encrypt)?;

        Ok(Envelope {
            version: VERSION_CHACHA20_POLY1305,
            nonce,
            sealed,
        }
        .encode())
    }

    fn open(&self, value: &str) -> Result<Vec<u8>, DecryptionError> {
        let envelope = Envelope::decode(value)?;
        if !SUPPORTED_VERSIONS.contains(&envelope.version) {
            return Err(DecryptionError::UnsupportedVersion(envelope.version));
        }

        let aad = [envelope.version];
        self.cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                Payload {
                    msg: &envelope.sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| DecryptionError::Authentication)
    }
}

impl fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("version", &VERSION_CHACHA20_POLY1305)
            .finish_non_exhaustive()
    }
}
