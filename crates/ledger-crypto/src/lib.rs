//! Field-level encryption primitives for the finance ledger.
//!
//! This crate provides:
//! - The ciphertext envelope stored in encrypted TEXT columns
//! - Master key loading and HKDF subkey derivation
//! - `EncryptionManager`: ChaCha20-Poly1305 encrypt/decrypt of text and numbers
//! - `SearchTokenDeriver`: HMAC-SHA256 tokens for equality search
//!
//! ```ignore
//! let manager = Arc::new(EncryptionManager::from_env_or_config(config.encryption_key.as_deref())?);
//! let stored = manager.encrypt_text("Chase Checking")?;
//! assert_eq!(manager.decrypt_text(&stored)?, "Chase Checking");
//! ```

mod envelope;
mod error;
mod key;
mod manager;
mod numeric;
mod token;

pub use envelope::{
    encoded_len, has_envelope_prefix, is_ciphertext, Envelope, ENVELOPE_PREFIX, NONCE_SIZE, TAG_SIZE,
    VERSION_CHACHA20_POLY1305,
};
pub use error::{DecryptionError, EncryptionError, EncryptionKeyError, EncryptionResult};
pub use key::{MasterKey, ENV_KEY_NAME, KEY_SIZE};
pub use manager::{EncryptionManager, FieldKind, FieldValue};
pub use numeric::{canonicalize as canonicalize_numeric, parse_canonical as parse_canonical_numeric};
pub use token::{normalize as normalize_search_input, SearchToken, SearchTokenDeriver, SEARCH_TOKEN_LEN};
