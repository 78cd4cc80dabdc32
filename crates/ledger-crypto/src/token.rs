//! Deterministic search tokens for equality lookups on encrypted fields.
//!
//! `token = base64url_nopad(HMAC-SHA256(token_key, normalize(plaintext)))`
//!
//! The token key is derived separately from the field encryption key.
//! Rotating it means recomputing every stored token.

use crate::{EncryptionError, EncryptionResult, MasterKey, KEY_SIZE};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Encoded token length (32 digest bytes, base64url without padding).
pub const SEARCH_TOKEN_LEN: usize = 43;

/// Stored value of a shadow index column such as `accounts.name_index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchToken(String);

impl SearchToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SearchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SearchToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Trim and case-fold. Two inputs that normalize equal share a token.
pub fn normalize(plaintext: &str) -> String {
    plaintext.trim().to_lowercase()
}

/// Keyed one-way token derivation.
#[derive(Clone)]
pub struct SearchTokenDeriver {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl SearchTokenDeriver {
    /// Build a deriver from the master key's token subkey.
    pub fn new(master: &MasterKey) -> EncryptionResult<Self> {
        Ok(Self {
            key: master.token_key()?,
        })
    }

    /// Derive the token for `plaintext`.
    ///
    /// Empty and whitespace-only input is rejected: an empty token would
    /// defeat the uniqueness index.
    pub fn derive_search_token(&self, plaintext: &str) -> EncryptionResult<SearchToken> {
        let normalized = normalize(plaintext);
        if normalized.is_empty() {
            return Err(EncryptionError::EmptySearchInput);
        }

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key[..])
            .map_err(|_| EncryptionError::InvalidValue("invalid token key".to_string()))?;
        mac.update(normalized.as_bytes());
        let digest = mac.finalize().into_bytes();

        Ok(SearchToken(URL_SAFE_NO_PAD.encode(digest)))
    }
}

impl fmt::Debug for SearchTokenDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SearchTokenDeriver([redacted])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deriver() -> SearchTokenDeriver {
        SearchTokenDeriver::new(&MasterKey::from_bytes([11u8; KEY_SIZE])).unwrap()
    }

    #[test]
    fn test_normalization_makes_tokens_equal() {
        let deriver = deriver();
        let a = deriver.derive_search_token(" Chase ").unwrap();
        let b = deriver.derive_search_token("chase").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_names_differ() {
        let deriver = deriver();
        let chase = deriver.derive_search_token("Chase").unwrap();
        let wells = deriver.derive_search_token("Wells Fargo").unwrap();
        assert_ne!(chase, wells);
    }

    #[test]
    fn test_fixed_length_and_no_plaintext() {
        let deriver = deriver();
        for name in ["a", "Chase Checking", "x".repeat(500).as_str()] {
            let token = deriver.derive_search_token(name).unwrap();
            assert_eq!(token.as_str().len(), SEARCH_TOKEN_LEN);
            assert!(!token.as_str().to_lowercase().contains("chase"));
        }
    }

    #[test]
    fn test_empty_input_rejected() {
        let deriver = deriver();
        assert!(matches!(
            deriver.derive_search_token(""),
            Err(EncryptionError::EmptySearchInput)
        ));
        assert!(matches!(
            deriver.derive_search_token("   \t"),
            Err(EncryptionError::EmptySearchInput)
        ));
    }

    #[test]
    fn test_token_depends_on_key() {
        let other = SearchTokenDeriver::new(&MasterKey::from_bytes([12u8; KEY_SIZE])).unwrap();
        assert_ne!(
            deriver().derive_search_token("Savings").unwrap(),
            other.derive_search_token("Savings").unwrap()
        );
    }

    #[test]
    fn test_token_is_stable_across_instances() {
        let a = deriver().derive_search_token("Checking").unwrap();
        let b = deriver().derive_search_token("checking ").unwrap();
        assert_eq!(a, b);
    }
}
