//! Ciphertext envelope stored in every encrypted column.
//!
//! # Format
//!
//! ```text
//! enc:<base64url-no-pad(version || nonce || ciphertext || tag)>
//! ```
//!
//! - `version`: 1 byte, algorithm identifier
//! - `nonce`: 12 bytes, random per encryption
//! - `ciphertext`: same length as the plaintext
//! - `tag`: 16-byte Poly1305 tag
//!
//! The whole envelope is printable ASCII so it fits unmodified into
//! existing TEXT columns.

use crate::DecryptionError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

/// Marker that prefixes every stored envelope.
pub const ENVELOPE_PREFIX: &str = "enc:";

/// ChaCha20-Poly1305 with an HKDF-derived field key.
pub const VERSION_CHACHA20_POLY1305: u8 = 1;

/// Envelope versions this build can decrypt.
pub const SUPPORTED_VERSIONS: &[u8] = &[VERSION_CHACHA20_POLY1305];

/// Nonce size for ChaCha20-Poly1305 (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// Smallest decoded envelope: version + nonce + tag (empty plaintext).
pub const MIN_ENVELOPE_BYTES: usize = 1 + NONCE_SIZE + TAG_SIZE;

/// A parsed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with the tag appended, as produced by the AEAD.
    pub sealed: Vec<u8>,
}

impl Envelope {
    /// Pack into the printable on-disk representation.
    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(1 + NONCE_SIZE + self.sealed.len());
        raw.push(self.version);
        raw.extend_from_slice(&self.nonce);
        raw.extend_from_slice(&self.sealed);
        format!("{}{}", ENVELOPE_PREFIX, URL_SAFE_NO_PAD.encode(raw))
    }

    /// Parse the on-disk representation.
    ///
    /// Only the shape is checked here. Version support and authentication
    /// are checked by the cipher.
    pub fn decode(value: &str) -> Result<Self, DecryptionError> {
        let body = value
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| DecryptionError::Malformed("missing envelope prefix".to_string()))?;

        let raw = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| DecryptionError::Malformed(format!("invalid base64: {e}")))?;

        if raw.len() < MIN_ENVELOPE_BYTES {
            return Err(DecryptionError::Malformed(format!(
                "envelope too short: expected at least {} bytes, got {}",
                MIN_ENVELOPE_BYTES,
                raw.len()
            )));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&raw[1..1 + NONCE_SIZE]);

        Ok(Self {
            version: raw[0],
            nonce,
            sealed: raw[1 + NONCE_SIZE..].to_vec(),
        })
    }

    /// Ciphertext bytes without the tag.
    pub fn ciphertext(&self) -> &[u8] {
        &self.sealed[..self.sealed.len() - TAG_SIZE]
    }

    /// Authentication tag bytes.
    pub fn tag(&self) -> &[u8] {
        &self.sealed[self.sealed.len() - TAG_SIZE..]
    }
}

/// Structural check: does `value` look like a stored envelope?
///
/// Never attempts a decrypt, so it is safe to call on legacy plaintext.
/// Unknown versions still count as ciphertext so they are never encrypted
/// a second time.
pub fn is_ciphertext(value: &str) -> bool {
    Envelope::decode(value).is_ok()
}

/// Does `value` claim to be an envelope?
///
/// Readers decide between decrypting and legacy plaintext with this, not
/// with [`is_ciphertext`]: a prefixed value that fails to parse is a damaged
/// envelope and must fail to decrypt rather than pass through.
pub fn has_envelope_prefix(value: &str) -> bool {
    value.starts_with(ENVELOPE_PREFIX)
}

/// Length of the stored envelope for a plaintext of `plaintext_bytes` bytes.
pub fn encoded_len(plaintext_bytes: usize) -> usize {
    let raw = MIN_ENVELOPE_BYTES + plaintext_bytes;
    ENVELOPE_PREFIX.len() + (raw * 4).div_ceil(3)
}
