//! Error taxonomy for field encryption.
//!
//! `EncryptionError` is the base type. Key loading failures are
//! `EncryptionKeyError` (fatal at startup) and per-value read failures are
//! `DecryptionError`. Messages never include key bytes, plaintext or
//! ciphertext.

use thiserror::Error;

/// Failure to load or validate the master key.
#[derive(Error, Debug)]
pub enum EncryptionKeyError {
    /// No key was provided by the environment or the config file.
    #[error("Encryption key not found. Provide {env_var} or set encryption_key in the config file")]
    Missing { env_var: String },

    /// The key is not valid base64.
    #[error("Encryption key from {source_name} is not valid base64")]
    InvalidEncoding {
        source_name: String,
        #[source]
        source: base64::DecodeError,
    },

    /// The key decoded to the wrong number of bytes.
    #[error("Invalid encryption key length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Subkey derivation failed.
    #[error("Failed to derive {purpose} key")]
    Derivation { purpose: &'static str },
}

/// Failure to turn a stored envelope back into plaintext.
#[derive(Error, Debug)]
pub enum DecryptionError {
    /// The value does not have the envelope shape.
    #[error("Malformed ciphertext envelope: {0}")]
    Malformed(String),

    /// The envelope was produced by an algorithm this build cannot read.
    #[error("Unsupported ciphertext envelope version {0}")]
    UnsupportedVersion(u8),

    /// Tag verification failed (wrong key or tampered data).
    #[error("Ciphertext authentication failed")]
    Authentication,

    /// The decrypted bytes are not valid for the requested field kind.
    #[error("Decrypted value has unexpected format: {0}")]
    InvalidPlaintext(String),
}

/// Base error for every encryption-layer failure.
#[derive(Error, Debug)]
pub enum EncryptionError {
    /// Key material problem.
    #[error(transparent)]
    Key(#[from] EncryptionKeyError),

    /// Decryption problem.
    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    /// The AEAD refused to encrypt.
    #[error("Encryption failed")]
    Encrypt,

    /// The value cannot be encrypted as the requested kind.
    #[error("Invalid value for encryption: {0}")]
    InvalidValue(String),

    /// Search tokens are never derived from empty input.
    #[error("Cannot derive a search token from an empty value")]
    EmptySearchInput,
}

/// Result type alias using EncryptionError.
pub type EncryptionResult<T> = Result<T, EncryptionError>;
