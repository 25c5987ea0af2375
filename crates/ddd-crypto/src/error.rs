//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key file or envelope does not have the expected shape
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Public key is not a valid curve point or is low order
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Session establishment failed
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    /// Ciphertext belongs to a chain step that was already consumed
    #[error("duplicate message: chain step {counter} already consumed")]
    DuplicateMessage {
        /// Message number within its chain
        counter: u64,
    },

    /// Ciphertext is older than the oldest retained chain state
    #[error("legacy message: {0}")]
    LegacyMessage(String),

    /// Ciphertext is malformed or failed authentication
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Signature over a payload chunk did not verify
    #[error("signature verification failed")]
    SignatureVerificationFailure,

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Key derivation failed
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Session record could not be encoded or decoded
    #[error("session record: {0}")]
    SessionRecord(String),
}

impl CryptoError {
    /// Whether the error means "this message was already seen or is too old"
    /// rather than "this message is forged or corrupt".
    #[must_use]
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::DuplicateMessage { .. } | Self::LegacyMessage(_))
    }
}
