//! Bundle identifier encryption.
//!
//! Bundle ids carry a counter, so a transport that could read them would
//! learn sequence information. Before an id is written into a bundle or used
//! as a file name it is encrypted under a key both peers derive from the
//! ECDH shared secret of their identity keys:
//!
//! ```text
//! salt = KDF("bundle id salt", secret)[..16]
//! key  = Argon2id(secret, salt)
//! wire = base64url(nonce || XChaCha20-Poly1305(key, nonce, id))
//! ```
//!
//! Two nonce disciplines share one format, so [`IdCipher::decrypt`] handles
//! both:
//! - probabilistic: random nonce, for anything never compared as ciphertext
//! - deterministic: nonce = keyed BLAKE3 of the id (SIV style), so the same id
//!   always yields the same wire text; used where the wire id is a file name
//!   that must stay stable across retransmissions.
//!
//! The Argon2 step is deliberately slow; derive once per peer and keep the
//! [`IdCipher`].

use crate::aead::{AeadKey, NONCE_SIZE, Nonce, TAG_SIZE};
use crate::hash::{CONTEXT_ID_SALT, CONTEXT_ID_SIV, Kdf, keyed_hash};
use crate::x25519::SharedSecret;
use crate::CryptoError;
use argon2::{Algorithm, Argon2, Params, ParamsBuilder, Version};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

const SALT_SIZE: usize = 16;
const ID_AAD: &[u8] = b"ddd bundle id";

/// Argon2id cost parameters for the id key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdKdfParams {
    /// Memory cost in KiB
    pub memory_cost_kib: u32,
    /// Number of iterations
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for IdKdfParams {
    fn default() -> Self {
        Self {
            memory_cost_kib: 19_456, // 19 MiB
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl IdKdfParams {
    /// Cheap parameters for tests.
    ///
    /// **Warning:** Only use for testing.
    #[must_use]
    pub fn low_security() -> Self {
        Self {
            memory_cost_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// Expensive parameters for deployments that derive keys rarely.
    #[must_use]
    pub fn high_security() -> Self {
        Self {
            memory_cost_kib: 65_536, // 64 MiB
            iterations: 4,
            parallelism: 4,
        }
    }

    /// Check the parameters are within Argon2 bounds.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidParameter`] naming the offending field.
    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.parallelism < 1 || self.parallelism > 255 {
            return Err(CryptoError::InvalidParameter(
                "parallelism must be between 1 and 255".into(),
            ));
        }
        if self.memory_cost_kib < 8 * self.parallelism {
            return Err(CryptoError::InvalidParameter(
                "memory_cost_kib must be at least 8 KiB per lane".into(),
            ));
        }
        if self.iterations < 1 {
            return Err(CryptoError::InvalidParameter(
                "iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn build(&self) -> Result<Params, CryptoError> {
        self.validate()?;
        ParamsBuilder::new()
            .m_cost(self.memory_cost_kib)
            .t_cost(self.iterations)
            .p_cost(self.parallelism)
            .output_len(32)
            .build()
            .map_err(|e| CryptoError::InvalidParameter(format!("Argon2 params: {e}")))
    }
}

/// Symmetric cipher for bundle ids between one pair of peers.
#[derive(Clone, ZeroizeOnDrop)]
pub struct IdCipher {
    key: AeadKey,
    siv_key: [u8; 32],
}

impl IdCipher {
    /// Derive from the identity ECDH shared secret.
    ///
    /// # Errors
    ///
    /// Invalid parameters or an Argon2 failure.
    pub fn derive(shared: &SharedSecret, params: &IdKdfParams) -> Result<Self, CryptoError> {
        Self::from_secret(shared.as_bytes(), params)
    }

    /// Derive from arbitrary secret bytes.
    ///
    /// # Errors
    ///
    /// Invalid parameters or an Argon2 failure.
    pub fn from_secret(secret: &[u8], params: &IdKdfParams) -> Result<Self, CryptoError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.build()?);
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&Kdf::new(CONTEXT_ID_SALT).derive_key(secret)[..SALT_SIZE]);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(secret, &salt, &mut key)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        let siv_key = Kdf::new(CONTEXT_ID_SIV).derive_key(&key);
        let cipher = Self {
            key: AeadKey::new(key),
            siv_key,
        };
        key.zeroize();
        Ok(cipher)
    }

    /// Encrypt with a random nonce.
    ///
    /// # Errors
    ///
    /// [`CryptoError::EncryptionFailed`] on AEAD failure.
    pub fn encrypt(&self, id: &str) -> Result<String, CryptoError> {
        self.seal(Nonce::generate(&mut OsRng), id)
    }

    /// Encrypt so that the same id always gives the same wire text.
    ///
    /// # Errors
    ///
    /// [`CryptoError::EncryptionFailed`] on AEAD failure.
    pub fn encrypt_deterministic(&self, id: &str) -> Result<String, CryptoError> {
        let tag = keyed_hash(&self.siv_key, id.as_bytes());
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&tag[..NONCE_SIZE]);
        self.seal(Nonce::from_bytes(nonce), id)
    }

    fn seal(&self, nonce: Nonce, id: &str) -> Result<String, CryptoError> {
        let ciphertext = self.key.encrypt(&nonce, id.as_bytes(), ID_AAD)?;
        let mut wire = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wire.extend_from_slice(nonce.as_bytes());
        wire.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(wire))
    }

    /// Decrypt a wire id produced by either variant.
    ///
    /// # Errors
    ///
    /// [`CryptoError::DecryptionFailed`] for anything not produced by this
    /// key, [`CryptoError::InvalidMessage`] for a non UTF-8 plaintext.
    pub fn decrypt(&self, wire: &str) -> Result<String, CryptoError> {
        let raw = URL_SAFE_NO_PAD
            .decode(wire.trim())
            .map_err(|_| CryptoError::DecryptionFailed)?;
        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let nonce = Nonce::from_slice(&raw[..NONCE_SIZE]).ok_or(CryptoError::DecryptionFailed)?;
        let plaintext = self.key.decrypt(&nonce, &raw[NONCE_SIZE..], ID_AAD)?;
        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::InvalidMessage("bundle id is not UTF-8".into()))
    }
}

impl std::fmt::Debug for IdCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdCipher").finish_non_exhaustive()
    }
}
