//! Long-term identity keys and peer identifiers.
//!
//! An identity is an Ed25519 key pair. It signs payload chunks directly and
//! takes part in X25519 agreement through its Montgomery form, the same
//! conversion libsignal-style protocols use, so each role carries a single
//! long-term key.
//!
//! The [`PeerIdentity`] is `base64url_nopad(SHA-1(public key bytes))`: a pure
//! function of the key, so both ends name a peer identically without ever
//! exchanging the name itself.

use crate::{CryptoError, PEER_ID_RAW_SIZE, x25519};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signer, Verifier};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Stable identifier of a client or server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Derive the identifier of a public identity key.
    #[must_use]
    pub fn derive(key: &IdentityKey) -> Self {
        Self::from_key_bytes(&key.to_bytes())
    }

    /// Derive the identifier from serialized public key bytes.
    #[must_use]
    pub fn from_key_bytes(bytes: &[u8]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(Sha1::digest(bytes)))
    }

    /// Parse an identifier received as text (file names, CLI arguments).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidParameter`] unless the text is
    /// base64url of a 20-byte digest.
    pub fn parse(text: &str) -> Result<Self, CryptoError> {
        let raw = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|e| CryptoError::InvalidParameter(format!("peer id {text}: {e}")))?;
        if raw.len() != PEER_ID_RAW_SIZE {
            return Err(CryptoError::InvalidParameter(format!(
                "peer id {text}: {} bytes",
                raw.len()
            )));
        }
        Ok(Self(text.to_owned()))
    }

    /// Raw digest bytes, used as the client id inside bundle ids.
    ///
    /// # Errors
    ///
    /// Fails only if the identifier was built from invalid text.
    pub fn to_raw(&self) -> Result<Vec<u8>, CryptoError> {
        URL_SAFE_NO_PAD
            .decode(&self.0)
            .map_err(|e| CryptoError::InvalidParameter(format!("peer id {}: {e}", self.0)))
    }

    /// Rebuild from raw digest bytes.
    #[must_use]
    pub fn from_raw(raw: &[u8]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(raw))
    }

    /// Text form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ed25519 signature (64 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Parse a detached signature file.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureVerificationFailure`] if the slice is
    /// not exactly 64 bytes; a truncated signature is a failed signature.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 64] = slice
            .try_into()
            .map_err(|_| CryptoError::SignatureVerificationFailure)?;
        Ok(Self(bytes))
    }

    /// Raw signature bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

/// Long-term identity key pair (private half never leaves the process).
#[derive(Clone, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    inner: ed25519_dalek::SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new identity.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Restore from the 32-byte seed stored in a private key file.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Export the 32-byte seed.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Public half.
    #[must_use]
    pub fn public(&self) -> IdentityKey {
        IdentityKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Identifier of this identity.
    #[must_use]
    pub fn peer_id(&self) -> PeerIdentity {
        PeerIdentity::derive(&self.public())
    }

    /// Sign a message (deterministic).
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).to_bytes())
    }

    /// X25519 secret for key agreement, via the clamped SHA-512 expansion
    /// of the Ed25519 seed.
    #[must_use]
    pub fn dh_private(&self) -> x25519::PrivateKey {
        use sha2::Sha512;
        let mut h = Sha512::digest(self.inner.to_bytes());
        h[0] &= 248;
        h[31] &= 127;
        h[31] |= 64;
        let mut key = [0u8; 32];
        key.copy_from_slice(&h[..32]);
        h.as_mut_slice().zeroize();
        let private = x25519::PrivateKey::from_bytes(key);
        key.zeroize();
        private
    }

    /// Key agreement with another identity.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] for a low-order peer key.
    pub fn agree(&self, peer: &IdentityKey) -> Result<x25519::SharedSecret, CryptoError> {
        self.dh_private().exchange(&peer.dh_public()?)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Public identity key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl IdentityKey {
    /// Parse 32 public key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a
    /// valid Ed25519 point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { inner })
    }

    /// Parse a slice of exactly 32 bytes.
    ///
    /// # Errors
    ///
    /// Length or point validation failures.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        Self::from_bytes(&x25519::to_array(slice)?)
    }

    /// Serialized public key bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Identifier of this identity.
    #[must_use]
    pub fn peer_id(&self) -> PeerIdentity {
        PeerIdentity::derive(self)
    }

    /// Verify a chunk signature.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureVerificationFailure`] on mismatch.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.inner
            .verify(message, &ed25519_dalek::Signature::from_bytes(&signature.0))
            .map_err(|_| CryptoError::SignatureVerificationFailure)
    }

    /// Montgomery form of the key for X25519 agreement.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the point does not
    /// decompress.
    pub fn dh_public(&self) -> Result<x25519::PublicKey, CryptoError> {
        use curve25519_dalek::edwards::CompressedEdwardsY;
        let point = CompressedEdwardsY(self.inner.to_bytes())
            .decompress()
            .ok_or(CryptoError::InvalidPublicKey)?;
        Ok(x25519::PublicKey::from_bytes(point.to_montgomery().to_bytes()))
    }
}
