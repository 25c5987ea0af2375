//! Ephemeral wrapping of public keys carried in bundles.
//!
//! A sender's identity key is stable, so shipping it in the clear would let
//! any carrier link bundles to a client. Each bundle wraps it under a fresh
//! ephemeral key agreed with the recipient's identity:
//!
//! ```text
//! -----BEGIN EC PUBLIC KEY-----
//! <base64url ciphertext>
//! <base64url ephemeral public key>
//! -----END EC PUBLIC KEY-----
//! ```
//!
//! The recipient identity is bound as associated data, so a wrapped key only
//! opens for the process it was addressed to.

use crate::aead::{AeadKey, NONCE_SIZE, Nonce};
use crate::hash::{CONTEXT_WRAP, Kdf};
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::pem::{self, PUBLIC_KEY};
use crate::x25519::{PrivateKey, PublicKey, to_array};
use crate::CryptoError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand_core::OsRng;

fn wrap_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &IdentityKey) -> AeadKey {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(shared);
    ikm.extend_from_slice(ephemeral.as_bytes());
    ikm.extend_from_slice(&recipient.to_bytes());
    AeadKey::new(Kdf::new(CONTEXT_WRAP).derive_key(&ikm))
}

/// Wrap a 32-byte public key for `recipient`.
///
/// # Errors
///
/// [`CryptoError::InvalidPublicKey`] if the recipient key is unusable.
pub fn wrap(key: &[u8; 32], recipient: &IdentityKey) -> Result<String, CryptoError> {
    let ephemeral = PrivateKey::generate(&mut OsRng);
    let ephemeral_public = ephemeral.public_key();
    let shared = ephemeral.exchange(&recipient.dh_public()?)?;

    // Every wrap uses a fresh key, so a fixed nonce is never reused.
    let nonce = Nonce::from_bytes([0u8; NONCE_SIZE]);
    let ciphertext = wrap_key(shared.as_bytes(), &ephemeral_public, recipient).encrypt(
        &nonce,
        key,
        &recipient.to_bytes(),
    )?;

    Ok(format!(
        "{}\n{}\n{}\n{}\n",
        pem::header(PUBLIC_KEY),
        URL_SAFE_NO_PAD.encode(ciphertext),
        URL_SAFE_NO_PAD.encode(ephemeral_public.as_bytes()),
        pem::footer(PUBLIC_KEY)
    ))
}

/// Unwrap a key addressed to `own`.
///
/// # Errors
///
/// [`CryptoError::InvalidKeyFormat`] for a malformed envelope,
/// [`CryptoError::DecryptionFailed`] if it was wrapped for someone else.
pub fn unwrap(text: &str, own: &IdentityKeyPair) -> Result<[u8; 32], CryptoError> {
    let lines = pem::envelope_lines(PUBLIC_KEY, text, 4)?;
    let ciphertext = pem::decode_line(lines[1])?;
    let ephemeral = PublicKey::from_slice(&pem::decode_line(lines[2])?)
        .map_err(|_| CryptoError::InvalidKeyFormat("ephemeral key length".into()))?;

    let recipient = own.public();
    let shared = own.dh_private().exchange(&ephemeral)?;
    let nonce = Nonce::from_bytes([0u8; NONCE_SIZE]);
    let key = wrap_key(shared.as_bytes(), &ephemeral, &recipient).decrypt(
        &nonce,
        &ciphertext,
        &recipient.to_bytes(),
    )?;
    to_array(&key)
}

/// Unwrap an identity key addressed to `own`.
///
/// # Errors
///
/// As [`unwrap`], plus [`CryptoError::InvalidPublicKey`] for an invalid
/// point.
pub fn unwrap_identity(text: &str, own: &IdentityKeyPair) -> Result<IdentityKey, CryptoError> {
    IdentityKey::from_bytes(&unwrap(text, own)?)
}
