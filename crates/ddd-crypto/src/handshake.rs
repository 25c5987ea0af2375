//! X3DH-style session establishment.
//!
//! The client (initiator) holds an identity key and a base key; the server
//! (responder) holds an identity key, a signed pre-key and a ratchet key.
//! Public halves are provisioned out of band, or, for the client, carried in
//! its bundles, so no round trip is needed:
//!
//! ```text
//! DH1 = DH(IK_c, SPK_s)
//! DH2 = DH(EK_c, IK_s)
//! DH3 = DH(EK_c, SPK_s)
//! root = KDF(0xFF * 32 || DH1 || DH2 || DH3)
//! ```
//!
//! The client starts its ratchet against the server ratchet key; the server
//! starts with that ratchet key pair as its own.

use crate::hash::{CONTEXT_HANDSHAKE, Kdf};
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::ratchet::RatchetSession;
use crate::x25519::{PrivateKey, PublicKey};
use crate::CryptoError;
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

/// Server key material: identity, signed pre-key, ratchet key.
#[derive(Clone, Debug)]
pub struct ServerKeyBundle {
    /// Long-term identity
    pub identity: IdentityKeyPair,
    /// Signed pre-key
    pub signed_pre: PrivateKey,
    /// Initial ratchet key
    pub ratchet: PrivateKey,
}

/// Public half of a [`ServerKeyBundle`], provisioned to every client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerPublicBundle {
    /// Identity key
    pub identity: IdentityKey,
    /// Signed pre-key
    pub signed_pre: PublicKey,
    /// Initial ratchet key
    pub ratchet: PublicKey,
}

/// Client key material: identity and base key.
#[derive(Clone, Debug)]
pub struct ClientKeyBundle {
    /// Long-term identity
    pub identity: IdentityKeyPair,
    /// Base key used for the handshake
    pub base: PrivateKey,
}

/// Public half of a [`ClientKeyBundle`], carried in client bundles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientPublicBundle {
    /// Identity key
    pub identity: IdentityKey,
    /// Base key
    pub base: PublicKey,
}

impl ServerKeyBundle {
    /// Generate a fresh server key set.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            identity: IdentityKeyPair::generate(rng),
            signed_pre: PrivateKey::generate(rng),
            ratchet: PrivateKey::generate(rng),
        }
    }

    /// Public half.
    #[must_use]
    pub fn public(&self) -> ServerPublicBundle {
        ServerPublicBundle {
            identity: self.identity.public(),
            signed_pre: self.signed_pre.public_key(),
            ratchet: self.ratchet.public_key(),
        }
    }
}

impl ClientKeyBundle {
    /// Generate a fresh client key set.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            identity: IdentityKeyPair::generate(rng),
            base: PrivateKey::generate(rng),
        }
    }

    /// Public half.
    #[must_use]
    pub fn public(&self) -> ClientPublicBundle {
        ClientPublicBundle {
            identity: self.identity.public(),
            base: self.base.public_key(),
        }
    }
}

/// Associated data binding every message to both identities.
fn associated_data(client: &IdentityKey, server: &IdentityKey) -> Vec<u8> {
    [client.to_bytes(), server.to_bytes()].concat()
}

fn root_key(dh1: &[u8; 32], dh2: &[u8; 32], dh3: &[u8; 32]) -> [u8; 32] {
    let mut ikm = [0u8; 128];
    ikm[..32].fill(0xFF);
    ikm[32..64].copy_from_slice(dh1);
    ikm[64..96].copy_from_slice(dh2);
    ikm[96..].copy_from_slice(dh3);
    let root = Kdf::new(CONTEXT_HANDSHAKE).derive_key(&ikm);
    ikm.zeroize();
    root
}

fn dh(
    private: &PrivateKey,
    public: &PublicKey,
    what: &str,
) -> Result<crate::x25519::SharedSecret, CryptoError> {
    private
        .exchange(public)
        .map_err(|e| CryptoError::HandshakeFailure(format!("{what}: {e}")))
}

/// Client side: derive the session for a provisioned server.
///
/// # Errors
///
/// [`CryptoError::HandshakeFailure`] if any server key is unusable.
pub fn initiate(
    client: &ClientKeyBundle,
    server: &ServerPublicBundle,
) -> Result<RatchetSession, CryptoError> {
    let server_identity = server
        .identity
        .dh_public()
        .map_err(|e| CryptoError::HandshakeFailure(format!("server identity: {e}")))?;
    let dh1 = dh(&client.identity.dh_private(), &server.signed_pre, "DH1")?;
    let dh2 = dh(&client.base, &server_identity, "DH2")?;
    let dh3 = dh(&client.base, &server.signed_pre, "DH3")?;

    let root = root_key(dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes());
    RatchetSession::initiator(
        root,
        server.ratchet,
        associated_data(&client.identity.public(), &server.identity),
    )
}

/// Server side: derive the session for a client seen for the first time.
///
/// # Errors
///
/// [`CryptoError::HandshakeFailure`] if any client key is unusable.
pub fn respond(
    server: &ServerKeyBundle,
    client: &ClientPublicBundle,
) -> Result<RatchetSession, CryptoError> {
    let client_identity = client
        .identity
        .dh_public()
        .map_err(|e| CryptoError::HandshakeFailure(format!("client identity: {e}")))?;
    let dh1 = dh(&server.signed_pre, &client_identity, "DH1")?;
    let dh2 = dh(&server.identity.dh_private(), &client.base, "DH2")?;
    let dh3 = dh(&server.signed_pre, &client.base, "DH3")?;

    let root = root_key(dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes());
    Ok(RatchetSession::responder(
        root,
        &server.ratchet,
        associated_data(&client.identity, &server.identity.public()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_both_sides_agree() {
        let server = ServerKeyBundle::generate(&mut OsRng);
        let client = ClientKeyBundle::generate(&mut OsRng);

        let mut c = initiate(&client, &server.public()).unwrap();
        let mut s = respond(&server, &client.public()).unwrap();

        let msg = c.encrypt(b"first bundle chunk").unwrap();
        assert_eq!(s.decrypt(&msg).unwrap(), b"first bundle chunk");
        let reply = s.encrypt(b"downstream").unwrap();
        assert_eq!(c.decrypt(&reply).unwrap(), b"downstream");
    }

    #[test]
    fn test_wrong_server_keys_fail() {
        let server = ServerKeyBundle::generate(&mut OsRng);
        let impostor = ServerKeyBundle::generate(&mut OsRng);
        let client = ClientKeyBundle::generate(&mut OsRng);

        let mut c = initiate(&client, &impostor.public()).unwrap();
        let mut s = respond(&server, &client.public()).unwrap();

        let msg = c.encrypt(b"x").unwrap();
        assert!(matches!(s.decrypt(&msg), Err(CryptoError::InvalidMessage(_))));
    }

    #[test]
    fn test_low_order_signed_pre_rejected() {
        let server = ServerKeyBundle::generate(&mut OsRng);
        let client = ClientKeyBundle::generate(&mut OsRng);
        let mut bad = server.public();
        bad.signed_pre = PublicKey::from_bytes([0u8; 32]);

        assert!(matches!(
            initiate(&client, &bad),
            Err(CryptoError::HandshakeFailure(_))
        ));
    }
}
