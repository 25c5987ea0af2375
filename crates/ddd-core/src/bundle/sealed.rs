//! Outer bundle archive: what the transport carries.
//!
//! ```text
//! bundle.id                       wire id (encrypted, deterministic)
//! payloads/payload1..N            ratchet-encrypted payload chunks
//! signatures/payloadN.signature   Ed25519 signature of plaintext chunk N
//! clientIdentity.pub              sender identity, wrapped for the recipient
//!   or serverIdentity.pub
//! clientBase.pub                  client handshake base key, wrapped (client
//!                                 bundles only)
//! ```

use super::archive::{self, Entries};
use crate::config::Role;
use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ddd_crypto::{IdentityKey, IdentityKeyPair, RatchetSession, Signature};

const BUNDLE_ID: &str = "bundle.id";
const CLIENT_IDENTITY: &str = "clientIdentity.pub";
const SERVER_IDENTITY: &str = "serverIdentity.pub";
const CLIENT_BASE: &str = "clientBase.pub";

fn payload_name(n: usize) -> String {
    format!("payloads/payload{n}")
}

fn signature_name(n: usize) -> String {
    format!("signatures/payload{n}.signature")
}

/// Name of the wrapped identity entry written by `sender`.
#[must_use]
pub fn identity_entry(sender: Role) -> &'static str {
    match sender {
        Role::Client => CLIENT_IDENTITY,
        Role::Server => SERVER_IDENTITY,
    }
}

/// Encrypted bundle as carried by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBundle {
    /// Role of the sender
    pub sender: Role,
    /// Encrypted bundle id
    pub wire_id: String,
    /// Encrypted payload chunks
    pub chunks: Vec<Vec<u8>>,
    /// One signature per chunk
    pub signatures: Vec<Signature>,
    /// Wrapped sender identity key
    pub sender_identity: String,
    /// Wrapped client base key
    pub client_base: Option<String>,
}

impl SealedBundle {
    /// Serialize into the carrier archive.
    ///
    /// # Errors
    ///
    /// Archive write failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut entries = Entries::new();
        entries.insert(BUNDLE_ID.into(), self.wire_id.as_bytes().to_vec());
        for (i, (chunk, signature)) in self.chunks.iter().zip(&self.signatures).enumerate() {
            entries.insert(payload_name(i + 1), chunk.clone());
            entries.insert(
                signature_name(i + 1),
                URL_SAFE_NO_PAD.encode(signature.as_bytes()).into_bytes(),
            );
        }
        entries.insert(
            identity_entry(self.sender).into(),
            self.sender_identity.as_bytes().to_vec(),
        );
        if let Some(base) = &self.client_base {
            entries.insert(CLIENT_BASE.into(), base.as_bytes().to_vec());
        }
        archive::write_entries(&entries)
    }

    /// Parse a carrier archive produced by a `sender`.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedBundle`] if the layout is wrong.
    pub fn from_bytes(bytes: &[u8], sender: Role, max_size: u64) -> Result<Self> {
        let mut entries = archive::read_entries(bytes, max_size)?;
        let wire_id = archive::take_text(&mut entries, BUNDLE_ID)?;
        let sender_identity = archive::take_text(&mut entries, identity_entry(sender))?;
        let client_base = match sender {
            Role::Client => Some(archive::take_text(&mut entries, CLIENT_BASE)?),
            Role::Server => None,
        };

        let mut chunks = Vec::new();
        let mut signatures = Vec::new();
        while let Some(chunk) = entries.remove(&payload_name(chunks.len() + 1)) {
            let name = signature_name(chunks.len() + 1);
            let text = archive::take_text(&mut entries, &name)?;
            let raw = URL_SAFE_NO_PAD
                .decode(text)
                .map_err(|e| Error::MalformedBundle(format!("{name}: {e}")))?;
            signatures.push(Signature::from_slice(&raw)?);
            chunks.push(chunk);
        }
        if chunks.is_empty() {
            return Err(Error::MalformedBundle("no payload chunks".into()));
        }
        if let Some(extra) = entries.keys().next() {
            return Err(Error::MalformedBundle(format!("unexpected entry {extra}")));
        }

        Ok(Self {
            sender,
            wire_id,
            chunks,
            signatures,
            sender_identity,
            client_base,
        })
    }
}

/// Encrypt `payload` chunk by chunk, signing each plaintext chunk.
///
/// `session` advances once per chunk; callers pass a copy and commit it
/// only after the whole bundle is built.
///
/// # Errors
///
/// Ratchet failures.
pub fn encrypt_payload(
    session: &mut RatchetSession,
    signer: &IdentityKeyPair,
    payload: &[u8],
    chunk_size: usize,
) -> Result<(Vec<Vec<u8>>, Vec<Signature>)> {
    let mut chunks = Vec::new();
    let mut signatures = Vec::new();
    for plain in payload.chunks(chunk_size.max(1)) {
        chunks.push(session.encrypt(plain)?);
        signatures.push(signer.sign(plain));
    }
    Ok((chunks, signatures))
}

/// Decrypt and verify every chunk of a bundle.
///
/// Any decryption or signature failure fails the whole payload; nothing
/// decrypted so far is returned.
///
/// # Errors
///
/// Ratchet failures or [`ddd_crypto::CryptoError::SignatureVerificationFailure`].
pub fn decrypt_payload(
    session: &mut RatchetSession,
    sender: &IdentityKey,
    chunks: &[Vec<u8>],
    signatures: &[Signature],
) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for (chunk, signature) in chunks.iter().zip(signatures) {
        let plain = session.decrypt(chunk)?;
        sender.verify(&plain, signature)?;
        payload.extend_from_slice(&plain);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddd_crypto::CryptoError;
    use ddd_crypto::handshake::{ClientKeyBundle, ServerKeyBundle, initiate, respond};
    use rand_core::OsRng;

    fn sessions() -> (ClientKeyBundle, RatchetSession, RatchetSession) {
        let server = ServerKeyBundle::generate(&mut OsRng);
        let client = ClientKeyBundle::generate(&mut OsRng);
        let c = initiate(&client, &server.public()).unwrap();
        let s = respond(&server, &client.public()).unwrap();
        (client, c, s)
    }

    fn sealed(client: &ClientKeyBundle, session: &mut RatchetSession, payload: &[u8]) -> SealedBundle {
        let (chunks, signatures) = encrypt_payload(session, &client.identity, payload, 16).unwrap();
        SealedBundle {
            sender: Role::Client,
            wire_id: "wire".into(),
            chunks,
            signatures,
            sender_identity: "identity".into(),
            client_base: Some("base".into()),
        }
    }

    #[test]
    fn test_chunked_payload() {
        let (client, mut c, mut s) = sessions();
        let payload: Vec<u8> = (0..100u8).collect();
        let bundle = sealed(&client, &mut c, &payload);
        assert_eq!(bundle.chunks.len(), 7);

        let bytes = bundle.to_bytes().unwrap();
        let parsed = SealedBundle::from_bytes(&bytes, Role::Client, 1 << 20).unwrap();
        assert_eq!(parsed, bundle);

        let plain = decrypt_payload(
            &mut s,
            &client.identity.public(),
            &parsed.chunks,
            &parsed.signatures,
        )
        .unwrap();
        assert_eq!(plain, payload);
    }

    #[test]
    fn test_bad_signature_fails_bundle() {
        let (client, mut c, mut s) = sessions();
        let mut bundle = sealed(&client, &mut c, &[1u8; 40]);
        bundle.signatures[1] = client.identity.sign(b"something else");

        let result = decrypt_payload(
            &mut s,
            &client.identity.public(),
            &bundle.chunks,
            &bundle.signatures,
        );
        assert!(matches!(
            result,
            Err(Error::Crypto(CryptoError::SignatureVerificationFailure))
        ));
    }

    #[test]
    fn test_missing_signature_rejected() {
        let (client, mut c, _) = sessions();
        let bundle = sealed(&client, &mut c, &[1u8; 40]);
        let mut entries = archive::read_entries(&bundle.to_bytes().unwrap(), 1 << 20).unwrap();
        entries.remove(&signature_name(2));
        let bytes = archive::write_entries(&entries).unwrap();
        assert!(matches!(
            SealedBundle::from_bytes(&bytes, Role::Client, 1 << 20),
            Err(Error::MalformedBundle(_))
        ));
    }

    #[test]
    fn test_server_bundle_has_no_base() {
        let (client, mut c, _) = sessions();
        let mut bundle = sealed(&client, &mut c, b"x");
        bundle.sender = Role::Server;
        bundle.client_base = None;
        let bytes = bundle.to_bytes().unwrap();
        let mut entries = archive::read_entries(&bytes, 1 << 20).unwrap();
        assert!(entries.remove(SERVER_IDENTITY).is_some());
        assert!(!entries.contains_key(CLIENT_BASE));
        assert_eq!(
            SealedBundle::from_bytes(&bytes, Role::Server, 1 << 20).unwrap(),
            bundle
        );
    }
}
