//! Double ratchet session cipher.
//!
//! Symmetric chains advance once per message (forward secrecy); a DH ratchet
//! step happens whenever the remote side shows a new ratchet public key
//! (post-compromise recovery).
//!
//! A bundle can arrive late, twice, or never, so the session keeps:
//! - message keys skipped over on a chain, to open late arrivals,
//! - the last few remote ratchet keys ("retained chains"), so a second copy
//!   of an already opened message is reported as [`CryptoError::DuplicateMessage`],
//! - a longer list of expired ratchet keys whose skipped keys were purged, so
//!   a message on one of those is reported as [`CryptoError::LegacyMessage`],
//! - per live chain, the range of skipped keys evicted to honor
//!   [`MAX_SKIPPED_KEYS`]; a message in that range is legacy too.
//!
//! `encrypt` and `decrypt` are all-or-nothing: on error the session is left
//! exactly as it was.
//!
//! ## Message format
//!
//! ```text
//! version (1) | ratchet key (32) | previous chain length (8, BE) | n (8, BE) | ciphertext + tag
//! ```
//!
//! The header is authenticated as associated data together with the
//! session's identity binding.

use crate::aead::{AeadKey, Nonce};
use crate::hash::{CONTEXT_ROOT_RATCHET, hkdf, hkdf_expand};
use crate::x25519::{PrivateKey, PublicKey};
use crate::CryptoError;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use zeroize::Zeroize;

/// Current message format version.
pub const MESSAGE_VERSION: u8 = 3;

/// Header length in bytes.
pub const HEADER_SIZE: usize = 1 + 32 + 8 + 8;

/// Most message keys skipped over in a single step.
pub const MAX_SKIP: u64 = 1024;

/// Most skipped message keys kept across all chains.
pub const MAX_SKIPPED_KEYS: usize = 1024;

/// Remote ratchet keys whose skipped message keys are still kept.
pub const MAX_RETAINED_CHAINS: usize = 5;

/// Remote ratchet keys remembered after their chains were dropped.
pub const MAX_EXPIRED_CHAINS: usize = 64;

const MESSAGE_KEY_INFO: &[u8] = b"ddd message keys";

/// Chain key for symmetric ratcheting.
#[derive(Clone, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct ChainKey([u8; 32]);

impl ChainKey {
    /// Create from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Ratchet forward and derive the message key for the current step.
    pub fn ratchet(&mut self) -> MessageKey {
        let old_key = self.0;

        // chain_key[n+1] = BLAKE3(chain_key[n] || 0x01)
        let mut hasher = blake3::Hasher::new();
        hasher.update(&old_key);
        hasher.update(&[0x01]);
        self.0 = *hasher.finalize().as_bytes();

        // message_key[n] = BLAKE3(chain_key[n] || 0x02)
        let mut hasher = blake3::Hasher::new();
        hasher.update(&old_key);
        hasher.update(&[0x02]);
        MessageKey(*hasher.finalize().as_bytes())
    }
}

/// Message key derived from a chain key; used for exactly one message.
#[derive(Clone, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    /// Expand into the AEAD key and nonce for this message.
    fn cipher(&self) -> (AeadKey, Nonce) {
        let mut okm = [0u8; 56];
        hkdf_expand(&self.0, MESSAGE_KEY_INFO, &mut okm);
        let mut key = [0u8; 32];
        key.copy_from_slice(&okm[..32]);
        let mut nonce = [0u8; 24];
        nonce.copy_from_slice(&okm[32..]);
        okm.zeroize();
        (AeadKey::new(key), Nonce::from_bytes(nonce))
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct Chain {
    key: ChainKey,
    n: u64,
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet: [u8; 32],
    n: u64,
    key: MessageKey,
}

/// Message numbers `from..until` of a chain lost their skipped keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Evicted {
    ratchet: [u8; 32],
    from: u64,
    until: u64,
}

/// Parsed message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Sender's current ratchet public key
    pub ratchet: PublicKey,
    /// Length of the sender's previous sending chain
    pub previous_chain_len: u64,
    /// Message number within the current chain
    pub n: u64,
}

impl Header {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = MESSAGE_VERSION;
        out[1..33].copy_from_slice(self.ratchet.as_bytes());
        out[33..41].copy_from_slice(&self.previous_chain_len.to_be_bytes());
        out[41..49].copy_from_slice(&self.n.to_be_bytes());
        out
    }

    /// Parse the header of a ciphertext.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidMessage`] if too short,
    /// [`CryptoError::LegacyMessage`] for another format version.
    pub fn parse(message: &[u8]) -> Result<Self, CryptoError> {
        if message.len() < HEADER_SIZE {
            return Err(CryptoError::InvalidMessage(format!(
                "{} bytes is shorter than a header",
                message.len()
            )));
        }
        if message[0] != MESSAGE_VERSION {
            return Err(CryptoError::LegacyMessage(format!(
                "message version {} (current {MESSAGE_VERSION})",
                message[0]
            )));
        }
        let mut ratchet = [0u8; 32];
        ratchet.copy_from_slice(&message[1..33]);
        let mut pn = [0u8; 8];
        pn.copy_from_slice(&message[33..41]);
        let mut n = [0u8; 8];
        n.copy_from_slice(&message[41..49]);
        Ok(Self {
            ratchet: PublicKey::from_bytes(ratchet),
            previous_chain_len: u64::from_be_bytes(pn),
            n: u64::from_be_bytes(n),
        })
    }
}

/// Per-peer ratchet state. Serializes into the persisted session record.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetSession {
    root_key: [u8; 32],
    dh_self: [u8; 32],
    dh_remote: Option<PublicKey>,
    send: Option<Chain>,
    recv: Option<Chain>,
    previous_send_len: u64,
    skipped: VecDeque<SkippedKey>,
    evicted: Vec<Evicted>,
    retained: VecDeque<[u8; 32]>,
    expired: VecDeque<[u8; 32]>,
    associated_data: Vec<u8>,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_self.zeroize();
    }
}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("sent", &self.send.as_ref().map(|c| c.n))
            .field("received", &self.recv.as_ref().map(|c| c.n))
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

fn kdf_root(root_key: &[u8; 32], dh_out: &[u8; 32]) -> ([u8; 32], ChainKey) {
    let mut okm = [0u8; 64];
    hkdf(root_key, dh_out, CONTEXT_ROOT_RATCHET, &mut okm);
    let mut root = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    let mut chain = [0u8; 32];
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (root, ChainKey::from_bytes(chain))
}

impl RatchetSession {
    /// Session for the initiator, who already knows the responder's ratchet
    /// key and can send immediately.
    ///
    /// # Errors
    ///
    /// [`CryptoError::HandshakeFailure`] if the remote ratchet key is unusable.
    pub fn initiator(
        root_key: [u8; 32],
        remote_ratchet: PublicKey,
        associated_data: Vec<u8>,
    ) -> Result<Self, CryptoError> {
        let dh_self = PrivateKey::generate(&mut OsRng);
        let shared = dh_self
            .exchange(&remote_ratchet)
            .map_err(|e| CryptoError::HandshakeFailure(format!("ratchet key: {e}")))?;
        let (root, send_chain) = kdf_root(&root_key, shared.as_bytes());
        Ok(Self {
            root_key: root,
            dh_self: dh_self.to_bytes(),
            dh_remote: Some(remote_ratchet),
            send: Some(Chain {
                key: send_chain,
                n: 0,
            }),
            recv: None,
            previous_send_len: 0,
            skipped: VecDeque::new(),
            evicted: Vec::new(),
            retained: VecDeque::new(),
            expired: VecDeque::new(),
            associated_data,
        })
    }

    /// Session for the responder, holding the ratchet key pair the initiator
    /// used. It can only send after its first inbound message.
    #[must_use]
    pub fn responder(
        root_key: [u8; 32],
        ratchet: &PrivateKey,
        associated_data: Vec<u8>,
    ) -> Self {
        Self {
            root_key,
            dh_self: ratchet.to_bytes(),
            dh_remote: None,
            send: None,
            recv: None,
            previous_send_len: 0,
            skipped: VecDeque::new(),
            evicted: Vec::new(),
            retained: VecDeque::new(),
            expired: VecDeque::new(),
            associated_data,
        }
    }

    /// Whether the sending chain exists yet.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.send.is_some()
    }

    /// Encrypt one message, advancing the sending chain.
    ///
    /// # Errors
    ///
    /// [`CryptoError::HandshakeFailure`] before the responder has received
    /// anything, [`CryptoError::EncryptionFailed`] on AEAD failure.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ratchet = PrivateKey::from_bytes(self.dh_self).public_key();
        let previous_chain_len = self.previous_send_len;
        let chain = self.send.as_mut().ok_or_else(|| {
            CryptoError::HandshakeFailure("no sending chain before the first inbound message".into())
        })?;

        let header = Header {
            ratchet,
            previous_chain_len,
            n: chain.n,
        };
        let (key, nonce) = chain.key.clone().ratchet().cipher();
        let header_bytes = header.to_bytes();
        let aad = [self.associated_data.as_slice(), &header_bytes].concat();
        let ciphertext = key.encrypt(&nonce, plaintext, &aad)?;

        chain.key.ratchet();
        chain.n += 1;

        let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt one message.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::DuplicateMessage`]: the chain step was already used
    /// - [`CryptoError::LegacyMessage`]: older than any retained chain, its
    ///   skipped key was evicted, or an old format version
    /// - [`CryptoError::InvalidMessage`]: malformed or not authentic
    pub fn decrypt(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let header = Header::parse(message)?;
        let mut next = self.clone();
        let plaintext = next.decrypt_with_header(&header, message)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_with_header(
        &mut self,
        header: &Header,
        message: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ratchet = header.ratchet.to_bytes();

        if let Some(pos) = self
            .skipped
            .iter()
            .position(|s| s.ratchet == ratchet && s.n == header.n)
        {
            let plaintext = self.open(&self.skipped[pos].key, message)?;
            self.skipped.remove(pos);
            return Ok(plaintext);
        }
        if self
            .evicted
            .iter()
            .any(|e| e.ratchet == ratchet && (e.from..e.until).contains(&header.n))
        {
            return Err(CryptoError::LegacyMessage(format!(
                "key of message {} was evicted",
                header.n
            )));
        }

        if self.dh_remote.as_ref() == Some(&header.ratchet) {
            let received = self.recv.as_ref().map_or(0, |c| c.n);
            if header.n < received {
                return Err(CryptoError::DuplicateMessage { counter: header.n });
            }
        } else if self.retained.contains(&ratchet) {
            return Err(CryptoError::DuplicateMessage { counter: header.n });
        } else if self.expired.contains(&ratchet) {
            return Err(CryptoError::LegacyMessage(format!(
                "chain of message {} is no longer retained",
                header.n
            )));
        } else {
            self.skip_to(header.previous_chain_len)?;
            self.dh_step(header.ratchet)?;
        }

        self.skip_to(header.n)?;
        let chain = self
            .recv
            .as_mut()
            .ok_or_else(|| CryptoError::InvalidMessage("no receiving chain".into()))?;
        let key = chain.key.ratchet();
        chain.n += 1;
        self.open(&key, message)
    }

    fn open(&self, key: &MessageKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (aead_key, nonce) = key.cipher();
        let aad = [self.associated_data.as_slice(), &message[..HEADER_SIZE]].concat();
        aead_key
            .decrypt(&nonce, &message[HEADER_SIZE..], &aad)
            .map_err(|_| CryptoError::InvalidMessage("authentication failed".into()))
    }

    /// Store message keys of the current receiving chain up to `until`.
    fn skip_to(&mut self, until: u64) -> Result<(), CryptoError> {
        let Some(remote) = self.dh_remote else {
            return Ok(());
        };
        let Some(chain) = self.recv.as_mut() else {
            return Ok(());
        };
        if until.saturating_sub(chain.n) > MAX_SKIP {
            return Err(CryptoError::InvalidMessage(format!(
                "message {until} skips more than {MAX_SKIP} keys"
            )));
        }
        while chain.n < until {
            let key = chain.key.ratchet();
            self.skipped.push_back(SkippedKey {
                ratchet: remote.to_bytes(),
                n: chain.n,
                key,
            });
            chain.n += 1;
        }
        while self.skipped.len() > MAX_SKIPPED_KEYS {
            if let Some(lost) = self.skipped.pop_front() {
                self.note_evicted(&lost);
            }
        }
        Ok(())
    }

    fn note_evicted(&mut self, lost: &SkippedKey) {
        match self.evicted.iter_mut().find(|e| e.ratchet == lost.ratchet) {
            Some(range) => {
                range.from = range.from.min(lost.n);
                range.until = range.until.max(lost.n + 1);
            }
            None => self.evicted.push(Evicted {
                ratchet: lost.ratchet,
                from: lost.n,
                until: lost.n + 1,
            }),
        }
    }

    fn dh_step(&mut self, remote: PublicKey) -> Result<(), CryptoError> {
        if let Some(old) = self.dh_remote.take() {
            self.retained.push_back(old.to_bytes());
            while self.retained.len() > MAX_RETAINED_CHAINS {
                if let Some(dropped) = self.retained.pop_front() {
                    self.skipped.retain(|s| s.ratchet != dropped);
                    self.evicted.retain(|e| e.ratchet != dropped);
                    self.expired.push_back(dropped);
                }
            }
            while self.expired.len() > MAX_EXPIRED_CHAINS {
                self.expired.pop_front();
            }
        }

        let own = PrivateKey::from_bytes(self.dh_self);
        let shared = own
            .exchange(&remote)
            .map_err(|e| CryptoError::InvalidMessage(format!("ratchet key: {e}")))?;
        let (root, recv_chain) = kdf_root(&self.root_key, shared.as_bytes());

        let fresh = PrivateKey::generate(&mut OsRng);
        let shared = fresh
            .exchange(&remote)
            .map_err(|e| CryptoError::InvalidMessage(format!("ratchet key: {e}")))?;
        let (root, send_chain) = kdf_root(&root, shared.as_bytes());

        self.previous_send_len = self.send.as_ref().map_or(0, |c| c.n);
        self.root_key = root;
        self.dh_self = fresh.to_bytes();
        self.dh_remote = Some(remote);
        self.recv = Some(Chain {
            key: recv_chain,
            n: 0,
        });
        self.send = Some(Chain {
            key: send_chain,
            n: 0,
        });
        Ok(())
    }

    /// Serialize into an opaque session record.
    ///
    /// # Errors
    ///
    /// [`CryptoError::SessionRecord`] if encoding fails.
    pub fn to_record(&self) -> Result<Vec<u8>, CryptoError> {
        bincode::serialize(self).map_err(|e| CryptoError::SessionRecord(e.to_string()))
    }

    /// Restore from a session record.
    ///
    /// # Errors
    ///
    /// [`CryptoError::SessionRecord`] if the record is corrupt.
    pub fn from_record(record: &[u8]) -> Result<Self, CryptoError> {
        bincode::deserialize(record).map_err(|e| CryptoError::SessionRecord(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (RatchetSession, RatchetSession) {
        let root = [0x42u8; 32];
        let server_ratchet = PrivateKey::generate(&mut OsRng);
        let client =
            RatchetSession::initiator(root, server_ratchet.public_key(), b"ad".to_vec()).unwrap();
        let server = RatchetSession::responder(root, &server_ratchet, b"ad".to_vec());
        (client, server)
    }

    #[test]
    fn test_chain_key_produces_different_keys() {
        let mut chain = ChainKey::from_bytes([0x42u8; 32]);
        let key1 = chain.ratchet();
        let key2 = chain.ratchet();
        assert_ne!(key1.0, key2.0);
    }

    #[test]
    fn test_conversation() {
        let (mut client, mut server) = pair();

        let m1 = client.encrypt(b"hello").unwrap();
        assert_eq!(server.decrypt(&m1).unwrap(), b"hello");

        let r1 = server.encrypt(b"hi").unwrap();
        assert_eq!(client.decrypt(&r1).unwrap(), b"hi");

        let m2 = client.encrypt(b"again").unwrap();
        assert_eq!(server.decrypt(&m2).unwrap(), b"again");
    }

    #[test]
    fn test_responder_cannot_send_first() {
        let (_, mut server) = pair();
        assert!(!server.can_send());
        assert!(matches!(
            server.encrypt(b"x"),
            Err(CryptoError::HandshakeFailure(_))
        ));
    }

    #[test]
    fn test_duplicate_detected() {
        let (mut client, mut server) = pair();
        let m1 = client.encrypt(b"one").unwrap();
        server.decrypt(&m1).unwrap();
        assert!(matches!(
            server.decrypt(&m1),
            Err(CryptoError::DuplicateMessage { counter: 0 })
        ));
    }

    #[test]
    fn test_out_of_order_uses_skipped_keys() {
        let (mut client, mut server) = pair();
        let m1 = client.encrypt(b"one").unwrap();
        let m2 = client.encrypt(b"two").unwrap();

        assert_eq!(server.decrypt(&m2).unwrap(), b"two");
        assert_eq!(server.decrypt(&m1).unwrap(), b"one");
        assert!(server.decrypt(&m1).is_err());
    }

    #[test]
    fn test_duplicate_on_retained_chain() {
        let (mut client, mut server) = pair();
        let m1 = client.encrypt(b"one").unwrap();
        server.decrypt(&m1).unwrap();

        // Server replies, client replies: the server moves to a new chain.
        let r1 = server.encrypt(b"r").unwrap();
        client.decrypt(&r1).unwrap();
        let m2 = client.encrypt(b"two").unwrap();
        server.decrypt(&m2).unwrap();

        assert!(matches!(
            server.decrypt(&m1),
            Err(CryptoError::DuplicateMessage { .. })
        ));
    }

    #[test]
    fn test_legacy_after_chain_expires() {
        let (mut client, mut server) = pair();
        let first = client.encrypt(b"first").unwrap();
        server.decrypt(&first).unwrap();

        for _ in 0..=MAX_RETAINED_CHAINS {
            let r = server.encrypt(b"r").unwrap();
            client.decrypt(&r).unwrap();
            let m = client.encrypt(b"m").unwrap();
            server.decrypt(&m).unwrap();
        }

        assert!(matches!(
            server.decrypt(&first),
            Err(CryptoError::LegacyMessage(_))
        ));
    }

    #[test]
    fn test_evicted_skipped_key_is_legacy() {
        let (mut client, mut server) = pair();
        let messages: Vec<Vec<u8>> = (0..=2 * MAX_SKIP)
            .map(|_| client.encrypt(b"m").unwrap())
            .collect();
        let step = usize::try_from(MAX_SKIP).unwrap();

        // Two jumps skip 2046 keys; the oldest 1022 of them are evicted
        server.decrypt(&messages[0]).unwrap();
        server.decrypt(&messages[step]).unwrap();
        server.decrypt(&messages[2 * step]).unwrap();

        assert!(matches!(
            server.decrypt(&messages[1]),
            Err(CryptoError::LegacyMessage(_))
        ));
        assert!(matches!(
            server.decrypt(&messages[step - 2]),
            Err(CryptoError::LegacyMessage(_))
        ));
        assert!(matches!(
            server.decrypt(&messages[0]),
            Err(CryptoError::DuplicateMessage { counter: 0 })
        ));
        assert!(server.decrypt(&messages[step - 1]).is_ok());
    }

    #[test]
    fn test_old_version_is_legacy() {
        let (mut client, mut server) = pair();
        let mut m1 = client.encrypt(b"one").unwrap();
        m1[0] = 2;
        assert!(matches!(
            server.decrypt(&m1),
            Err(CryptoError::LegacyMessage(_))
        ));
    }

    #[test]
    fn test_tampered_message_leaves_state_untouched() {
        let (mut client, mut server) = pair();
        let m1 = client.encrypt(b"one").unwrap();
        let mut forged = m1.clone();
        let last = forged.len() - 1;
        forged[last] ^= 1;

        assert!(matches!(
            server.decrypt(&forged),
            Err(CryptoError::InvalidMessage(_))
        ));
        assert_eq!(server.decrypt(&m1).unwrap(), b"one");
    }

    #[test]
    fn test_associated_data_binds_session() {
        let root = [7u8; 32];
        let ratchet = PrivateKey::generate(&mut OsRng);
        let mut client = RatchetSession::initiator(root, ratchet.public_key(), b"a".to_vec()).unwrap();
        let mut server = RatchetSession::responder(root, &ratchet, b"b".to_vec());
        let m = client.encrypt(b"x").unwrap();
        assert!(server.decrypt(&m).is_err());
    }

    #[test]
    fn test_record_roundtrip_continues_session() {
        let (mut client, mut server) = pair();
        let m1 = client.encrypt(b"one").unwrap();
        server.decrypt(&m1).unwrap();

        let record = server.to_record().unwrap();
        let mut restored = RatchetSession::from_record(&record).unwrap();

        let m2 = client.encrypt(b"two").unwrap();
        assert_eq!(restored.decrypt(&m2).unwrap(), b"two");
        assert!(RatchetSession::from_record(&record[..10]).is_err());
    }
}
