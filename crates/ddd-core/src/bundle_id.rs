//! Bundle identifier codec.
//!
//! A bundle id binds a client, a direction and a counter:
//!
//! ```text
//! UPSTREAM   (client -> server): client id bytes || counter (u64, BE)
//! DOWNSTREAM (server -> client): counter (u64, BE) || client id bytes
//! ```
//!
//! The textual form is base64url of those bytes. It never leaves a bundle
//! payload in the clear: whatever a transport can see is the wire form
//! produced by [`BundleId::to_wire`].

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ddd_crypto::PeerIdentity;
use ddd_crypto::id_cipher::IdCipher;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Width of the counter field.
pub const COUNTER_SIZE: usize = 8;

/// Which way a bundle travels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to server
    Upstream,
    /// Server to client
    Downstream,
}

impl Direction {
    /// The opposite direction.
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            Self::Upstream => Self::Downstream,
            Self::Downstream => Self::Upstream,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => f.write_str("upstream"),
            Self::Downstream => f.write_str("downstream"),
        }
    }
}

/// Plaintext bundle identifier (textual form).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    /// Mint the id of bundle `counter` for `client` in `direction`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBundleId`] if the client id is not valid base64url.
    pub fn encode(client: &PeerIdentity, counter: u64, direction: Direction) -> Result<Self> {
        let client_bytes = client
            .to_raw()
            .map_err(|e| Error::InvalidBundleId(e.to_string()))?;
        let mut raw = Vec::with_capacity(client_bytes.len() + COUNTER_SIZE);
        match direction {
            Direction::Upstream => {
                raw.extend_from_slice(&client_bytes);
                raw.extend_from_slice(&counter.to_be_bytes());
            }
            Direction::Downstream => {
                raw.extend_from_slice(&counter.to_be_bytes());
                raw.extend_from_slice(&client_bytes);
            }
        }
        Ok(Self(URL_SAFE_NO_PAD.encode(raw)))
    }

    /// Accept a textual id read from a payload.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBundleId`] unless it decodes to more than a counter.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        decode(text)?;
        Ok(Self(text.to_owned()))
    }

    /// Counter carried by this id.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBundleId`] for malformed ids.
    pub fn counter(&self, direction: Direction) -> Result<u64> {
        counter_of(&self.0, direction)
    }

    /// Client the id belongs to.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBundleId`] for malformed ids.
    pub fn client(&self, direction: Direction) -> Result<PeerIdentity> {
        let raw = decode(&self.0)?;
        let client = match direction {
            Direction::Upstream => &raw[..raw.len() - COUNTER_SIZE],
            Direction::Downstream => &raw[COUNTER_SIZE..],
        };
        Ok(PeerIdentity::from_raw(client))
    }

    /// Deterministic wire form: the same id always maps to the same text,
    /// which keeps retransmitted bundles and their file names identical.
    ///
    /// # Errors
    ///
    /// Encryption failure.
    pub fn to_wire(&self, cipher: &IdCipher) -> Result<String> {
        Ok(cipher.encrypt_deterministic(&self.0)?)
    }

    /// Recover the id from its wire form.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBundleId`] if the wire text does not decrypt under
    /// this cipher or is not a well-formed id.
    pub fn from_wire(wire: &str, cipher: &IdCipher) -> Result<Self> {
        let text = cipher
            .decrypt(wire)
            .map_err(|e| Error::InvalidBundleId(format!("wire id: {e}")))?;
        Self::parse(&text)
    }

    /// Textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn decode(text: &str) -> Result<Vec<u8>> {
    let raw = URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|e| Error::InvalidBundleId(format!("{text}: {e}")))?;
    if raw.len() <= COUNTER_SIZE {
        return Err(Error::InvalidBundleId(format!(
            "{text}: {} bytes is too short",
            raw.len()
        )));
    }
    Ok(raw)
}

/// Extract the counter from a textual id.
///
/// # Errors
///
/// [`Error::InvalidBundleId`] for malformed ids.
pub fn counter_of(text: &str, direction: Direction) -> Result<u64> {
    let raw = decode(text)?;
    let offset = match direction {
        Direction::Upstream => raw.len() - COUNTER_SIZE,
        Direction::Downstream => 0,
    };
    let mut counter = [0u8; COUNTER_SIZE];
    counter.copy_from_slice(&raw[offset..offset + COUNTER_SIZE]);
    Ok(u64::from_be_bytes(counter))
}

/// Unsigned comparison of the counters of two ids of the same peer.
///
/// # Errors
///
/// [`Error::InvalidBundleId`] if either id is malformed.
pub fn compare(a: &BundleId, b: &BundleId, direction: Direction) -> Result<Ordering> {
    Ok(a.counter(direction)?.cmp(&b.counter(direction)?))
}
