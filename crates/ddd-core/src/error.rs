//! Error types for the DDD core.
//!
//! Errors fall in three groups:
//! - local: one inbound bundle is bad (crypto, integrity, malformed id); drop
//!   the bundle, keep serving everyone else
//! - window: stale or invalid acks are expected on an unreliable carrier;
//!   overflow and duplicate registration are caller bugs
//! - persistence: state could not be made durable, so the operation must
//!   not be reported as done

use ddd_crypto::{CryptoError, PeerIdentity};
use std::path::PathBuf;
use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Window error
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// Malformed or wrong-length bundle id
    #[error("invalid bundle id: {0}")]
    InvalidBundleId(String),

    /// Bundle archive is not laid out as expected
    #[error("malformed bundle: {0}")]
    MalformedBundle(String),

    /// App id is empty or not a safe path component
    #[error("invalid app id: {0:?}")]
    InvalidAppId(String),

    /// No crypto session exists for the peer
    #[error("no session for peer {0}")]
    SessionNotFound(PeerIdentity),

    /// Key file could not be read or parsed
    #[error("key file {path}: {source}")]
    KeyFile {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: CryptoError,
    },

    /// Configuration rejected
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem error while persisting or loading state
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON state file could not be encoded or decoded
    #[error("state file: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary session record could not be encoded or decoded
    #[error("session record: {0}")]
    Encoding(#[from] bincode::Error),

    /// Sent ledger lost the record of a bundle still in flight
    #[error("no sent record for bundle {counter} of {peer}")]
    SentRecordMissing {
        /// Peer the bundle was sent to
        peer: PeerIdentity,
        /// Bundle counter
        counter: u64,
    },
}

impl Error {
    /// Whether the error only concerns the bundle being processed.
    ///
    /// Local errors abort that bundle; the caller logs them and continues
    /// with other bundles and peers.
    #[must_use]
    pub fn is_local(&self) -> bool {
        match self {
            Self::Crypto(_)
            | Self::InvalidBundleId(_)
            | Self::MalformedBundle(_)
            | Self::InvalidAppId(_) => true,
            Self::Window(e) => e.is_stale(),
            _ => false,
        }
    }
}

/// Sliding window errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    /// Ack for a bundle that was already acknowledged
    #[error("received old ack {acked} (window starts at {start})")]
    ReceivedOldAck {
        /// Acknowledged counter
        acked: u64,
        /// Current window start
        start: u64,
    },

    /// Ack for a bundle that was never sent
    #[error("received invalid ack {acked} (window ends at {end})")]
    ReceivedInvalidAck {
        /// Acknowledged counter
        acked: u64,
        /// Current window end
        end: u64,
    },

    /// Window already holds `capacity` bundles
    #[error("window full: capacity {capacity}")]
    BufferOverflow {
        /// Window capacity
        capacity: u64,
    },

    /// Bundle id does not carry the next counter
    #[error("expected counter {expected}, got {actual}")]
    OutOfSequence {
        /// Next counter to allocate
        expected: u64,
        /// Counter carried by the id
        actual: u64,
    },

    /// Peer has no window
    #[error("no window for peer {0}")]
    ClientWindowNotFound(PeerIdentity),

    /// Peer already has a window
    #[error("window for peer {0} already exists")]
    ClientAlreadyExists(PeerIdentity),
}

impl WindowError {
    /// Stale or invalid acks come from duplication and reordering on the
    /// carrier; they are logged, not fatal.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            Self::ReceivedOldAck { .. } | Self::ReceivedInvalidAck { .. }
        )
    }
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
