//! Transmission configuration.

use crate::bundle_id::Direction;
use crate::error::{Error, Result};
use ddd_crypto::id_cipher::IdKdfParams;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default number of bundles in flight per peer.
pub const DEFAULT_WINDOW_CAPACITY: u64 = 3;

/// Largest accepted window capacity.
pub const MAX_WINDOW_CAPACITY: u64 = 1024;

/// Default payload chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Smallest accepted payload chunk size.
pub const MIN_CHUNK_SIZE: usize = 4096;

/// Room in a payload archive for everything but the ADUs.
pub const PAYLOAD_HEADROOM: u64 = 64 * 1024;

/// Default payload budget per bundle (100 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 100 * 1024 * 1024;

/// Which end of the protocol this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Mobile end; sends upstream
    Client,
    /// Bundle server; sends downstream
    Server,
}

impl Role {
    /// Direction of the bundles this role produces.
    #[must_use]
    pub fn outgoing(self) -> Direction {
        match self {
            Self::Client => Direction::Upstream,
            Self::Server => Direction::Downstream,
        }
    }

    /// Direction of the bundles this role consumes.
    #[must_use]
    pub fn incoming(self) -> Direction {
        self.outgoing().reverse()
    }

    /// The other end.
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            other => Err(Error::Config(format!("unknown role {other:?}"))),
        }
    }
}

/// Settings of a [`BundleTransmission`](crate::transmission::BundleTransmission).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmissionConfig {
    /// Role of this node
    pub role: Role,

    /// Root of all persistent state (counters, sessions, ADUs, sent ledger)
    pub state_dir: PathBuf,

    /// Bundles in flight per peer before retransmission kicks in
    pub window_capacity: u64,

    /// Plaintext bytes per encrypted payload chunk
    pub chunk_size: usize,

    /// ADU bytes packed into one bundle at most
    pub max_payload_size: u64,

    /// Argon2id cost of the bundle id key
    pub id_kdf: IdKdfParams,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            state_dir: PathBuf::from("ddd-state"),
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            id_kdf: IdKdfParams::default(),
        }
    }
}

impl TransmissionConfig {
    /// Defaults for `role` with state under `state_dir`.
    #[must_use]
    pub fn new(role: Role, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            role,
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// [`Error::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.window_capacity == 0 || self.window_capacity > MAX_WINDOW_CAPACITY {
            return Err(Error::Config(format!(
                "window_capacity must be between 1 and {MAX_WINDOW_CAPACITY}"
            )));
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "chunk_size must be at least {MIN_CHUNK_SIZE}"
            )));
        }
        if self.max_payload_size == 0 {
            return Err(Error::Config("max_payload_size must be positive".into()));
        }
        self.id_kdf
            .validate()
            .map_err(|e| Error::Config(format!("id_kdf: {e}")))?;
        Ok(())
    }

    /// Upper bound on the tar footprint of a decrypted payload archive,
    /// as counted by [`archive::footprint`](crate::bundle::archive::footprint).
    pub(crate) fn payload_limit(&self) -> u64 {
        self.max_payload_size.saturating_add(PAYLOAD_HEADROOM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TransmissionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_capacity, 3);
        assert_eq!(config.chunk_size, 1 << 20);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = TransmissionConfig::default();
        config.window_capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TransmissionConfig::default();
        config.chunk_size = 0;
        assert!(config.validate().is_err());
        config.chunk_size = MIN_CHUNK_SIZE - 1;
        assert!(config.validate().is_err());

        let mut config = TransmissionConfig::default();
        config.max_payload_size = 0;
        assert!(config.validate().is_err());

        let mut config = TransmissionConfig::default();
        config.id_kdf.parallelism = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_role_directions() {
        assert_eq!(Role::Client.outgoing(), Direction::Upstream);
        assert_eq!(Role::Server.incoming(), Direction::Upstream);
        assert_eq!("Server".parse::<Role>().unwrap(), Role::Server);
        assert!("relay".parse::<Role>().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: TransmissionConfig =
            serde_json::from_str(r#"{"role":"server","window_capacity":5}"#).unwrap();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.window_capacity, 5);
        assert_eq!(config.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
    }
}
