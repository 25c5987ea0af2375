//! Durable per-peer state.
//!
//! Two narrow key-value interfaces keyed by [`PeerIdentity`]:
//! - [`StateStore`]: last processed counter per (peer, direction) and the
//!   window counters, with compare-and-set for the read-modify-persist step
//! - [`SessionStore`]: opaque crypto session records
//!
//! Every setter returns only after the value is durable; callers rely on
//! that to persist before they acknowledge.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::bundle_id::Direction;
use crate::error::Result;
use crate::window::WindowState;
use ddd_crypto::PeerIdentity;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Counters and window persisted for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Last upstream counter processed from this peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upstream: Option<u64>,
    /// Last downstream counter processed from this peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_downstream: Option<u64>,
    /// Outbound window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowState>,
}

impl PeerRecord {
    fn counter(&self, direction: Direction) -> Option<u64> {
        match direction {
            Direction::Upstream => self.last_upstream,
            Direction::Downstream => self.last_downstream,
        }
    }

    fn counter_mut(&mut self, direction: Direction) -> &mut Option<u64> {
        match direction {
            Direction::Upstream => &mut self.last_upstream,
            Direction::Downstream => &mut self.last_downstream,
        }
    }

    /// Apply a compare-and-set; returns whether it took effect.
    fn compare_and_set(&mut self, direction: Direction, expected: Option<u64>, new: u64) -> bool {
        let slot = self.counter_mut(direction);
        if *slot != expected {
            return false;
        }
        *slot = Some(new);
        true
    }
}

/// Counter and window persistence.
pub trait StateStore: Send + Sync {
    /// Last counter processed from `peer` in `direction`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn counter(&self, peer: &PeerIdentity, direction: Direction) -> Result<Option<u64>>;

    /// Set the counter to `new` only if it currently equals `expected`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn compare_and_set_counter(
        &self,
        peer: &PeerIdentity,
        direction: Direction,
        expected: Option<u64>,
        new: u64,
    ) -> Result<bool>;

    /// Persisted window of `peer`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn window(&self, peer: &PeerIdentity) -> Result<Option<WindowState>>;

    /// Persist the window of `peer`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn set_window(&self, peer: &PeerIdentity, window: &WindowState) -> Result<()>;

    /// Every persisted window, for restoring at startup.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn windows(&self) -> Result<Vec<(PeerIdentity, WindowState)>>;
}

/// Crypto session record persistence.
pub trait SessionStore: Send + Sync {
    /// Load the record of `peer`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn load_session(&self, peer: &PeerIdentity) -> Result<Option<Vec<u8>>>;

    /// Replace the record of `peer`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn store_session(&self, peer: &PeerIdentity, record: &[u8]) -> Result<()>;
}

/// Write a file so readers see either the old or the new contents.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Read a file, mapping "not found" to `None`.
pub(crate) fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
