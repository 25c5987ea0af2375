//! In-memory stores, for tests and throwaway nodes.

use super::{PeerRecord, SessionStore, StateStore};
use crate::bundle_id::Direction;
use crate::error::Result;
use crate::window::WindowState;
use dashmap::DashMap;
use ddd_crypto::PeerIdentity;

/// Volatile [`StateStore`] and [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    peers: DashMap<PeerIdentity, PeerRecord>,
    sessions: DashMap<PeerIdentity, Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn counter(&self, peer: &PeerIdentity, direction: Direction) -> Result<Option<u64>> {
        Ok(self.peers.get(peer).and_then(|r| r.counter(direction)))
    }

    fn compare_and_set_counter(
        &self,
        peer: &PeerIdentity,
        direction: Direction,
        expected: Option<u64>,
        new: u64,
    ) -> Result<bool> {
        let mut record = self.peers.entry(peer.clone()).or_default();
        Ok(record.compare_and_set(direction, expected, new))
    }

    fn window(&self, peer: &PeerIdentity) -> Result<Option<WindowState>> {
        Ok(self.peers.get(peer).and_then(|r| r.window))
    }

    fn set_window(&self, peer: &PeerIdentity, window: &WindowState) -> Result<()> {
        self.peers.entry(peer.clone()).or_default().window = Some(*window);
        Ok(())
    }

    fn windows(&self) -> Result<Vec<(PeerIdentity, WindowState)>> {
        Ok(self
            .peers
            .iter()
            .filter_map(|r| r.window.map(|w| (r.key().clone(), w)))
            .collect())
    }
}

impl SessionStore for MemoryStore {
    fn load_session(&self, peer: &PeerIdentity) -> Result<Option<Vec<u8>>> {
        Ok(self.sessions.get(peer).map(|r| r.clone()))
    }

    fn store_session(&self, peer: &PeerIdentity, record: &[u8]) -> Result<()> {
        self.sessions.insert(peer.clone(), record.to_vec());
        Ok(())
    }
}
