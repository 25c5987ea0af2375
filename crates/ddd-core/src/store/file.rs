//! Filesystem stores: one JSON file per peer for counters and window, one
//! binary file per peer for the session record.
//!
//! ```text
//! <root>/peers/<peer id>.json
//! <root>/sessions/<peer id>.session
//! ```

use super::{PeerRecord, SessionStore, StateStore, read_optional, write_atomic};
use crate::bundle_id::Direction;
use crate::error::Result;
use crate::window::WindowState;
use ddd_crypto::PeerIdentity;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Durable [`StateStore`] and [`SessionStore`] under a root directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    // Serializes read-modify-write of peer files.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store under `root`.
    ///
    /// # Errors
    ///
    /// Directory creation failures.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("peers"))?;
        std::fs::create_dir_all(root.join("sessions"))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn peer_path(&self, peer: &PeerIdentity) -> PathBuf {
        self.root.join("peers").join(format!("{peer}.json"))
    }

    fn session_path(&self, peer: &PeerIdentity) -> PathBuf {
        self.root.join("sessions").join(format!("{peer}.session"))
    }

    fn load(&self, peer: &PeerIdentity) -> Result<PeerRecord> {
        match read_optional(&self.peer_path(peer))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(PeerRecord::default()),
        }
    }

    fn update<T>(&self, peer: &PeerIdentity, f: impl FnOnce(&mut PeerRecord) -> T) -> Result<T> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut record = self.load(peer)?;
        let before = record.clone();
        let out = f(&mut record);
        if record != before {
            write_atomic(&self.peer_path(peer), &serde_json::to_vec_pretty(&record)?)?;
        }
        Ok(out)
    }
}

impl StateStore for FileStore {
    fn counter(&self, peer: &PeerIdentity, direction: Direction) -> Result<Option<u64>> {
        Ok(self.load(peer)?.counter(direction))
    }

    fn compare_and_set_counter(
        &self,
        peer: &PeerIdentity,
        direction: Direction,
        expected: Option<u64>,
        new: u64,
    ) -> Result<bool> {
        self.update(peer, |record| record.compare_and_set(direction, expected, new))
    }

    fn window(&self, peer: &PeerIdentity) -> Result<Option<WindowState>> {
        Ok(self.load(peer)?.window)
    }

    fn set_window(&self, peer: &PeerIdentity, window: &WindowState) -> Result<()> {
        self.update(peer, |record| record.window = Some(*window))
    }

    fn windows(&self) -> Result<Vec<(PeerIdentity, WindowState)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.root.join("peers"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let peer = match PeerIdentity::parse(stem) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!("Skipping state file {}: {e}", path.display());
                    continue;
                }
            };
            if let Some(window) = self.load(&peer)?.window {
                out.push((peer, window));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

impl SessionStore for FileStore {
    fn load_session(&self, peer: &PeerIdentity) -> Result<Option<Vec<u8>>> {
        Ok(read_optional(&self.session_path(peer))?)
    }

    fn store_session(&self, peer: &PeerIdentity, record: &[u8]) -> Result<()> {
        Ok(write_atomic(&self.session_path(peer), record)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddd_crypto::IdentityKeyPair;
    use rand_core::OsRng;
    use tempfile::TempDir;

    fn peer() -> PeerIdentity {
        IdentityKeyPair::generate(&mut OsRng).peer_id()
    }

    #[test]
    fn test_counters_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let p = peer();
        {
            let store = FileStore::open(dir.path()).unwrap();
            assert!(store
                .compare_and_set_counter(&p, Direction::Downstream, None, 4)
                .unwrap());
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.counter(&p, Direction::Downstream).unwrap(), Some(4));
        assert_eq!(store.counter(&p, Direction::Upstream).unwrap(), None);
        assert!(!store
            .compare_and_set_counter(&p, Direction::Downstream, Some(3), 5)
            .unwrap());
    }

    #[test]
    fn test_windows_listed() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let (a, b) = (peer(), peer());
        let state = WindowState {
            start: 1,
            end: 3,
            capacity: 3,
        };
        store.set_window(&a, &state).unwrap();
        store.set_window(&b, &state).unwrap();
        store
            .compare_and_set_counter(&peer(), Direction::Upstream, None, 0)
            .unwrap();

        let windows = store.windows().unwrap();
        assert_eq!(windows.len(), 2);
        assert!(windows.iter().all(|(_, w)| *w == state));
    }

    #[test]
    fn test_session_record() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let p = peer();
        assert!(store.load_session(&p).unwrap().is_none());
        store.store_session(&p, b"record").unwrap();
        assert_eq!(store.load_session(&p).unwrap().unwrap(), b"record");
    }
}
