//! Record of bundles sent and not yet acknowledged.
//!
//! ```text
//! <root>/<peer id>/<counter>.json    SentRecord
//! <root>/<peer id>/<counter>.bundle  bytes handed to the transport
//! <root>/<peer id>/last.json         most recent SentRecord, kept after eviction
//! ```
//!
//! The bytes make retransmission exact. If they are lost, the record holds
//! enough to rebuild the bundle under the same wire id.

use crate::bundle_id::BundleId;
use crate::error::Result;
use crate::store::{read_optional, write_atomic};
use ddd_crypto::PeerIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const LAST_RECORD: &str = "last.json";

/// Inclusive range of ADU ids of one app carried by a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AduRange {
    /// First id
    pub first: u64,
    /// Last id
    pub last: u64,
}

/// What an emitted bundle contained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRecord {
    /// Bundle counter
    pub counter: u64,
    /// Plaintext id
    pub bundle_id: BundleId,
    /// Encrypted id, also the transport-visible name
    pub wire_id: String,
    /// Acknowledgement carried
    pub ack: Option<BundleId>,
    /// ADU ids per app
    pub adus: BTreeMap<String, AduRange>,
}

impl SentRecord {
    /// Whether a bundle with `ack` and `adus` would carry the same content.
    #[must_use]
    pub fn same_contents(&self, ack: Option<&BundleId>, adus: &BTreeMap<String, AduRange>) -> bool {
        self.ack.as_ref() == ack && &self.adus == adus
    }
}

/// Per-peer sent bundle ledger.
#[derive(Debug, Clone)]
pub struct SentLedger {
    root: PathBuf,
}

impl SentLedger {
    /// Open (creating if needed) a ledger under `root`.
    ///
    /// # Errors
    ///
    /// Directory creation failure.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn peer_dir(&self, peer: &PeerIdentity) -> PathBuf {
        self.root.join(peer.as_str())
    }

    fn record_path(dir: &Path, counter: u64) -> PathBuf {
        dir.join(format!("{counter}.json"))
    }

    fn bytes_path(dir: &Path, counter: u64) -> PathBuf {
        dir.join(format!("{counter}.bundle"))
    }

    /// Persist a freshly emitted bundle.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn record(&self, peer: &PeerIdentity, record: &SentRecord, bytes: &[u8]) -> Result<()> {
        let dir = self.peer_dir(peer);
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&Self::bytes_path(&dir, record.counter), bytes)?;
        write_atomic(&Self::record_path(&dir, record.counter), &json)?;
        write_atomic(&dir.join(LAST_RECORD), &json)?;
        Ok(())
    }

    /// Replace the cached bytes of a rebuilt bundle.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn cache_bytes(&self, peer: &PeerIdentity, counter: u64, bytes: &[u8]) -> Result<()> {
        write_atomic(&Self::bytes_path(&self.peer_dir(peer), counter), bytes)?;
        Ok(())
    }

    /// Record of bundle `counter`, if still in the ledger.
    ///
    /// # Errors
    ///
    /// Storage failures or a corrupt record.
    pub fn get(&self, peer: &PeerIdentity, counter: u64) -> Result<Option<SentRecord>> {
        read_record(&Self::record_path(&self.peer_dir(peer), counter))
    }

    /// Cached bytes of bundle `counter`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn bytes(&self, peer: &PeerIdentity, counter: u64) -> Result<Option<Vec<u8>>> {
        Ok(read_optional(&Self::bytes_path(&self.peer_dir(peer), counter))?)
    }

    /// Most recently emitted bundle, acknowledged or not.
    ///
    /// # Errors
    ///
    /// Storage failures or a corrupt record.
    pub fn last(&self, peer: &PeerIdentity) -> Result<Option<SentRecord>> {
        read_record(&self.peer_dir(peer).join(LAST_RECORD))
    }

    /// Drop acknowledged bundles; returns the records that were present.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn evict(&self, peer: &PeerIdentity, counters: &[u64]) -> Result<Vec<SentRecord>> {
        let dir = self.peer_dir(peer);
        let mut evicted = Vec::new();
        for &counter in counters {
            if let Some(record) = read_record(&Self::record_path(&dir, counter))? {
                evicted.push(record);
            }
            remove_if_present(&Self::bytes_path(&dir, counter))?;
            remove_if_present(&Self::record_path(&dir, counter))?;
        }
        if !evicted.is_empty() {
            debug!("Evicted {} sent bundles for {peer}", evicted.len());
        }
        Ok(evicted)
    }
}

/// Highest ADU id per app across `records`.
#[must_use]
pub fn highest_adus(records: &[SentRecord]) -> BTreeMap<String, u64> {
    let mut highest = BTreeMap::new();
    for record in records {
        for (app, range) in &record.adus {
            let entry = highest.entry(app.clone()).or_insert(0);
            *entry = range.last.max(*entry);
        }
    }
    highest
}

fn read_record(path: &Path) -> Result<Option<SentRecord>> {
    match read_optional(path)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle_id::Direction;
    use ddd_crypto::IdentityKeyPair;
    use rand_core::OsRng;
    use tempfile::TempDir;

    fn record(peer: &PeerIdentity, counter: u64, mail_last: u64) -> SentRecord {
        let mut adus = BTreeMap::new();
        adus.insert(
            "mail".to_owned(),
            AduRange {
                first: 1,
                last: mail_last,
            },
        );
        SentRecord {
            counter,
            bundle_id: BundleId::encode(peer, counter, Direction::Downstream).unwrap(),
            wire_id: format!("wire{counter}"),
            ack: None,
            adus,
        }
    }

    #[test]
    fn test_record_and_evict() {
        let dir = TempDir::new().unwrap();
        let ledger = SentLedger::open(dir.path()).unwrap();
        let peer = IdentityKeyPair::generate(&mut OsRng).peer_id();

        ledger.record(&peer, &record(&peer, 0, 2), b"zero").unwrap();
        ledger.record(&peer, &record(&peer, 1, 5), b"one").unwrap();
        assert_eq!(ledger.bytes(&peer, 1).unwrap().unwrap(), b"one");
        assert_eq!(ledger.last(&peer).unwrap().unwrap().counter, 1);

        let evicted = ledger.evict(&peer, &[0, 1]).unwrap();
        assert_eq!(evicted.len(), 2);
        assert_eq!(highest_adus(&evicted)["mail"], 5);
        assert!(ledger.get(&peer, 0).unwrap().is_none());
        assert!(ledger.bytes(&peer, 1).unwrap().is_none());
        // The last record outlives eviction
        assert_eq!(ledger.last(&peer).unwrap().unwrap().counter, 1);
        assert!(ledger.evict(&peer, &[0]).unwrap().is_empty());
    }

    #[test]
    fn test_same_contents() {
        let peer = IdentityKeyPair::generate(&mut OsRng).peer_id();
        let r = record(&peer, 3, 4);
        assert!(r.same_contents(None, &r.adus.clone()));
        let ack = BundleId::encode(&peer, 0, Direction::Upstream).unwrap();
        assert!(!r.same_contents(Some(&ack), &r.adus.clone()));
        assert!(!r.same_contents(None, &BTreeMap::new()));
    }
}
