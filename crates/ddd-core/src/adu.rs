//! Application data unit store.
//!
//! Append-only, per (peer, app) storage of ADUs, one instance per direction:
//!
//! ```text
//! <root>/<peer id>/<app id>/<adu id>.adu
//! <root>/<peer id>/<app id>/metadata.json
//! ```
//!
//! ADU ids start at 1 and are gapless per (peer, app). The next id comes from
//! the files on disk and the `last_added` high-water mark, never from memory
//! alone, so a retried append after a crash yields the same sequence and a
//! deletion never causes an id to be reused.

use crate::error::{Error, Result};
use crate::store::{read_optional, write_atomic};
use ddd_crypto::PeerIdentity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const ADU_EXTENSION: &str = "adu";
const METADATA_FILE: &str = "metadata.json";

/// One application data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    /// Owning application
    pub app_id: String,
    /// Position in the (peer, app) sequence
    pub id: u64,
    /// Payload
    pub data: Vec<u8>,
}

impl Adu {
    /// Size counted against the payload budget.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
struct AppMetadata {
    last_added: u64,
    last_deleted: u64,
}

/// Reject app ids that could escape the store directory.
///
/// # Errors
///
/// [`Error::InvalidAppId`].
pub fn validate_app_id(app_id: &str) -> Result<()> {
    let ok = !app_id.is_empty()
        && app_id.len() <= 255
        && app_id != "."
        && app_id != ".."
        && app_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidAppId(app_id.to_owned()))
    }
}

/// Durable ADU storage for one direction.
#[derive(Debug)]
pub struct AduStore {
    root: PathBuf,
    // Serializes id allocation across callers.
    lock: Mutex<()>,
}

impl AduStore {
    /// Open (creating if needed) a store under `root`.
    ///
    /// # Errors
    ///
    /// Directory creation failures.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn app_dir(&self, peer: &PeerIdentity, app_id: &str) -> Result<PathBuf> {
        validate_app_id(app_id)?;
        Ok(self.root.join(peer.as_str()).join(app_id))
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Append a new ADU produced locally; returns its id.
    ///
    /// # Errors
    ///
    /// Invalid app id or storage failure.
    pub fn append(&self, peer: &PeerIdentity, app_id: &str, data: &[u8]) -> Result<u64> {
        let dir = self.app_dir(peer, app_id)?;
        let _guard = self.guard();
        let mut meta = load_metadata(&dir)?;
        let id = meta.last_added.max(scan_ids(&dir)?.last().copied().unwrap_or(0)) + 1;

        write_atomic(&adu_path(&dir, id), data)?;
        meta.last_added = id;
        store_metadata(&dir, &meta)?;
        debug!("Stored ADU {app_id}/{id} for {peer} ({} bytes)", data.len());
        Ok(id)
    }

    /// Store an ADU received from `peer` under the sender's id.
    ///
    /// Returns `false` (and stores nothing) if an ADU with this id or a later
    /// one was already stored, so redelivery never double counts.
    ///
    /// # Errors
    ///
    /// Invalid app id or storage failure.
    pub fn append_with_id(
        &self,
        peer: &PeerIdentity,
        app_id: &str,
        id: u64,
        data: &[u8],
    ) -> Result<bool> {
        let dir = self.app_dir(peer, app_id)?;
        let _guard = self.guard();
        let mut meta = load_metadata(&dir)?;
        let highest = meta.last_added.max(scan_ids(&dir)?.last().copied().unwrap_or(0));
        if id <= highest {
            return Ok(false);
        }

        write_atomic(&adu_path(&dir, id), data)?;
        meta.last_added = id;
        store_metadata(&dir, &meta)?;
        Ok(true)
    }

    /// ADUs with id `>= start`, ascending, read lazily.
    ///
    /// # Errors
    ///
    /// Invalid app id or a directory listing failure.
    pub fn read_from(&self, peer: &PeerIdentity, app_id: &str, start: u64) -> Result<AduIter> {
        let dir = self.app_dir(peer, app_id)?;
        let ids: Vec<u64> = scan_ids(&dir)?.into_iter().filter(|id| *id >= start).collect();
        Ok(AduIter {
            dir,
            app_id: app_id.to_owned(),
            ids: ids.into_iter(),
        })
    }

    /// Remove every ADU with id `<= up_to`; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Invalid app id or storage failure.
    pub fn delete_up_to(&self, peer: &PeerIdentity, app_id: &str, up_to: u64) -> Result<usize> {
        let dir = self.app_dir(peer, app_id)?;
        let _guard = self.guard();
        let mut removed = 0;
        for id in scan_ids(&dir)?.into_iter().take_while(|id| *id <= up_to) {
            match std::fs::remove_file(adu_path(&dir, id)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let mut meta = load_metadata(&dir)?;
        if up_to > meta.last_deleted {
            meta.last_deleted = up_to;
            store_metadata(&dir, &meta)?;
        }
        if removed > 0 {
            debug!("Deleted {removed} ADUs of {app_id} for {peer} up to {up_to}");
        }
        Ok(removed)
    }

    /// Highest id ever stored for (peer, app), 0 if none.
    ///
    /// # Errors
    ///
    /// Invalid app id or storage failure.
    pub fn last_added(&self, peer: &PeerIdentity, app_id: &str) -> Result<u64> {
        let dir = self.app_dir(peer, app_id)?;
        let meta = load_metadata(&dir)?;
        Ok(meta.last_added.max(scan_ids(&dir)?.last().copied().unwrap_or(0)))
    }

    /// Apps with a directory for `peer`, sorted.
    ///
    /// # Errors
    ///
    /// Directory listing failure.
    pub fn apps(&self, peer: &PeerIdentity) -> Result<Vec<String>> {
        let dir = self.root.join(peer.as_str());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut apps = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_app_id(name).is_ok() {
                    apps.push(name.to_owned());
                }
            }
        }
        apps.sort();
        Ok(apps)
    }
}

/// Lazy, ordered sequence of stored ADUs.
#[derive(Debug)]
pub struct AduIter {
    dir: PathBuf,
    app_id: String,
    ids: std::vec::IntoIter<u64>,
}

impl Iterator for AduIter {
    type Item = Result<Adu>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.ids.next()?;
            match read_optional(&adu_path(&self.dir, id)) {
                Ok(Some(data)) => {
                    return Some(Ok(Adu {
                        app_id: self.app_id.clone(),
                        id,
                        data,
                    }));
                }
                // Deleted after the listing was taken
                Ok(None) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

fn adu_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id}.{ADU_EXTENSION}"))
}

fn scan_ids(dir: &Path) -> Result<Vec<u64>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ADU_EXTENSION) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn load_metadata(dir: &Path) -> Result<AppMetadata> {
    match read_optional(&dir.join(METADATA_FILE))? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(AppMetadata::default()),
    }
}

fn store_metadata(dir: &Path, meta: &AppMetadata) -> Result<()> {
    write_atomic(&dir.join(METADATA_FILE), &serde_json::to_vec_pretty(meta)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddd_crypto::IdentityKeyPair;
    use rand_core::OsRng;
    use tempfile::TempDir;

    fn setup() -> (TempDir, AduStore, PeerIdentity) {
        let dir = TempDir::new().unwrap();
        let store = AduStore::open(dir.path()).unwrap();
        (dir, store, IdentityKeyPair::generate(&mut OsRng).peer_id())
    }

    fn ids(store: &AduStore, p: &PeerIdentity, app: &str, start: u64) -> Vec<u64> {
        store
            .read_from(p, app, start)
            .unwrap()
            .map(|a| a.unwrap().id)
            .collect()
    }

    #[test]
    fn test_append_read_delete() {
        let (_dir, store, p) = setup();
        assert_eq!(store.append(&p, "mail", b"b1").unwrap(), 1);
        assert_eq!(store.append(&p, "mail", b"b2").unwrap(), 2);

        let adus: Vec<Adu> = store
            .read_from(&p, "mail", 1)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(adus.len(), 2);
        assert_eq!(adus[0].data, b"b1");
        assert_eq!(adus[1].id, 2);

        assert_eq!(store.delete_up_to(&p, "mail", 1).unwrap(), 1);
        assert_eq!(ids(&store, &p, "mail", 1), vec![2]);
    }

    #[test]
    fn test_read_is_restartable() {
        let (_dir, store, p) = setup();
        for i in 0..4u8 {
            store.append(&p, "chat", &[i]).unwrap();
        }
        assert_eq!(ids(&store, &p, "chat", 2), vec![2, 3, 4]);
        assert_eq!(ids(&store, &p, "chat", 2), vec![2, 3, 4]);
        assert!(ids(&store, &p, "chat", 9).is_empty());
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let (_dir, store, p) = setup();
        store.append(&p, "mail", b"1").unwrap();
        store.append(&p, "mail", b"2").unwrap();
        store.delete_up_to(&p, "mail", 2).unwrap();
        assert_eq!(store.append(&p, "mail", b"3").unwrap(), 3);
    }

    #[test]
    fn test_id_survives_reopen() {
        let (dir, store, p) = setup();
        store.append(&p, "mail", b"1").unwrap();
        drop(store);
        let store = AduStore::open(dir.path()).unwrap();
        assert_eq!(store.append(&p, "mail", b"2").unwrap(), 2);
    }

    #[test]
    fn test_append_with_id_deduplicates() {
        let (_dir, store, p) = setup();
        assert!(store.append_with_id(&p, "mail", 1, b"a").unwrap());
        assert!(store.append_with_id(&p, "mail", 2, b"b").unwrap());
        assert!(!store.append_with_id(&p, "mail", 2, b"b").unwrap());
        assert!(!store.append_with_id(&p, "mail", 1, b"a").unwrap());
        assert_eq!(ids(&store, &p, "mail", 0), vec![1, 2]);
        assert_eq!(store.last_added(&p, "mail").unwrap(), 2);
    }

    #[test]
    fn test_apps_are_isolated() {
        let (_dir, store, p) = setup();
        store.append(&p, "mail", b"m").unwrap();
        store.append(&p, "chat", b"c").unwrap();
        assert_eq!(store.apps(&p).unwrap(), vec!["chat", "mail"]);
        assert_eq!(store.append(&p, "chat", b"c2").unwrap(), 2);
    }

    #[test]
    fn test_app_id_validation() {
        let (_dir, store, p) = setup();
        assert!(matches!(
            store.append(&p, "../etc", b"x"),
            Err(Error::InvalidAppId(_))
        ));
        assert!(validate_app_id("com.example.mail").is_ok());
        assert!(validate_app_id("").is_err());
    }
}
