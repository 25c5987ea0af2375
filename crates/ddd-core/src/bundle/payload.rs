//! Plaintext payload of a bundle.
//!
//! ```text
//! bundle.id              textual id, checked against the outer wire id
//! acknowledgement.txt    textual id of the last bundle received, or "HB"
//! routing.metadata       optional, opaque
//! adus/<app id>/<adu id> one entry per ADU
//! ```

use super::archive::{self, Entries};
use crate::adu::{Adu, validate_app_id};
use crate::bundle_id::BundleId;
use crate::error::{Error, Result};

const BUNDLE_ID: &str = "bundle.id";
const ACKNOWLEDGEMENT: &str = "acknowledgement.txt";
const ROUTING_METADATA: &str = "routing.metadata";
const ADU_PREFIX: &str = "adus/";

/// Acknowledgement text when nothing has been received yet.
pub const HEARTBEAT: &str = "HB";

/// Decrypted bundle contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Id of the bundle carrying this payload
    pub bundle_id: BundleId,
    /// Last bundle received from the recipient, if any
    pub ack: Option<BundleId>,
    /// Opaque routing hints
    pub routing: Option<Vec<u8>>,
    /// ADUs, ordered by app then id
    pub adus: Vec<Adu>,
}

impl Payload {
    /// Serialize into a deterministic tar archive.
    ///
    /// # Errors
    ///
    /// Archive write failure.
    pub fn to_archive(&self) -> Result<Vec<u8>> {
        let mut entries = Entries::new();
        entries.insert(BUNDLE_ID.into(), self.bundle_id.as_str().as_bytes().to_vec());
        let ack = self.ack.as_ref().map_or(HEARTBEAT, BundleId::as_str);
        entries.insert(ACKNOWLEDGEMENT.into(), ack.as_bytes().to_vec());
        if let Some(routing) = &self.routing {
            entries.insert(ROUTING_METADATA.into(), routing.clone());
        }
        for adu in &self.adus {
            entries.insert(
                format!("{ADU_PREFIX}{}/{}", adu.app_id, adu.id),
                adu.data.clone(),
            );
        }
        archive::write_entries(&entries)
    }

    /// Parse a decrypted payload archive.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedBundle`] or [`Error::InvalidBundleId`].
    pub fn from_archive(bytes: &[u8], max_size: u64) -> Result<Self> {
        let mut entries = archive::read_entries(bytes, max_size)?;
        let bundle_id = BundleId::parse(&archive::take_text(&mut entries, BUNDLE_ID)?)?;
        let ack = match archive::take_text(&mut entries, ACKNOWLEDGEMENT)?.as_str() {
            HEARTBEAT => None,
            text => Some(BundleId::parse(text)?),
        };
        let routing = entries.remove(ROUTING_METADATA);

        let mut adus = Vec::new();
        for (name, data) in entries {
            let Some(rest) = name.strip_prefix(ADU_PREFIX) else {
                return Err(Error::MalformedBundle(format!("unexpected entry {name}")));
            };
            let (app_id, id) = rest
                .split_once('/')
                .ok_or_else(|| Error::MalformedBundle(format!("bad ADU entry {name}")))?;
            validate_app_id(app_id)?;
            let id = id
                .parse::<u64>()
                .map_err(|_| Error::MalformedBundle(format!("bad ADU id in {name}")))?;
            adus.push(Adu {
                app_id: app_id.to_owned(),
                id,
                data,
            });
        }
        // Entry order is lexicographic; ids must be numeric order
        adus.sort_by(|a, b| a.app_id.cmp(&b.app_id).then(a.id.cmp(&b.id)));

        Ok(Self {
            bundle_id,
            ack,
            routing,
            adus,
        })
    }
}
