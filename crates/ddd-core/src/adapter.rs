//! Application adapter boundary.
//!
//! Applications own app ids. The transmission pulls what they produced when
//! it builds a bundle ([`ApplicationAdapter::collect`]) and pushes what
//! arrived after an inbound bundle is committed
//! ([`ApplicationAdapter::deliver`]). The same arrivals are published as
//! [`AduEvent`]s, closed by an [`AduEvent::AllAppsProcessed`] sentinel so
//! listeners can batch per bundle.

use crate::adu::Adu;
use crate::error::Result;
use ddd_crypto::PeerIdentity;

/// Capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An application on the other side of the ADU store.
pub trait ApplicationAdapter: Send + Sync {
    /// App id this adapter owns.
    fn app_id(&self) -> &str;

    /// Payloads produced for `peer` since the last call.
    ///
    /// # Errors
    ///
    /// Adapter specific; the transmission logs and skips the adapter.
    fn collect(&self, peer: &PeerIdentity) -> Result<Vec<Vec<u8>>>;

    /// ADUs that arrived from `peer`, in id order.
    ///
    /// # Errors
    ///
    /// Adapter specific; the ADUs stay in the receive store either way.
    fn deliver(&self, peer: &PeerIdentity, adus: &[Adu]) -> Result<()>;
}

/// Notification of inbound ADUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AduEvent {
    /// New ADUs for one app
    Arrived {
        /// Sender
        peer: PeerIdentity,
        /// App the ADUs belong to
        app_id: String,
        /// Ids stored, ascending
        adu_ids: Vec<u64>,
    },
    /// Every app of one bundle has been notified
    AllAppsProcessed {
        /// Sender
        peer: PeerIdentity,
    },
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Adapter that hands out queued payloads and records deliveries.
    #[derive(Default)]
    pub(crate) struct QueueAdapter {
        pub(crate) app_id: String,
        pub(crate) outgoing: Mutex<Vec<Vec<u8>>>,
        pub(crate) delivered: Mutex<Vec<(PeerIdentity, Adu)>>,
    }

    impl QueueAdapter {
        pub(crate) fn new(app_id: &str) -> Self {
            Self {
                app_id: app_id.to_owned(),
                ..Self::default()
            }
        }
    }

    impl ApplicationAdapter for QueueAdapter {
        fn app_id(&self) -> &str {
            &self.app_id
        }

        fn collect(&self, _peer: &PeerIdentity) -> Result<Vec<Vec<u8>>> {
            Ok(std::mem::take(&mut *self.outgoing.lock().unwrap()))
        }

        fn deliver(&self, peer: &PeerIdentity, adus: &[Adu]) -> Result<()> {
            let mut delivered = self.delivered.lock().unwrap();
            delivered.extend(adus.iter().map(|a| (peer.clone(), a.clone())));
            Ok(())
        }
    }
}
