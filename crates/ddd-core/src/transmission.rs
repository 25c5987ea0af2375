//! Bundle transmission orchestrator.
//!
//! [`BundleTransmission`] composes the window, the ADU stores, the sent
//! ledger and the per-peer crypto contexts into the two operations a
//! transport needs:
//!
//! - [`bundle_to_send_for`](BundleTransmission::bundle_to_send_for): what,
//!   if anything, to hand over for a peer
//! - [`ingest`](BundleTransmission::ingest): consume bytes a transport
//!   delivered
//!
//! # Outbound
//!
//! ```text
//! window full?                 -> resend the latest bundle, byte for byte
//! candidate = ack + ADUs (greedy within max_payload_size and the
//!             archive footprint the receiver accepts)
//! candidate == last emitted?   -> resend it if still in flight, else nothing
//! no ADUs and ack unchanged?   -> nothing
//! otherwise                    -> mint the next id, encrypt, record, emit
//! ```
//!
//! # Inbound
//!
//! Unwrap the sender identity (failure: not addressed to us), decrypt the
//! wire id and drop anything not newer than the last counter processed,
//! decrypt and verify every chunk on a copy of the session, check the inner
//! id, then commit: ADUs, acknowledgement, counter, session. Until the
//! commit nothing is persisted.
//!
//! Every step for one peer runs under that peer's lock; different peers
//! proceed in parallel.

use crate::adapter::{AduEvent, ApplicationAdapter, EVENT_CHANNEL_CAPACITY};
use crate::adu::{Adu, AduIter, AduStore};
use crate::bundle::ledger::highest_adus;
use crate::bundle::archive;
use crate::bundle::sealed::{self, SealedBundle};
use crate::bundle::{AduRange, BUNDLE_EXTENSION, Payload, SentLedger, SentRecord};
use crate::bundle_id::{BundleId, Direction};
use crate::config::{Role, TransmissionConfig};
use crate::error::{Error, Result, WindowError};
use crate::keystore::LocalKeys;
use crate::registry::{PeerContext, SessionRegistry};
use crate::store::{FileStore, SessionStore, StateStore};
use crate::window::{WindowState, WindowTable};
use dashmap::DashMap;
use ddd_crypto::PeerIdentity;
use ddd_crypto::wrap;
use ddd_crypto::x25519::PublicKey;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Archive room kept for the id and acknowledgement entries of a payload.
const FIXED_ENTRIES_FOOTPRINT: u64 = 4 * 1024;

/// A bundle ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBundle {
    /// Recipient
    pub peer: PeerIdentity,
    /// Plaintext id
    pub bundle_id: BundleId,
    /// Bundle counter
    pub counter: u64,
    /// Encrypted id
    pub wire_id: String,
    /// Bytes to carry
    pub bytes: Vec<u8>,
    /// Whether this bundle was emitted before
    pub retransmission: bool,
}

impl OutboundBundle {
    /// File name a transport stores the bundle under.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.{BUNDLE_EXTENSION}", self.wire_id)
    }
}

/// What a transport should pick up and drop, see
/// [`BundleTransmission::bundles_for_transport`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportExchange {
    /// Bundles the transport does not hold yet, sorted by peer
    pub bundles: Vec<OutboundBundle>,
    /// Wire ids the transport holds that are superseded or acknowledged
    pub to_delete: BTreeSet<String>,
}

/// Result of ingesting one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Bundle applied
    Processed {
        /// Sender
        peer: PeerIdentity,
        /// Id of the bundle
        bundle_id: BundleId,
        /// Its counter
        counter: u64,
        /// ADUs newly stored
        stored: usize,
        /// Our counter the sender acknowledged, if any
        acked: Option<u64>,
    },
    /// Counter not newer than the last processed from this peer
    Duplicate {
        /// Sender
        peer: PeerIdentity,
        /// Counter of the redelivered bundle
        counter: u64,
    },
    /// Bundle addressed to someone else
    NotForUs,
    /// Sender is not a peer this node talks to
    UnknownPeer {
        /// Sender
        peer: PeerIdentity,
    },
}

/// Orchestrator for one node. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BundleTransmission {
    inner: Arc<TransmissionInner>,
}

struct TransmissionInner {
    config: TransmissionConfig,
    keys: Arc<LocalKeys>,
    local: PeerIdentity,
    state: Arc<dyn StateStore>,
    registry: SessionRegistry,
    windows: WindowTable,
    send_store: AduStore,
    receive_store: AduStore,
    ledger: SentLedger,
    adapters: DashMap<String, Arc<dyn ApplicationAdapter>>,
    events: broadcast::Sender<AduEvent>,
}

impl std::fmt::Debug for BundleTransmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleTransmission")
            .field("role", &self.inner.config.role)
            .field("local", &self.inner.local)
            .field("windows", &self.inner.windows)
            .finish_non_exhaustive()
    }
}

impl BundleTransmission {
    /// Open the node whose state lives under `config.state_dir`.
    ///
    /// # Errors
    ///
    /// Invalid configuration, keys of the wrong role, or storage failures.
    pub fn open(config: TransmissionConfig, keys: LocalKeys) -> Result<Self> {
        let store = Arc::new(FileStore::open(config.state_dir.join("state"))?);
        Self::with_stores(config, keys, store.clone(), store)
    }

    /// Like [`open`](Self::open) with caller-supplied counter and session
    /// stores. ADUs and the sent ledger still live under `state_dir`.
    ///
    /// # Errors
    ///
    /// Invalid configuration, keys of the wrong role, or storage failures.
    pub fn with_stores(
        config: TransmissionConfig,
        keys: LocalKeys,
        state: Arc<dyn StateStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        config.validate()?;
        if keys.role() != config.role {
            return Err(Error::Config(format!(
                "configured as {} but loaded {} keys",
                config.role,
                keys.role()
            )));
        }
        let keys = Arc::new(keys);
        let local = keys.peer_id();
        let dir = &config.state_dir;

        let windows = WindowTable::restore(state.clone(), config.role.outgoing(), local.clone())?;
        let registry = SessionRegistry::new(keys.clone(), sessions, config.id_kdf);
        if let LocalKeys::Client { server, .. } = keys.as_ref() {
            registry.connect_server()?;
            let server = server.identity.peer_id();
            if !windows.contains(&server) {
                windows.add_client(&server, config.window_capacity)?;
            }
        }

        let inner = TransmissionInner {
            send_store: AduStore::open(dir.join("send"))?,
            receive_store: AduStore::open(dir.join("receive"))?,
            ledger: SentLedger::open(dir.join("sent"))?,
            config,
            keys,
            local,
            state,
            registry,
            windows,
            adapters: DashMap::new(),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        };
        info!(
            "Opened {} {} with {} known peers",
            inner.config.role,
            inner.local,
            inner.windows.peers().len()
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Identifier of this node.
    #[must_use]
    pub fn local_id(&self) -> &PeerIdentity {
        &self.inner.local
    }

    /// Role of this node.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.config.role
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &TransmissionConfig {
        &self.inner.config
    }

    /// The provisioned server, on a client.
    #[must_use]
    pub fn server_peer(&self) -> Option<PeerIdentity> {
        match self.inner.keys.as_ref() {
            LocalKeys::Client { server, .. } => Some(server.identity.peer_id()),
            LocalKeys::Server(_) => None,
        }
    }

    /// Peers with a window, sorted.
    #[must_use]
    pub fn known_peers(&self) -> Vec<PeerIdentity> {
        self.inner.windows.peers()
    }

    /// Window counters of `peer`.
    ///
    /// # Errors
    ///
    /// [`WindowError::ClientWindowNotFound`].
    pub fn window_state(&self, peer: &PeerIdentity) -> Result<WindowState> {
        self.inner.windows.state(peer)
    }

    /// Register the adapter owning an app id, replacing any previous one.
    pub fn register_adapter(&self, adapter: Arc<dyn ApplicationAdapter>) {
        info!("Registered adapter for {}", adapter.app_id());
        self.inner
            .adapters
            .insert(adapter.app_id().to_owned(), adapter);
    }

    /// Subscribe to inbound ADU notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AduEvent> {
        self.inner.events.subscribe()
    }

    /// Queue an ADU for `peer`; returns its id.
    ///
    /// # Errors
    ///
    /// Invalid app id or storage failure.
    pub fn enqueue_adu(&self, peer: &PeerIdentity, app_id: &str, data: &[u8]) -> Result<u64> {
        self.inner.send_store.append(peer, app_id, data)
    }

    /// ADUs received from `peer` for `app_id`, from `start` on.
    ///
    /// # Errors
    ///
    /// Invalid app id or storage failure.
    pub fn received_adus(&self, peer: &PeerIdentity, app_id: &str, start: u64) -> Result<AduIter> {
        self.inner.receive_store.read_from(peer, app_id, start)
    }

    /// ADUs queued for `peer` and not yet acknowledged.
    ///
    /// # Errors
    ///
    /// Invalid app id or storage failure.
    pub fn pending_adus(&self, peer: &PeerIdentity, app_id: &str) -> Result<AduIter> {
        self.inner.send_store.read_from(peer, app_id, 0)
    }

    /// Decide what to hand a transport for `peer`.
    ///
    /// # Errors
    ///
    /// [`Error::SessionNotFound`] for a peer never heard from, or storage
    /// and crypto failures; nothing is recorded as sent on error.
    pub async fn bundle_to_send_for(&self, peer: &PeerIdentity) -> Result<Option<OutboundBundle>> {
        let handle = self
            .inner
            .registry
            .get(peer)?
            .ok_or_else(|| Error::SessionNotFound(peer.clone()))?;
        let mut context = handle.lock().await;
        self.inner.outbound(&mut context)
    }

    /// [`bundle_to_send_for`](Self::bundle_to_send_for) for many peers at
    /// once, one task per peer. Results are sorted by peer.
    pub async fn bundles_for_peers(
        &self,
        peers: &[PeerIdentity],
    ) -> Vec<(PeerIdentity, Result<Option<OutboundBundle>>)> {
        let mut tasks = JoinSet::new();
        for peer in peers {
            let this = self.clone();
            let peer = peer.clone();
            tasks.spawn(async move {
                let result = this.bundle_to_send_for(&peer).await;
                (peer, result)
            });
        }

        let mut results = Vec::with_capacity(peers.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("Bundle generation task failed: {e}"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Bundles for a transport that already holds the bundles named by the
    /// wire ids in `held`.
    ///
    /// For each peer, the bundle [`bundle_to_send_for`] picks is skipped if
    /// the transport holds it; every other held bundle of ours for that peer
    /// is superseded and lands in `to_delete`. Held ids that belong to none
    /// of `peers` are left alone. A peer that fails is logged and skipped.
    ///
    /// [`bundle_to_send_for`]: Self::bundle_to_send_for
    pub async fn bundles_for_transport(
        &self,
        peers: &[PeerIdentity],
        held: &BTreeSet<String>,
    ) -> TransportExchange {
        let held = Arc::new(held.clone());
        let mut tasks = JoinSet::new();
        for peer in peers {
            let this = self.clone();
            let peer = peer.clone();
            let held = held.clone();
            tasks.spawn(async move {
                let result = this.exchange_for(&peer, &held).await;
                (peer, result)
            });
        }

        let mut results = Vec::with_capacity(peers.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer, Ok(exchange))) => results.push((peer, exchange)),
                Ok((peer, Err(e))) => warn!("No bundle for transport to {peer}: {e}"),
                Err(e) => warn!("Bundle generation task failed: {e}"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut exchange = TransportExchange::default();
        for (_, (bundle, stale)) in results {
            exchange.bundles.extend(bundle);
            exchange.to_delete.extend(stale);
        }
        exchange
    }

    async fn exchange_for(
        &self,
        peer: &PeerIdentity,
        held: &BTreeSet<String>,
    ) -> Result<(Option<OutboundBundle>, BTreeSet<String>)> {
        let handle = self
            .inner
            .registry
            .get(peer)?
            .ok_or_else(|| Error::SessionNotFound(peer.clone()))?;
        let mut context = handle.lock().await;
        let bundle = self.inner.outbound(&mut context)?;
        let mut stale = self.inner.held_for(&context, held);
        let bundle = match bundle {
            Some(bundle) if stale.remove(&bundle.wire_id) => {
                debug!("Transport already holds bundle {} for {peer}", bundle.counter);
                None
            }
            other => other,
        };
        Ok((bundle, stale))
    }

    /// Process bytes a transport delivered.
    ///
    /// Bundles for someone else, from unknown senders, or already processed
    /// are reported as outcomes, not errors.
    ///
    /// # Errors
    ///
    /// Local errors ([`Error::is_local`]) for a corrupt or forged bundle;
    /// storage failures. No state is changed in either case.
    pub async fn ingest(&self, bytes: &[u8]) -> Result<IngestOutcome> {
        let inner = &self.inner;
        let sealed = SealedBundle::from_bytes(bytes, inner.config.role.peer(), inner.bundle_limit())?;
        let own = inner.keys.identity();

        let identity = match wrap::unwrap_identity(&sealed.sender_identity, own) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Dropping bundle not addressed to {}: {e}", inner.local);
                return Ok(IngestOutcome::NotForUs);
            }
        };
        let client_base = sealed
            .client_base
            .as_deref()
            .map(|text| wrap::unwrap(text, own).map(PublicKey::from_bytes))
            .transpose()?;

        let peer = identity.peer_id();
        let Some(handle) = inner.registry.accept(&identity, client_base.as_ref())? else {
            warn!("Dropping bundle from unknown peer {peer}");
            return Ok(IngestOutcome::UnknownPeer { peer });
        };
        let outcome = {
            let mut context = handle.lock().await;
            inner.inbound(&mut context, &sealed)
        };
        let committed = matches!(outcome, Ok(IngestOutcome::Processed { .. }));
        inner.registry.settle(&peer, &handle, committed);
        outcome
    }
}

impl TransmissionInner {
    fn outgoing(&self) -> Direction {
        self.config.role.outgoing()
    }

    fn incoming(&self) -> Direction {
        self.config.role.incoming()
    }

    fn bundle_limit(&self) -> u64 {
        self.config.payload_limit().saturating_mul(2)
    }

    /// Client id embedded in bundle ids exchanged with `peer`.
    fn client_of(&self, peer: &PeerIdentity) -> PeerIdentity {
        match self.config.role {
            Role::Client => self.local.clone(),
            Role::Server => peer.clone(),
        }
    }

    fn outbound(&self, context: &mut PeerContext) -> Result<Option<OutboundBundle>> {
        let peer = context.peer().clone();
        self.collect_from_adapters(&peer)?;

        let window = self.windows.state(&peer)?;
        if window.is_full() {
            let counter = window.end.wrapping_sub(1);
            debug!("Window for {peer} is full, resending bundle {counter}");
            return self.resend(context, counter).map(Some);
        }

        let ack = self.current_ack(&peer)?;
        let (adus, ranges) = self.candidate_adus(&peer)?;
        match self.ledger.last(&peer)? {
            Some(last) if last.same_contents(ack.as_ref(), &ranges) => {
                let offset = last.counter.wrapping_sub(window.start);
                if offset < window.in_flight() {
                    debug!("Nothing new for {peer}, resending bundle {}", last.counter);
                    return self.resend(context, last.counter).map(Some);
                }
                debug!("Nothing new for {peer}");
                return Ok(None);
            }
            Some(last) if adus.is_empty() && last.ack == ack => {
                debug!("Nothing new for {peer}");
                return Ok(None);
            }
            None if adus.is_empty() && ack.is_none() => {
                debug!("Nothing to send to {peer}");
                return Ok(None);
            }
            _ => {}
        }
        self.emit(context, ack, adus, ranges).map(Some)
    }

    fn collect_from_adapters(&self, peer: &PeerIdentity) -> Result<()> {
        let adapters: Vec<Arc<dyn ApplicationAdapter>> =
            self.adapters.iter().map(|e| e.value().clone()).collect();
        for adapter in adapters {
            let payloads = match adapter.collect(peer) {
                Ok(payloads) => payloads,
                Err(e) => {
                    warn!("Adapter {} failed to produce ADUs: {e}", adapter.app_id());
                    continue;
                }
            };
            for payload in payloads {
                self.send_store.append(peer, adapter.app_id(), &payload)?;
            }
        }
        Ok(())
    }

    /// Acknowledgement owed to `peer`: the last bundle processed from it.
    fn current_ack(&self, peer: &PeerIdentity) -> Result<Option<BundleId>> {
        let incoming = self.incoming();
        self.state
            .counter(peer, incoming)?
            .map(|counter| BundleId::encode(&self.client_of(peer), counter, incoming))
            .transpose()
    }

    /// Unacknowledged ADUs, app by app, until the first that does not fit.
    ///
    /// Two budgets apply: the ADU bytes against `max_payload_size`, and the
    /// archive footprint of the ADU entries against what the receiver accepts.
    fn candidate_adus(&self, peer: &PeerIdentity) -> Result<(Vec<Adu>, BTreeMap<String, AduRange>)> {
        let mut remaining = self.config.max_payload_size;
        let mut room = self
            .config
            .payload_limit()
            .saturating_sub(FIXED_ENTRIES_FOOTPRINT);
        let mut adus = Vec::new();
        let mut ranges = BTreeMap::new();
        'apps: for app in self.send_store.apps(peer)? {
            for adu in self.send_store.read_from(peer, &app, 0)? {
                let adu = adu?;
                let footprint = archive::footprint(adu.size());
                if adu.size() > remaining || footprint > room {
                    break 'apps;
                }
                remaining -= adu.size();
                room -= footprint;
                ranges
                    .entry(app.clone())
                    .and_modify(|range: &mut AduRange| range.last = adu.id)
                    .or_insert(AduRange {
                        first: adu.id,
                        last: adu.id,
                    });
                adus.push(adu);
            }
        }
        Ok((adus, ranges))
    }

    /// Encrypt a payload on a copy of the session and commit the session.
    fn seal(&self, context: &mut PeerContext, payload: &Payload) -> Result<(String, Vec<u8>)> {
        let plain = payload.to_archive()?;
        let wire_id = payload.bundle_id.to_wire(context.id_cipher())?;

        let mut session = context.session().clone();
        let identity = self.keys.identity();
        let (chunks, signatures) =
            sealed::encrypt_payload(&mut session, identity, &plain, self.config.chunk_size)?;
        let sender_identity = wrap::wrap(&identity.public().to_bytes(), context.identity())?;
        let client_base = match self.keys.as_ref() {
            LocalKeys::Client { keys, .. } => Some(wrap::wrap(
                &keys.base.public_key().to_bytes(),
                context.identity(),
            )?),
            LocalKeys::Server(_) => None,
        };

        let bytes = SealedBundle {
            sender: self.config.role,
            wire_id: wire_id.clone(),
            chunks,
            signatures,
            sender_identity,
            client_base,
        }
        .to_bytes()?;
        self.registry.commit(context, session)?;
        Ok((wire_id, bytes))
    }

    fn emit(
        &self,
        context: &mut PeerContext,
        ack: Option<BundleId>,
        adus: Vec<Adu>,
        ranges: BTreeMap<String, AduRange>,
    ) -> Result<OutboundBundle> {
        let peer = context.peer().clone();
        let bundle_id = self.windows.next_id(&peer)?;
        let counter = bundle_id.counter(self.outgoing())?;
        let adu_count = adus.len();

        let payload = Payload {
            bundle_id: bundle_id.clone(),
            ack: ack.clone(),
            routing: None,
            adus,
        };
        let (wire_id, bytes) = self.seal(context, &payload)?;
        let record = SentRecord {
            counter,
            bundle_id: bundle_id.clone(),
            wire_id: wire_id.clone(),
            ack,
            adus: ranges,
        };
        self.ledger.record(&peer, &record, &bytes)?;
        self.windows.record_sent(&peer, &bundle_id)?;

        info!(
            "Generated bundle {counter} for {peer}: {adu_count} ADUs, {} bytes",
            bytes.len()
        );
        Ok(OutboundBundle {
            peer,
            bundle_id,
            counter,
            wire_id,
            bytes,
            retransmission: false,
        })
    }

    fn resend(&self, context: &mut PeerContext, counter: u64) -> Result<OutboundBundle> {
        let peer = context.peer().clone();
        let record = self
            .ledger
            .get(&peer, counter)?
            .ok_or_else(|| Error::SentRecordMissing {
                peer: peer.clone(),
                counter,
            })?;

        let bytes = match self.ledger.bytes(&peer, counter)? {
            Some(bytes) => bytes,
            None => {
                warn!("Cached bundle {counter} for {peer} is gone, rebuilding it");
                let payload = Payload {
                    bundle_id: record.bundle_id.clone(),
                    ack: record.ack.clone(),
                    routing: None,
                    adus: self.adus_of(&peer, &record)?,
                };
                let (_, bytes) = self.seal(context, &payload)?;
                self.ledger.cache_bytes(&peer, counter, &bytes)?;
                bytes
            }
        };

        info!("Resending bundle {counter} to {peer}");
        Ok(OutboundBundle {
            peer,
            bundle_id: record.bundle_id,
            counter,
            wire_id: record.wire_id,
            bytes,
            retransmission: true,
        })
    }

    /// ADUs a sent bundle carried, read back from the send store.
    fn adus_of(&self, peer: &PeerIdentity, record: &SentRecord) -> Result<Vec<Adu>> {
        let mut adus = Vec::new();
        for (app, range) in &record.adus {
            for adu in self.send_store.read_from(peer, app, range.first)? {
                let adu = adu?;
                if adu.id > range.last {
                    break;
                }
                adus.push(adu);
            }
        }
        Ok(adus)
    }

    fn inbound(&self, context: &mut PeerContext, sealed: &SealedBundle) -> Result<IngestOutcome> {
        let peer = context.peer().clone();
        let incoming = self.incoming();

        let bundle_id = BundleId::from_wire(&sealed.wire_id, context.id_cipher())?;
        if bundle_id.client(incoming)? != self.client_of(&peer) {
            return Err(Error::InvalidBundleId(format!(
                "bundle from {peer} names another client"
            )));
        }
        let counter = bundle_id.counter(incoming)?;
        let last = self.state.counter(&peer, incoming)?;
        if last.is_some_and(|last| counter <= last) {
            info!("Ignoring duplicate bundle {counter} from {peer}");
            return Ok(IngestOutcome::Duplicate { peer, counter });
        }

        let mut session = context.session().clone();
        let plain = sealed::decrypt_payload(
            &mut session,
            context.identity(),
            &sealed.chunks,
            &sealed.signatures,
        )?;
        let payload = Payload::from_archive(&plain, self.config.payload_limit())?;
        if payload.bundle_id != bundle_id {
            return Err(Error::MalformedBundle(format!(
                "payload of bundle {counter} from {peer} carries another id"
            )));
        }
        let acked = payload
            .ack
            .as_ref()
            .map(|ack| self.ack_counter(&peer, ack))
            .transpose()?;

        // Commit. Each step is idempotent; the session goes last.
        if !self.windows.contains(&peer) {
            self.windows.add_client(&peer, self.config.window_capacity)?;
        }
        let arrived = self.store_adus(&peer, payload.adus)?;
        if let Some(acked) = acked {
            self.apply_ack(&peer, acked)?;
        }
        if !self
            .state
            .compare_and_set_counter(&peer, incoming, last, counter)?
        {
            warn!("Counter of {peer} moved while bundle {counter} was processed");
        }
        self.registry.commit(context, session)?;

        let stored = arrived.values().map(Vec::len).sum();
        info!("Processed bundle {counter} from {peer}: {stored} new ADUs");
        self.notify(&peer, arrived);
        Ok(IngestOutcome::Processed {
            peer,
            bundle_id,
            counter,
            stored,
            acked,
        })
    }

    /// Wire ids in `held` naming bundles we sent to the peer of `context`.
    fn held_for(&self, context: &PeerContext, held: &BTreeSet<String>) -> BTreeSet<String> {
        let outgoing = self.outgoing();
        let client = self.client_of(context.peer());
        held.iter()
            .filter(|wire| {
                BundleId::from_wire(wire, context.id_cipher())
                    .and_then(|id| id.client(outgoing))
                    .is_ok_and(|owner| owner == client)
            })
            .cloned()
            .collect()
    }

    /// Counter of one of our bundles acknowledged by `peer`.
    fn ack_counter(&self, peer: &PeerIdentity, ack: &BundleId) -> Result<u64> {
        let outgoing = self.outgoing();
        if ack.client(outgoing)? != self.client_of(peer) {
            return Err(Error::InvalidBundleId(format!(
                "acknowledgement from {peer} names another client"
            )));
        }
        ack.counter(outgoing)
    }

    fn apply_ack(&self, peer: &PeerIdentity, acked: u64) -> Result<()> {
        let evicted = match self.windows.process_ack(peer, acked) {
            Ok(evicted) => evicted,
            Err(Error::Window(e @ WindowError::ReceivedOldAck { .. })) => {
                debug!("Ack from {peer}: {e}");
                return Ok(());
            }
            Err(Error::Window(e @ WindowError::ReceivedInvalidAck { .. })) => {
                warn!("Ack from {peer}: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let outgoing = self.outgoing();
        let counters = evicted
            .iter()
            .map(|id| id.counter(outgoing))
            .collect::<Result<Vec<u64>>>()?;
        let records = self.ledger.evict(peer, &counters)?;
        for (app, last) in highest_adus(&records) {
            self.send_store.delete_up_to(peer, &app, last)?;
        }
        debug!("{peer} acknowledged bundle {acked}, released {}", counters.len());
        Ok(())
    }

    fn store_adus(&self, peer: &PeerIdentity, adus: Vec<Adu>) -> Result<BTreeMap<String, Vec<Adu>>> {
        let mut arrived: BTreeMap<String, Vec<Adu>> = BTreeMap::new();
        for adu in adus {
            if self
                .receive_store
                .append_with_id(peer, &adu.app_id, adu.id, &adu.data)?
            {
                arrived.entry(adu.app_id.clone()).or_default().push(adu);
            }
        }
        Ok(arrived)
    }

    fn notify(&self, peer: &PeerIdentity, arrived: BTreeMap<String, Vec<Adu>>) {
        for (app_id, adus) in arrived {
            if let Some(adapter) = self.adapters.get(&app_id).map(|a| a.value().clone()) {
                if let Err(e) = adapter.deliver(peer, &adus) {
                    warn!("Adapter {app_id} failed to take ADUs from {peer}: {e}");
                }
            }
            // No subscribers is fine
            let _ = self.events.send(AduEvent::Arrived {
                peer: peer.clone(),
                app_id,
                adu_ids: adus.iter().map(|a| a.id).collect(),
            });
        }
        let _ = self
            .events
            .send(AduEvent::AllAppsProcessed { peer: peer.clone() });
    }
}
