//! Per-peer crypto state.
//!
//! One [`PeerContext`] per remote peer, behind its own async mutex: holding
//! the lock is what serializes every ratchet step and window mutation for
//! that peer, while other peers proceed in parallel.
//!
//! A client first heard of through an inbound bundle is only pending until
//! that bundle has been verified and committed; see [`SessionRegistry::settle`].

use crate::error::{Error, Result};
use crate::keystore::LocalKeys;
use crate::store::SessionStore;
use dashmap::DashMap;
use ddd_crypto::handshake::{self, ClientPublicBundle};
use ddd_crypto::id_cipher::{IdCipher, IdKdfParams};
use ddd_crypto::x25519::PublicKey;
use ddd_crypto::{IdentityKey, PeerIdentity, RatchetSession};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Shared handle to one peer's state.
pub type PeerHandle = Arc<Mutex<PeerContext>>;

/// Persisted form: the peer identity travels with its ratchet record.
#[derive(Serialize, Deserialize)]
struct SessionEnvelope {
    identity: [u8; 32],
    ratchet: Vec<u8>,
}

/// Everything needed to talk to one peer.
pub struct PeerContext {
    peer: PeerIdentity,
    identity: IdentityKey,
    session: RatchetSession,
    id_cipher: IdCipher,
}

impl std::fmt::Debug for PeerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerContext")
            .field("peer", &self.peer)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl PeerContext {
    /// Peer identifier.
    #[must_use]
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Peer identity key.
    #[must_use]
    pub fn identity(&self) -> &IdentityKey {
        &self.identity
    }

    /// Committed ratchet state.
    #[must_use]
    pub fn session(&self) -> &RatchetSession {
        &self.session
    }

    /// Cipher for bundle ids exchanged with this peer.
    #[must_use]
    pub fn id_cipher(&self) -> &IdCipher {
        &self.id_cipher
    }
}

/// Registry of peer contexts, loaded lazily from a [`SessionStore`].
pub struct SessionRegistry {
    keys: Arc<LocalKeys>,
    store: Arc<dyn SessionStore>,
    params: IdKdfParams,
    peers: DashMap<PeerIdentity, PeerHandle>,
    /// New clients whose first bundle is still being processed
    pending: DashMap<PeerIdentity, PeerHandle>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("role", &self.keys.role())
            .field("peers", &self.peers.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Empty registry for `keys`.
    #[must_use]
    pub fn new(keys: Arc<LocalKeys>, store: Arc<dyn SessionStore>, params: IdKdfParams) -> Self {
        Self {
            keys,
            store,
            params,
            peers: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    fn context(&self, identity: IdentityKey, session: RatchetSession) -> Result<PeerContext> {
        let shared = self.keys.identity().agree(&identity)?;
        Ok(PeerContext {
            peer: identity.peer_id(),
            identity,
            session,
            id_cipher: IdCipher::derive(&shared, &self.params)?,
        })
    }

    fn insert(&self, context: PeerContext) -> PeerHandle {
        let peer = context.peer.clone();
        self.peers
            .entry(peer)
            .or_insert_with(|| Arc::new(Mutex::new(context)))
            .clone()
    }

    /// Context of a known peer, restoring it from the store if needed.
    ///
    /// # Errors
    ///
    /// Storage failures or a corrupt session record.
    pub fn get(&self, peer: &PeerIdentity) -> Result<Option<PeerHandle>> {
        if let Some(handle) = self.peers.get(peer) {
            return Ok(Some(handle.clone()));
        }
        let Some(record) = self.store.load_session(peer)? else {
            return Ok(None);
        };
        let envelope: SessionEnvelope = bincode::deserialize(&record)?;
        let identity = IdentityKey::from_bytes(&envelope.identity)?;
        if &identity.peer_id() != peer {
            return Err(Error::Config(format!(
                "session record of {peer} holds the key of {}",
                identity.peer_id()
            )));
        }
        let session = RatchetSession::from_record(&envelope.ratchet)?;
        debug!("Restored session for {peer}");
        Ok(Some(self.insert(self.context(identity, session)?)))
    }

    /// Context for the sender of an inbound bundle.
    ///
    /// A server accepts any client and runs the responder handshake with the
    /// base key the client sent; a client only talks to its provisioned
    /// server. Returns `None` for a sender this node cannot talk to.
    ///
    /// The context of a new client stays pending, invisible to [`get`] and
    /// [`peers`], until [`settle`] registers it.
    ///
    /// [`get`]: Self::get
    /// [`peers`]: Self::peers
    /// [`settle`]: Self::settle
    ///
    /// # Errors
    ///
    /// Storage failures, or a handshake failure for a new client.
    pub fn accept(
        &self,
        identity: &IdentityKey,
        client_base: Option<&PublicKey>,
    ) -> Result<Option<PeerHandle>> {
        let peer = identity.peer_id();
        if let Some(handle) = self.get(&peer)? {
            return Ok(Some(handle));
        }
        match self.keys.as_ref() {
            LocalKeys::Server(keys) => {
                if let Some(handle) = self.pending.get(&peer) {
                    return Ok(Some(handle.clone()));
                }
                let Some(base) = client_base else {
                    return Err(Error::MalformedBundle(format!(
                        "first bundle of {peer} carries no base key"
                    )));
                };
                let session = handshake::respond(
                    keys,
                    &ClientPublicBundle {
                        identity: *identity,
                        base: *base,
                    },
                )?;
                let context = self.context(*identity, session)?;
                debug!("Pending session for new client {peer}");
                Ok(Some(
                    self.pending
                        .entry(peer)
                        .or_insert_with(|| Arc::new(Mutex::new(context)))
                        .clone(),
                ))
            }
            LocalKeys::Client { server, .. } if server.identity == *identity => {
                Ok(Some(self.connect_server()?))
            }
            LocalKeys::Client { .. } => Ok(None),
        }
    }

    /// Client side: context for the provisioned server, running the
    /// initiator handshake on first use.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] on a server, storage or handshake failures.
    pub fn connect_server(&self) -> Result<PeerHandle> {
        let LocalKeys::Client { keys, server } = self.keys.as_ref() else {
            return Err(Error::Config("only a client connects to a server".into()));
        };
        let peer = server.identity.peer_id();
        if let Some(handle) = self.get(&peer)? {
            return Ok(handle);
        }
        let session = handshake::initiate(keys, server)?;
        let context = self.context(server.identity, session)?;
        // Persisted before first use; a restart must never re-run the handshake
        self.persist(&context.peer, &context.identity, &context.session)?;
        info!("Established session with server {peer}");
        Ok(self.insert(context))
    }

    fn persist(
        &self,
        peer: &PeerIdentity,
        identity: &IdentityKey,
        session: &RatchetSession,
    ) -> Result<()> {
        let envelope = SessionEnvelope {
            identity: identity.to_bytes(),
            ratchet: session.to_record()?,
        };
        self.store.store_session(peer, &bincode::serialize(&envelope)?)
    }

    /// Persist `session` as the new state of `context`, then install it.
    ///
    /// # Errors
    ///
    /// Storage failures; `context` is left unchanged.
    pub fn commit(&self, context: &mut PeerContext, session: RatchetSession) -> Result<()> {
        self.persist(&context.peer, &context.identity, &session)?;
        context.session = session;
        Ok(())
    }

    /// Finish an inbound bundle processed under `handle`.
    ///
    /// A pending context is registered when the bundle was `committed` and
    /// dropped otherwise, so bundles that fail verification leave nothing
    /// behind. No-op for contexts that were never pending.
    pub fn settle(&self, peer: &PeerIdentity, handle: &PeerHandle, committed: bool) {
        let was_pending = self
            .pending
            .remove_if(peer, |_, pending| Arc::ptr_eq(pending, handle))
            .is_some();
        if committed && was_pending {
            info!("New client {peer}");
            self.peers.entry(peer.clone()).or_insert_with(|| handle.clone());
        }
    }

    /// Peers with a context in memory.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use ddd_crypto::handshake::{ClientKeyBundle, ServerKeyBundle};
    use rand_core::OsRng;

    struct Pair {
        client: SessionRegistry,
        server: SessionRegistry,
        client_keys: ClientKeyBundle,
        server_store: Arc<MemoryStore>,
    }

    fn pair() -> Pair {
        let server_keys = ServerKeyBundle::generate(&mut OsRng);
        let client_keys = ClientKeyBundle::generate(&mut OsRng);
        let params = IdKdfParams::low_security();
        let server_store = Arc::new(MemoryStore::new());
        Pair {
            client: SessionRegistry::new(
                Arc::new(LocalKeys::Client {
                    keys: client_keys.clone(),
                    server: server_keys.public(),
                }),
                Arc::new(MemoryStore::new()),
                params,
            ),
            server: SessionRegistry::new(
                Arc::new(LocalKeys::Server(server_keys)),
                server_store.clone(),
                params,
            ),
            client_keys,
            server_store,
        }
    }

    #[tokio::test]
    async fn test_client_and_server_contexts_agree() {
        let p = pair();
        let client_side = p.client.connect_server().unwrap();
        let public = p.client_keys.public();
        let server_side = p
            .server
            .accept(&public.identity, Some(&public.base))
            .unwrap()
            .unwrap();

        let mut c = client_side.lock().await;
        let mut s = server_side.lock().await;
        assert_eq!(s.peer(), &p.client_keys.identity.peer_id());

        // Both ends derive the same id cipher
        let wire = c.id_cipher().encrypt_deterministic("bundle").unwrap();
        assert_eq!(s.id_cipher().decrypt(&wire).unwrap(), "bundle");

        let mut next = c.session().clone();
        let msg = next.encrypt(b"hello").unwrap();
        p.client.commit(&mut c, next).unwrap();
        let mut next = s.session().clone();
        assert_eq!(next.decrypt(&msg).unwrap(), b"hello");
        p.server.commit(&mut s, next).unwrap();
    }

    #[tokio::test]
    async fn test_committed_session_survives_restart() {
        let p = pair();
        let public = p.client_keys.public();
        let handle = p
            .server
            .accept(&public.identity, Some(&public.base))
            .unwrap()
            .unwrap();
        {
            let mut ctx = handle.lock().await;
            let session = ctx.session().clone();
            p.server.commit(&mut ctx, session).unwrap();
        }

        let keys = Arc::new(LocalKeys::Server(ServerKeyBundle::generate(&mut OsRng)));
        let restarted = SessionRegistry::new(keys, p.server_store.clone(), IdKdfParams::low_security());
        let peer = p.client_keys.identity.peer_id();
        let restored = restarted.get(&peer).unwrap().unwrap();
        assert_eq!(restored.lock().await.identity(), &public.identity);
    }

    #[tokio::test]
    async fn test_new_client_registered_only_once_committed() {
        let p = pair();
        let public = p.client_keys.public();
        let peer = public.identity.peer_id();

        let handle = p
            .server
            .accept(&public.identity, Some(&public.base))
            .unwrap()
            .unwrap();
        assert!(p.server.peers().is_empty());
        assert!(p.server.get(&peer).unwrap().is_none());

        // A second bundle of the same client shares the pending context
        let again = p
            .server
            .accept(&public.identity, Some(&public.base))
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&handle, &again));

        p.server.settle(&peer, &handle, false);
        assert!(p.server.peers().is_empty());
        assert!(p.server.pending.is_empty());
        assert!(p.server_store.load_session(&peer).unwrap().is_none());

        let handle = p
            .server
            .accept(&public.identity, Some(&public.base))
            .unwrap()
            .unwrap();
        {
            let mut ctx = handle.lock().await;
            let session = ctx.session().clone();
            p.server.commit(&mut ctx, session).unwrap();
        }
        p.server.settle(&peer, &handle, true);
        assert_eq!(p.server.peers(), vec![peer.clone()]);
        assert!(Arc::ptr_eq(&p.server.get(&peer).unwrap().unwrap(), &handle));
    }

    #[test]
    fn test_server_requires_base_key() {
        let p = pair();
        let identity = p.client_keys.identity.public();
        assert!(matches!(
            p.server.accept(&identity, None),
            Err(Error::MalformedBundle(_))
        ));
    }

    #[test]
    fn test_client_ignores_unknown_sender() {
        let p = pair();
        let stranger = ServerKeyBundle::generate(&mut OsRng);
        assert!(p.client.accept(&stranger.identity.public(), None).unwrap().is_none());
        assert!(p.client.get(&stranger.identity.peer_id()).unwrap().is_none());
    }
}
