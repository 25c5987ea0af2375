//! Sliding window flow control.
//!
//! Each peer gets a fixed-capacity queue of the bundle ids that
//! were sent but not yet acknowledged:
//!
//! ```text
//!            start                 end
//!              v                    v
//!   ... acked | in flight (<= capacity) | next to allocate ...
//! ```
//!
//! - OPEN (`end - start < capacity`): a new bundle may take counter `end`
//! - FULL (`end - start == capacity`): nothing new; the orchestrator resends
//!   the bundle at `end - 1`
//!
//! Counter arithmetic wraps, and acks are classified by their unsigned
//! distance from `start`. Every mutation through [`WindowTable`] is
//! persisted before it becomes visible.

use crate::bundle_id::{BundleId, Direction};
use crate::error::{Error, Result, WindowError};
use crate::store::StateStore;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ddd_crypto::PeerIdentity;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Persisted window counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Oldest unacknowledged counter
    pub start: u64,
    /// Next counter to allocate
    pub end: u64,
    /// Maximum bundles in flight
    pub capacity: u64,
}

impl WindowState {
    /// Bundles currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.end.wrapping_sub(self.start)
    }

    /// Whether no new counter may be allocated.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.in_flight() == self.capacity
    }
}

/// Window of one peer.
#[derive(Debug, Clone)]
pub struct Window {
    client: PeerIdentity,
    direction: Direction,
    state: WindowState,
    /// Ids of counters `start..end`, oldest first
    sent: VecDeque<BundleId>,
}

impl Window {
    /// Empty window whose ids are minted for `client` in `direction`.
    /// A zero capacity is clamped to one.
    #[must_use]
    pub fn new(client: PeerIdentity, direction: Direction, capacity: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            client,
            direction,
            state: WindowState {
                start: 0,
                end: 0,
                capacity,
            },
            sent: VecDeque::with_capacity(slot_count(capacity)),
        }
    }

    /// Rebuild from persisted counters; in-flight ids are recomputed since
    /// they are a pure function of (client, counter, direction).
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for inconsistent counters.
    pub fn restore(client: PeerIdentity, direction: Direction, state: WindowState) -> Result<Self> {
        if state.capacity == 0 || state.in_flight() > state.capacity {
            return Err(Error::Config(format!(
                "window {}..{} does not fit capacity {}",
                state.start, state.end, state.capacity
            )));
        }
        let mut window = Self::new(client, direction, state.capacity);
        window.state = state;
        for i in 0..state.in_flight() {
            let counter = state.start.wrapping_add(i);
            window
                .sent
                .push_back(BundleId::encode(&window.client, counter, direction)?);
        }
        Ok(window)
    }

    /// Current counters.
    #[must_use]
    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Whether no new counter may be allocated.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.state.is_full()
    }

    /// Id the next new bundle would carry.
    ///
    /// # Errors
    ///
    /// [`WindowError::BufferOverflow`] when full.
    pub fn next_id(&self) -> Result<BundleId> {
        if self.is_full() {
            return Err(WindowError::BufferOverflow {
                capacity: self.state.capacity,
            }
            .into());
        }
        BundleId::encode(&self.client, self.state.end, self.direction)
    }

    /// Most recently sent id, if it is still in flight.
    #[must_use]
    pub fn latest(&self) -> Option<&BundleId> {
        self.sent.back()
    }

    /// Ids in flight, oldest first.
    pub fn in_flight(&self) -> impl Iterator<Item = &BundleId> + '_ {
        self.sent.iter()
    }

    /// Record that the bundle at `end` was handed over for sending.
    ///
    /// # Errors
    ///
    /// [`WindowError::BufferOverflow`] when full,
    /// [`WindowError::OutOfSequence`] if `id` does not carry `end`.
    pub fn record_sent(&mut self, id: &BundleId) -> Result<()> {
        if self.is_full() {
            return Err(WindowError::BufferOverflow {
                capacity: self.state.capacity,
            }
            .into());
        }
        let counter = id.counter(self.direction)?;
        if counter != self.state.end {
            return Err(WindowError::OutOfSequence {
                expected: self.state.end,
                actual: counter,
            }
            .into());
        }
        self.sent.push_back(id.clone());
        self.state.end = self.state.end.wrapping_add(1);
        Ok(())
    }

    /// Apply an acknowledgement; returns the ids it released, oldest first.
    ///
    /// # Errors
    ///
    /// [`WindowError::ReceivedOldAck`] if already acknowledged,
    /// [`WindowError::ReceivedInvalidAck`] if never sent. The window is
    /// unchanged in both cases.
    pub fn process_ack(&mut self, acked: u64) -> std::result::Result<Vec<BundleId>, WindowError> {
        let WindowState { start, end, .. } = self.state;
        let offset = acked.wrapping_sub(start);
        if offset >= self.state.in_flight() {
            // Behind `start` by less than half the counter space: already acked.
            let behind = start.wrapping_sub(acked);
            if behind != 0 && behind <= u64::MAX / 2 {
                return Err(WindowError::ReceivedOldAck { acked, start });
            }
            return Err(WindowError::ReceivedInvalidAck { acked, end });
        }

        // offset < in_flight <= capacity, and `sent` holds in_flight ids
        let released = usize::try_from(offset + 1).unwrap_or(usize::MAX);
        let evicted: Vec<BundleId> = self.sent.drain(..released.min(self.sent.len())).collect();
        self.state.start = acked.wrapping_add(1);
        Ok(evicted)
    }
}

fn slot_count(capacity: u64) -> usize {
    // preallocate modestly; large capacities grow on demand
    usize::try_from(capacity.min(1024)).unwrap_or(1024)
}

/// Windows of every peer, persisted through a [`StateStore`].
pub struct WindowTable {
    windows: DashMap<PeerIdentity, Window>,
    store: Arc<dyn StateStore>,
    direction: Direction,
    local: PeerIdentity,
}

impl std::fmt::Debug for WindowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowTable")
            .field("peers", &self.windows.len())
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl WindowTable {
    /// Table for bundles this node sends in `direction`; `local` is this
    /// node's identity (the client id of upstream bundle ids).
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, direction: Direction, local: PeerIdentity) -> Self {
        Self {
            windows: DashMap::new(),
            store,
            direction,
            local,
        }
    }

    /// Table with every window found in the store.
    ///
    /// # Errors
    ///
    /// Storage failures or inconsistent persisted counters.
    pub fn restore(
        store: Arc<dyn StateStore>,
        direction: Direction,
        local: PeerIdentity,
    ) -> Result<Self> {
        let table = Self::new(store, direction, local);
        for (peer, state) in table.store.windows()? {
            let window = Window::restore(table.client_of(&peer), direction, state)?;
            debug!(
                "Restored window for {peer}: {}..{} of {}",
                state.start, state.end, state.capacity
            );
            table.windows.insert(peer, window);
        }
        Ok(table)
    }

    /// Direction of the bundles this table tracks.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn client_of(&self, peer: &PeerIdentity) -> PeerIdentity {
        match self.direction {
            Direction::Upstream => self.local.clone(),
            Direction::Downstream => peer.clone(),
        }
    }

    /// Start tracking `peer`.
    ///
    /// # Errors
    ///
    /// [`WindowError::ClientAlreadyExists`] if already tracked, or a
    /// storage failure.
    pub fn add_client(&self, peer: &PeerIdentity, capacity: u64) -> Result<()> {
        match self.windows.entry(peer.clone()) {
            Entry::Occupied(_) => Err(WindowError::ClientAlreadyExists(peer.clone()).into()),
            Entry::Vacant(vacant) => {
                let window = Window::new(self.client_of(peer), self.direction, capacity);
                self.store.set_window(peer, &window.state())?;
                vacant.insert(window);
                Ok(())
            }
        }
    }

    /// Whether `peer` is tracked.
    #[must_use]
    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.windows.contains_key(peer)
    }

    /// Tracked peers, sorted.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<PeerIdentity> = self.windows.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    fn with<T>(&self, peer: &PeerIdentity, f: impl FnOnce(&Window) -> T) -> Result<T> {
        self.windows
            .get(peer)
            .map(|w| f(w.value()))
            .ok_or_else(|| WindowError::ClientWindowNotFound(peer.clone()).into())
    }

    /// Apply `f` to a copy of the window, persist it, then commit.
    fn mutate<T>(
        &self,
        peer: &PeerIdentity,
        f: impl FnOnce(&mut Window) -> Result<T>,
    ) -> Result<T> {
        let mut entry = self
            .windows
            .get_mut(peer)
            .ok_or_else(|| WindowError::ClientWindowNotFound(peer.clone()))?;
        let mut next = entry.clone();
        let out = f(&mut next)?;
        self.store.set_window(peer, &next.state())?;
        *entry = next;
        Ok(out)
    }

    /// Record a bundle handed to the transport.
    ///
    /// # Errors
    ///
    /// See [`Window::record_sent`]; [`WindowError::ClientWindowNotFound`].
    pub fn record_sent(&self, peer: &PeerIdentity, id: &BundleId) -> Result<()> {
        self.mutate(peer, |w| w.record_sent(id))
    }

    /// Apply an acknowledgement from `peer`.
    ///
    /// # Errors
    ///
    /// See [`Window::process_ack`]; [`WindowError::ClientWindowNotFound`].
    pub fn process_ack(&self, peer: &PeerIdentity, acked: u64) -> Result<Vec<BundleId>> {
        self.mutate(peer, |w| Ok(w.process_ack(acked)?))
    }

    /// Whether `peer`'s window is full.
    ///
    /// # Errors
    ///
    /// [`WindowError::ClientWindowNotFound`].
    pub fn is_full(&self, peer: &PeerIdentity) -> Result<bool> {
        self.with(peer, Window::is_full)
    }

    /// Counters of `peer`'s window.
    ///
    /// # Errors
    ///
    /// [`WindowError::ClientWindowNotFound`].
    pub fn state(&self, peer: &PeerIdentity) -> Result<WindowState> {
        self.with(peer, Window::state)
    }

    /// Id the next new bundle for `peer` would carry.
    ///
    /// # Errors
    ///
    /// [`WindowError::ClientWindowNotFound`], or full window.
    pub fn next_id(&self, peer: &PeerIdentity) -> Result<BundleId> {
        self.with(peer, Window::next_id)?
    }

    /// Most recent in-flight id for `peer`.
    ///
    /// # Errors
    ///
    /// [`WindowError::ClientWindowNotFound`].
    pub fn latest(&self, peer: &PeerIdentity) -> Result<Option<BundleId>> {
        self.with(peer, |w| w.latest().cloned())
    }
}
