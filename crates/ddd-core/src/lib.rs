//! # DDD Core
//!
//! Bundle layer of DDD (Disconnection/Delay-tolerant Data Delivery).
//!
//! This crate provides:
//! - Bundle ids: counter encoding, ordering and encrypted wire form
//! - Per-peer sliding windows with persisted counters
//! - The ADU store applications exchange data through
//! - Bundle assembly, sealing and the sent ledger
//! - [`BundleTransmission`], which decides what to send and ingests what
//!   arrived
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      BundleTransmission                          │
//! │   (what to send per peer, what to do with what arrived)          │
//! ├────────────────────────────┬────────────────────────────────────┤
//! │  WindowTable · SentLedger  │  SessionRegistry (ratchet, id key) │
//! ├────────────────────────────┴────────────────────────────────────┤
//! │           AduStore · StateStore · SessionStore                   │
//! │   (files under the state directory, written atomically)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Carriers (USB sticks, phones passing by, an occasional link) are not part
//! of this crate: they move the bytes of an [`OutboundBundle`] and hand
//! received bytes to [`BundleTransmission::ingest`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod adu;
pub mod bundle;
pub mod bundle_id;
pub mod config;
pub mod error;
pub mod keystore;
pub mod registry;
pub mod store;
pub mod transmission;
pub mod window;

pub use adapter::{AduEvent, ApplicationAdapter};
pub use adu::{Adu, AduStore};
pub use bundle_id::{BundleId, Direction};
pub use config::{Role, TransmissionConfig};
pub use error::{Error, Result, WindowError};
pub use keystore::LocalKeys;
pub use store::{FileStore, MemoryStore, SessionStore, StateStore};
pub use transmission::{BundleTransmission, IngestOutcome, OutboundBundle, TransportExchange};
pub use window::{WindowState, WindowTable};
