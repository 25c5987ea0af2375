//! Bundle layout.
//!
//! A bundle is two nested deterministic tar archives: the outer
//! [`SealedBundle`] a transport carries, and the [`Payload`] it encrypts.
//! [`SentLedger`] remembers what was emitted so a bundle can be resent
//! unchanged.

pub mod archive;
pub mod ledger;
pub mod payload;
pub mod sealed;

pub use ledger::{AduRange, SentLedger, SentRecord};
pub use payload::Payload;
pub use sealed::SealedBundle;

/// File extension of bundles written for a transport.
/// Extension of bundle files handed to carriers.
pub const BUNDLE_EXTENSION: &str = "bundle";
