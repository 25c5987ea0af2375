//! # DDD Crypto
//!
//! Cryptographic primitives for the DDD bundle protocol.
//!
//! This crate provides:
//! - Long-term identity keys and the peer identifier derived from them
//! - The three-line PEM-like key envelope used for key files
//! - An X3DH-style handshake between a client and a server
//! - A double ratchet session cipher with duplicate/legacy detection
//! - Encryption of bundle identifiers (probabilistic and deterministic)
//! - Ephemeral wrapping of the sender identity key
//!
//! Nothing in this crate touches the filesystem; persisting key files and
//! session records is the caller's job.
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | Identity / Signatures | Ed25519 (Montgomery form for DH) | 128-bit |
//! | Peer Identifier | SHA-1, base64url | naming only |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash / KDF | BLAKE3 | 128-bit |
//! | Id Key Derivation | Argon2id + XChaCha20-Poly1305 | 256-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod handshake;
pub mod hash;
pub mod id_cipher;
pub mod identity;
pub mod pem;
pub mod ratchet;
pub mod wrap;
pub mod x25519;

pub use error::CryptoError;
pub use identity::{IdentityKey, IdentityKeyPair, PeerIdentity, Signature};
pub use ratchet::RatchetSession;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// SHA-1 digest size, the raw length of a [`PeerIdentity`]
pub const PEER_ID_RAW_SIZE: usize = 20;
